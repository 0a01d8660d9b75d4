// SPDX-License-Identifier: MPL-2.0

//! Host load and temperature for the status endpoint

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Components, Pid, System};
use tracing::debug;

/// Flat status reply; each metric carries its own availability flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub temp_cpu_ok: bool,
    pub temp_cpu: f64,
    pub cpu_load_process_ok: bool,
    pub cpu_load_process: f64,
    pub cpu_load_total_ok: bool,
    pub cpu_load_total: f64,
}

impl StatusSnapshot {
    pub fn from_metrics(temp_cpu: Option<f64>, process: Option<f64>, total: Option<f64>) -> Self {
        Self {
            temp_cpu_ok: temp_cpu.is_some(),
            temp_cpu: temp_cpu.unwrap_or_default(),
            cpu_load_process_ok: process.is_some(),
            cpu_load_process: process.unwrap_or_default(),
            cpu_load_total_ok: total.is_some(),
            cpu_load_total: total.unwrap_or_default(),
        }
    }
}

/// Source of host metrics; any metric may be unavailable
pub trait StatsSource: Send + Sync {
    /// CPU temperature in degrees Celsius
    fn cpu_temperature(&self) -> Option<f64>;

    /// CPU usage of this process in percent
    fn process_cpu_load(&self) -> Option<f64>;

    /// Average CPU usage over all cores in percent
    fn total_cpu_load(&self) -> Option<f64>;

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::from_metrics(
            self.cpu_temperature(),
            self.process_cpu_load(),
            self.total_cpu_load(),
        )
    }
}

const THERMAL_LABELS: [&str; 4] = ["CPU", "Core", "cpu_thermal", "soc"];

/// Metrics read through `sysinfo`
pub struct SystemStats {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for SystemStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemStats {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| debug!(error = %e, "Process id unavailable"))
            .ok();
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            pid,
        }
    }
}

impl StatsSource for SystemStats {
    fn cpu_temperature(&self) -> Option<f64> {
        let components = Components::new_with_refreshed_list();
        components
            .iter()
            .find(|c| THERMAL_LABELS.iter().any(|label| c.label().contains(label)))
            .map(|c| f64::from(c.temperature()))
            .filter(|t| t.is_finite())
    }

    fn process_cpu_load(&self) -> Option<f64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| f64::from(p.cpu_usage()))
    }

    fn total_cpu_load(&self) -> Option<f64> {
        let mut system = self.system.lock();
        system.refresh_cpu();
        let cpus = system.cpus();
        if cpus.is_empty() {
            return None;
        }
        let sum: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
        Some(f64::from(sum / cpus.len() as f32))
    }
}
