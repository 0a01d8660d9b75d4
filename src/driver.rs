// SPDX-License-Identifier: GPL-3.0-only

//! Process driver: startup, event loop, reload and shutdown

use std::sync::Arc;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::accounts::{CredentialStore, open_user_db};
use crate::config::{Cli, PipelineConfig, Settings};
use crate::constants::app_info;
use crate::constants::lease::SWEEP_INTERVAL;
use crate::constants::timing::{
    LISTENER_GRACE, MAX_EVENTS_PER_TICK, POLL_INTERVAL, SHUTDOWN_TIMEOUT,
};
use crate::control::ProcessControl;
use crate::errors::{AppError, AppResult};
use crate::lease::{LeaseManager, SharedLeaseManager};
use crate::logging::LogHandle;
use crate::pipeline::graph::MediaGraph;
use crate::pipeline::simulated::SimulatedGraph;
use crate::pipeline::{Pipeline, SharedPipeline};
use crate::server::{self, AppState, ControlServer};
use crate::stats::{StatsSource, SystemStats};

#[cfg(feature = "gstreamer")]
fn native_graph() -> AppResult<Box<dyn MediaGraph>> {
    let graph = crate::pipeline::gst::GstGraph::new().map_err(|e| AppError::Construction(e.to_string()))?;
    Ok(Box::new(graph))
}

#[cfg(not(feature = "gstreamer"))]
fn native_graph() -> AppResult<Box<dyn MediaGraph>> {
    Err(AppError::Construction(
        "built without the gstreamer feature; run with --simulate-graph".into(),
    ))
}

fn make_graph(settings: &Settings) -> AppResult<Box<dyn MediaGraph>> {
    if settings.simulate_graph {
        warn!("Using the simulated media graph, no camera will be opened");
        return Ok(Box::new(SimulatedGraph::new()));
    }
    native_graph()
}

fn open_credentials(settings: &Settings) -> AppResult<Arc<dyn CredentialStore>> {
    Ok(Arc::from(open_user_db(&settings.server.user_db)?))
}

/// Hand new capture and recording settings to the engine
///
/// A failed rebuild leaves the engine without a recording branch, which the
/// process cannot run without.
fn apply_pipeline_config(pipeline: &SharedPipeline, config: PipelineConfig) -> AppResult<()> {
    pipeline.lock().set_config(config).map_err(|e| {
        error!(error = %e, "Failed to apply pipeline configuration");
        AppError::Construction(e.to_string())
    })
}

struct Runtime {
    settings: Settings,
    pipeline: SharedPipeline,
    leases: SharedLeaseManager,
    credentials: Arc<dyn CredentialStore>,
    stats: Arc<dyn StatsSource>,
    server: Option<ControlServer>,
}

impl Runtime {
    async fn start_listeners(&mut self) -> AppResult<()> {
        let state = AppState {
            leases: Arc::clone(&self.leases),
            credentials: Arc::clone(&self.credentials),
            stats: Arc::clone(&self.stats),
        };
        let router = server::router(
            state,
            &self.settings.server.mount_point,
            &self.settings.server.recording_dir,
        );
        self.server = Some(ControlServer::start(&self.settings.server, router).await?);
        Ok(())
    }

    async fn stop_listeners(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop(LISTENER_GRACE).await;
        }
    }

    fn drain_pipeline_events(&self) {
        let mut pipeline = self.pipeline.lock();
        for _ in 0..MAX_EVENTS_PER_TICK {
            if pipeline.poll(std::time::Duration::ZERO).is_none() {
                break;
            }
        }
    }

    /// Re-read configuration and restart what it affects
    ///
    /// A configuration that fails to load leaves the running one in place. A
    /// pipeline that cannot be rebuilt, or listeners that cannot bind, are
    /// returned as errors.
    async fn reload(&mut self, cli: &Cli, log: &LogHandle) -> AppResult<()> {
        warn!("Reloading configuration");
        let settings = match Settings::load(cli) {
            Ok(settings) => settings,
            Err(e) => {
                error!(error = %e, "Configuration reload failed, keeping current settings");
                return Ok(());
            }
        };

        log.set_level(&settings.logging.level);
        self.stop_listeners().await;

        apply_pipeline_config(&self.pipeline, settings.pipeline.clone())?;
        self.leases.lock().set_policy(settings.lease.clone());
        match open_credentials(&settings) {
            Ok(credentials) => self.credentials = credentials,
            Err(e) => error!(error = %e, "Keeping previous user database"),
        }

        self.settings = settings;
        self.start_listeners().await?;
        info!("Configuration reloaded");
        Ok(())
    }
}

/// Run the server until a termination request; returns the exit code
pub async fn run(
    cli: Cli,
    settings: Settings,
    control: Arc<ProcessControl>,
    log: LogHandle,
) -> AppResult<i32> {
    info!("{}", app_info::runtime_description());
    match &settings.config_file {
        Some(path) => info!(path = %path.display(), "Configuration file loaded"),
        None => warn!(path = %cli.config.display(), "Configuration file not found, using defaults"),
    }

    let mut pipeline = Pipeline::new(settings.pipeline.clone(), make_graph(&settings)?);
    pipeline
        .construct()
        .map_err(|e| AppError::Construction(e.to_string()))?;
    pipeline.start()?;
    let pipeline = pipeline.into_shared();

    let leases = LeaseManager::new(Arc::clone(&pipeline), settings.lease.clone()).into_shared();
    let credentials = open_credentials(&settings)?;

    let mut runtime = Runtime {
        settings,
        pipeline,
        leases,
        credentials,
        stats: Arc::new(SystemStats::new()),
        server: None,
    };
    runtime.start_listeners().await?;

    let mut poll_tick = interval(POLL_INTERVAL);
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_tick = interval(SWEEP_INTERVAL);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !control.should_terminate() {
        tokio::select! {
            _ = poll_tick.tick() => runtime.drain_pipeline_events(),
            _ = sweep_tick.tick() => {
                let expired = runtime.leases.lock().sweep_expired();
                if expired > 0 {
                    info!(expired, "Expired leases removed");
                }
            }
        }

        if control.take_reload()
            && let Err(e) = runtime.reload(&cli, &log).await
        {
            error!(error = %e, "Reload failed, terminating");
            control.request_terminate(1);
        }
    }

    info!("Shutting down");
    runtime.stop_listeners().await;
    if let Err(e) = runtime.pipeline.lock().shutdown(SHUTDOWN_TIMEOUT) {
        error!(error = %e, "Pipeline shutdown failed");
    }

    Ok(control.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::names;
    use crate::pipeline::simulated::FailPoint;

    fn shared_pipeline(dir: &std::path::Path) -> (SharedPipeline, SimulatedGraph) {
        let graph = SimulatedGraph::new();
        let config = PipelineConfig {
            recording_path: dir.to_path_buf(),
            ..PipelineConfig::default()
        };
        let mut pipeline = Pipeline::new(config, Box::new(graph.clone()));
        pipeline.construct().unwrap();
        pipeline.start().unwrap();
        (pipeline.into_shared(), graph)
    }

    #[test]
    fn failed_rebuild_on_reload_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, graph) = shared_pipeline(dir.path());
        let mut config = pipeline.lock().config().clone();
        config.height = 720;

        graph.fail_on(FailPoint::BuildStage(names::FAN_OUT.to_string()));
        let result = apply_pipeline_config(&pipeline, config.clone());
        assert!(matches!(result, Err(AppError::Construction(_))));

        graph.clear_failures();
        apply_pipeline_config(&pipeline, config).unwrap();
        assert!(pipeline.lock().is_running().unwrap());
    }

    #[test]
    fn simulated_graph_needs_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let cli = <Cli as clap::Parser>::parse_from([
            "pitv-server",
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
            "--simulate-graph",
        ]);
        let settings = Settings::load(&cli).unwrap();
        assert!(make_graph(&settings).is_ok());
    }
}
