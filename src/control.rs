// SPDX-License-Identifier: MPL-2.0

//! Process-wide termination and reload requests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Flags set from signal handlers and read by the driver loop
#[derive(Debug, Default)]
pub struct ProcessControl {
    terminate: AtomicBool,
    reload: AtomicBool,
    exit_code: AtomicI32,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_terminate(&self, exit_code: i32) {
        self.exit_code.store(exit_code, Ordering::SeqCst);
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reload request
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

/// Listen for SIGINT, SIGTERM and SIGHUP and translate them into requests
#[cfg(unix)]
pub fn spawn_signal_listener(control: Arc<ProcessControl>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("Interrupt received, shutting down");
                    control.request_terminate(0);
                }
                _ = terminate.recv() => {
                    warn!("Termination signal received, shutting down");
                    control.request_terminate(libc::SIGTERM);
                }
                _ = hangup.recv() => {
                    warn!("Configuration reload requested");
                    control.request_reload();
                }
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(control: Arc<ProcessControl>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Ctrl-C handler unavailable");
                return;
            }
            info!("Interrupt received, shutting down");
            control.request_terminate(0);
        }
    }))
}
