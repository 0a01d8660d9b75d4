// SPDX-License-Identifier: MPL-2.0

//! HTTP control plane
//!
//! One router serves every configured listener, plain or TLS:
//!
//! - `<mount point>`: lease management, Basic auth, POST only
//! - `/status`: host load and temperature, unauthenticated
//! - `/index.html`: liveness check
//! - anything else: finished recording fragments from the recording directory

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{any, get};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::accounts::CredentialStore;
use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::lease::SharedLeaseManager;
use crate::net::{ListenAddr, Scheme};
use crate::stats::StatsSource;

#[derive(Clone)]
pub struct AppState {
    pub leases: SharedLeaseManager,
    pub credentials: Arc<dyn CredentialStore>,
    pub stats: Arc<dyn StatsSource>,
}

pub fn router(state: AppState, mount_point: &str, recording_dir: &Path) -> Router {
    Router::new()
        .route(mount_point, any(handlers::camera))
        .route("/status", any(handlers::status))
        .route("/index.html", get(handlers::index))
        .fallback_service(ServeDir::new(recording_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Running listeners sharing one router
pub struct ControlServer {
    handles: Vec<Handle>,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl ControlServer {
    /// Bind every configured listener
    ///
    /// Listeners that fail to bind are logged and skipped; at least one must
    /// come up.
    pub async fn start(config: &ServerConfig, router: Router) -> AppResult<Self> {
        let tls = if config.needs_tls() {
            let tls = RustlsConfig::from_pem_file(&config.tls_cert, &config.tls_key)
                .await
                .map_err(|e| {
                    AppError::Server(format!(
                        "failed to load TLS material {} / {}: {}",
                        config.tls_cert.display(),
                        config.tls_key.display(),
                        e
                    ))
                })?;
            info!(cert = %config.tls_cert.display(), "TLS material loaded");
            Some(tls)
        } else {
            None
        };

        let mut server = Self {
            handles: Vec::new(),
            tasks: Vec::new(),
            local_addrs: Vec::new(),
        };

        for listener in &config.listeners {
            let handle = Handle::new();
            let task = spawn_listener(*listener, router.clone(), handle.clone(), tls.clone());

            match handle.listening().await {
                Some(local) => {
                    info!(url = %listener, local = %local, "Listening");
                    server.local_addrs.push(local);
                }
                None => error!(url = %listener, "Failed to bind listener"),
            }
            server.handles.push(handle);
            server.tasks.push(task);
        }

        if server.local_addrs.is_empty() {
            return Err(AppError::Server("no listener could be started".into()));
        }
        Ok(server)
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting connections and wait for the listeners to finish
    pub async fn stop(self, grace: Duration) {
        for handle in &self.handles {
            handle.graceful_shutdown(Some(grace));
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Listener task failed");
            }
        }
        info!("Listeners stopped");
    }
}

fn spawn_listener(
    listener: ListenAddr,
    router: Router,
    handle: Handle,
    tls: Option<RustlsConfig>,
) -> JoinHandle<()> {
    let app = router.into_make_service();
    match (listener.scheme, tls) {
        (Scheme::Https, Some(tls)) => tokio::spawn(async move {
            if let Err(e) = axum_server::bind_rustls(listener.addr, tls)
                .handle(handle)
                .serve(app)
                .await
            {
                error!(url = %listener, error = %e, "Listener stopped with error");
            }
        }),
        _ => tokio::spawn(async move {
            if let Err(e) = axum_server::bind(listener.addr)
                .handle(handle)
                .serve(app)
                .await
            {
                error!(url = %listener, error = %e, "Listener stopped with error");
            }
        }),
    }
}
