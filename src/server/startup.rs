//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! run a real hub on an ephemeral port, drive its HTTP and WebSocket
//! endpoints, and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::device::Manager;
use crate::metrics::MetricsRegistry;
use crate::server::http::{self, HubState, DEFAULT_MAX_BODY_BYTES};

/// Everything needed to start the hub.
pub struct ServerConfig {
    pub manager: Manager,
    pub metrics: Arc<MetricsRegistry>,
    pub bind_address: SocketAddr,
    pub default_route_timeout: Duration,
    pub max_body_bytes: usize,
}

impl ServerConfig {
    /// Build from a loaded [`Config`].
    pub fn from_config(
        config: &Config,
        manager: Manager,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, std::net::AddrParseError> {
        Ok(ServerConfig {
            manager,
            metrics,
            bind_address: config.server.address.parse()?,
            default_route_timeout: Duration::from_millis(config.device.default_route_timeout_ms),
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    /// Minimal config for integration tests, bound to `127.0.0.1:0`.
    pub fn for_testing(manager: Manager, metrics: Arc<MetricsRegistry>) -> Self {
        ServerConfig {
            manager,
            metrics,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            default_route_timeout: Duration::from_secs(5),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    manager: Manager,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port` URL of the device connect endpoint.
    pub fn connect_url(&self) -> String {
        format!("ws://{}/api/v2/device", self.local_addr)
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Stop accepting requests, disconnect every device, then await the
    /// server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        let disconnected = self.manager.disconnect_all();
        info!(target: "hub", disconnected, "shutting down");

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(target: "hub", "server task returned error: {}", e),
            Ok(Err(e)) => error!(target: "hub", "server task panicked: {}", e),
            Err(_) => warn!(target: "hub", "server task did not finish within 5s"),
        }
    }
}

/// Bind and start the hub from a fully assembled [`ServerConfig`].
pub async fn run_server_with_config(config: ServerConfig) -> Result<ServerHandle, std::io::Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = HubState::new(config.manager.clone(), config.metrics)
        .with_route_timeout(config.default_route_timeout);
    let app = http::create_router(state, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: "hub", address = %local_addr, "listening");

    let mut shutdown_watch = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        manager: config.manager,
        server_task,
    })
}
