//! Broker wiring: listeners, shared state and the accept loops

use crate::config::ServerConfig;
use crate::heartbeat::HeartbeatPolicy;
use crate::public::{ProxyBinder, TcpProxyBinder};
use crate::session::handle_control_connection;
use crate::workconn::{run_data_listener, WorkConnMultiplexer};
use portbridge_auth::TokenValidator;
use portbridge_router::ProxyRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {role} listener on {addr}: {source}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{addr}\n  • Try a different address or port")]
    Bind {
        role: &'static str,
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state handed to every session task
pub struct ServerState {
    pub registry: Arc<ProxyRegistry>,
    pub mux: Arc<WorkConnMultiplexer>,
    pub validator: Arc<dyn TokenValidator>,
    pub binder: Arc<dyn ProxyBinder>,
    pub heartbeat: HeartbeatPolicy,
    pub work_conn_timeout: Duration,
    pub auth_deadline: Duration,
    /// Broker-wide shutdown; session loops observe it so a stopping broker
    /// tears every session down instead of orphaning them
    pub shutdown: CancellationToken,
}

/// The tunnel broker server
pub struct Server {
    state: Arc<ServerState>,
    control_listener: TcpListener,
    data_listener: TcpListener,
    control_addr: SocketAddr,
    data_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the control and data listeners and assemble the shared state
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let control_listener =
            TcpListener::bind(&config.control_bind)
                .await
                .map_err(|source| ServerError::Bind {
                    role: "control",
                    addr: config.control_bind.clone(),
                    source,
                })?;
        let control_addr = control_listener.local_addr()?;

        let data_listener =
            TcpListener::bind(&config.data_bind)
                .await
                .map_err(|source| ServerError::Bind {
                    role: "data",
                    addr: config.data_bind.clone(),
                    source,
                })?;
        let data_addr = data_listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let state = Arc::new(ServerState {
            registry: Arc::new(ProxyRegistry::new()),
            mux: Arc::new(WorkConnMultiplexer::new()),
            validator: config.token_validator(),
            binder: Arc::new(TcpProxyBinder::new(control_addr.ip())),
            heartbeat: config.heartbeat_policy(),
            work_conn_timeout: config.work_conn_timeout(),
            auth_deadline: config.auth_deadline(),
            shutdown: shutdown.clone(),
        });

        Ok(Self {
            state,
            control_listener,
            data_listener,
            control_addr,
            data_addr,
            shutdown,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// The registry view consumed by observability surfaces
    pub fn registry(&self) -> Arc<ProxyRegistry> {
        self.state.registry.clone()
    }

    /// Token that stops the accept loops when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            control_addr = %self.control_addr,
            data_addr = %self.data_addr,
            "Broker listening"
        );

        let data_task = tokio::spawn(run_data_listener(
            self.data_listener,
            self.state.mux.clone(),
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.control_listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(handle_control_connection(state, stream, peer_addr));
                        }
                        Err(e) => {
                            warn!("Failed to accept control connection: {}", e);
                        }
                    }
                }
            }
        }

        info!("Broker shutting down");
        let _ = data_task.await;
        Ok(())
    }
}
