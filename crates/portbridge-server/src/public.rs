//! Public-facing side of a proxy
//!
//! Binds the public listen resource for a registration and, for every
//! accepted public connection, requests a data channel from the owning
//! agent and stitches the two sockets together.

use crate::session::AgentSession;
use crate::workconn::{WorkConnError, WorkConnMultiplexer};
use async_trait::async_trait;
use portbridge_connection::copy_bidirectional;
use portbridge_proto::{ControlMessage, ProxyKind, PublicSpec};
use portbridge_router::{ProxyRegistration, RegistryError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// A successfully bound public listen resource
pub struct BoundProxy {
    pub listener: TcpListener,
    pub public_addr: SocketAddr,
}

/// Allocates the public listen resource for a proxy kind
///
/// The default server only binds TCP ports; HTTP virtual-host routing and
/// other kinds plug in through this trait.
#[async_trait]
pub trait ProxyBinder: Send + Sync {
    async fn bind(&self, registration: &ProxyRegistration) -> Result<BoundProxy, RegistryError>;
}

/// TCP port binder
pub struct TcpProxyBinder {
    bind_ip: IpAddr,
}

impl TcpProxyBinder {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

impl Default for TcpProxyBinder {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[async_trait]
impl ProxyBinder for TcpProxyBinder {
    async fn bind(&self, registration: &ProxyRegistration) -> Result<BoundProxy, RegistryError> {
        let port = match (registration.kind, &registration.public_spec) {
            (ProxyKind::Tcp, PublicSpec::Port(port)) => *port,
            (ProxyKind::Tcp, PublicSpec::VHost(_)) => {
                return Err(RegistryError::UnsupportedKind(
                    "tcp proxy with virtual-host bind",
                ));
            }
            (kind, _) => return Err(RegistryError::UnsupportedKind(kind.as_str())),
        };

        let listener = TcpListener::bind((self.bind_ip, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => RegistryError::BindConflict(port),
                _ => RegistryError::BindFailed(e.to_string()),
            })?;

        let public_addr = listener
            .local_addr()
            .map_err(|e| RegistryError::BindFailed(e.to_string()))?;

        Ok(BoundProxy {
            listener,
            public_addr,
        })
    }
}

/// Accept loop for one proxy's public port
///
/// Runs until the owning session is cancelled or the listener task is
/// aborted on CloseProxy.
pub async fn run_public_listener(
    listener: TcpListener,
    proxy_name: String,
    session: Arc<AgentSession>,
    mux: Arc<WorkConnMultiplexer>,
    work_conn_timeout: Duration,
) {
    let cancel = session.cancel_token();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((public_stream, peer_addr)) => {
                        debug!(proxy_name = %proxy_name, %peer_addr, "Accepted public connection");
                        tokio::spawn(handle_public_connection(
                            public_stream,
                            peer_addr,
                            proxy_name.clone(),
                            session.clone(),
                            mux.clone(),
                            work_conn_timeout,
                        ));
                    }
                    Err(e) => {
                        warn!(proxy_name = %proxy_name, "Failed to accept public connection: {}", e);
                    }
                }
            }
        }
    }

    debug!(proxy_name = %proxy_name, "Public listener stopped");
}

/// Pair one public connection with a fresh agent data channel and relay
async fn handle_public_connection(
    public_stream: TcpStream,
    peer_addr: SocketAddr,
    proxy_name: String,
    session: Arc<AgentSession>,
    mux: Arc<WorkConnMultiplexer>,
    work_conn_timeout: Duration,
) {
    let (correlation_id, slot) = mux.begin_request(&session.id);

    let request = ControlMessage::NewWorkConn {
        correlation_id,
        proxy_name: proxy_name.clone(),
    };
    if session.outbound().send(request).await.is_err() {
        // Control channel already torn down; fail the client immediately
        // instead of letting it hang.
        mux.abandon(correlation_id);
        warn!(%peer_addr, proxy_name = %proxy_name, "Session gone, refusing public connection");
        return;
    }

    match mux.wait(correlation_id, slot, work_conn_timeout).await {
        Ok(work_stream) => {
            let cancel = session.cancel_token();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%peer_addr, proxy_name = %proxy_name, "Forwarding cancelled by session teardown");
                }
                result = copy_bidirectional(public_stream, work_stream) => {
                    match result {
                        Ok((to_agent, to_public)) => {
                            info!(
                                %peer_addr,
                                proxy_name = %proxy_name,
                                bytes_to_agent = to_agent,
                                bytes_to_public = to_public,
                                "Forwarding finished"
                            );
                        }
                        Err(e) => {
                            // Per-pair errors stay local to this pair.
                            debug!(%peer_addr, proxy_name = %proxy_name, "Forwarding ended: {}", e);
                        }
                    }
                }
            }
        }
        Err(e @ WorkConnError::Timeout(_)) => {
            // Gateway-timeout class failure: the public socket closes now.
            warn!(%peer_addr, proxy_name = %proxy_name, "{}", e);
        }
        Err(e) => {
            debug!(%peer_addr, proxy_name = %proxy_name, "Work connection unavailable: {}", e);
        }
    }
}
