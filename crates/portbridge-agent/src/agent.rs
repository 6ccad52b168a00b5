//! Agent control loop
//!
//! Dials the broker, logs in, registers every configured proxy, then sits
//! in steady state answering heartbeats and opening data channels on
//! demand. Any loss of the control channel tears down the session's
//! forwarders and re-runs the whole sequence behind exponential backoff.

use crate::config::{AgentConfig, ProxyConfig};
use crate::workconn;
use portbridge_connection::{
    ControlChannel, ReconnectError, ReconnectManager, TransportError,
};
use portbridge_proto::{ControlMessage, PublicSpec};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Login rejected by broker: {0}")]
    LoginRejected(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Reconnect error: {0}")]
    Reconnect(#[from] ReconnectError),
}

enum SessionEnd {
    /// Shutdown was requested; do not reconnect
    Shutdown,
    /// The control channel is gone; reconnect after backoff
    Disconnected,
}

/// The portbridge agent
pub struct Agent {
    config: AgentConfig,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that ends [`Agent::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown, reconnecting with backoff on any session loss
    ///
    /// A rejected login is reported loudly but still falls under the
    /// backoff policy; the agent never hammers the broker with a bad token.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.to_config());

        loop {
            match self.run_session(&mut reconnect).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    info!("Control channel lost, scheduling reconnect");
                }
                Err(AgentError::LoginRejected(reason)) => {
                    error!("Broker rejected login: {}", reason);
                }
                Err(e) => {
                    warn!("Session ended: {}", e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                waited = reconnect.wait() => waited?,
            }
        }
    }

    async fn run_session(
        &self,
        reconnect: &mut ReconnectManager,
    ) -> Result<SessionEnd, AgentError> {
        // Forwarders opened during this session die with it, mirroring the
        // broker-side teardown of the same session.
        let session_cancel = self.shutdown.child_token();
        let result = self.session_inner(reconnect, &session_cancel).await;
        session_cancel.cancel();
        result
    }

    async fn session_inner(
        &self,
        reconnect: &mut ReconnectManager,
        session_cancel: &CancellationToken,
    ) -> Result<SessionEnd, AgentError> {
        info!(control_addr = %self.config.control_addr, "Connecting to broker");
        let stream = TcpStream::connect(&self.config.control_addr)
            .await
            .map_err(|source| AgentError::ConnectionFailed {
                address: self.config.control_addr.clone(),
                source,
            })?;
        let mut channel = ControlChannel::new(stream);

        channel
            .send(&ControlMessage::Login {
                token: self.config.token.clone(),
                run_id: self.config.run_id.clone(),
            })
            .await?;

        let (session_id, heartbeat_interval) = match channel.recv().await? {
            Some(ControlMessage::LoginResp {
                error: Some(reason),
                ..
            }) => return Err(AgentError::LoginRejected(reason)),
            Some(ControlMessage::LoginResp {
                session_id,
                heartbeat_interval_secs,
                error: None,
            }) => (
                session_id,
                Duration::from_secs(heartbeat_interval_secs.max(1)),
            ),
            Some(other) => {
                return Err(AgentError::Protocol(format!(
                    "Expected LoginResp, got {:?}",
                    other
                )));
            }
            None => return Err(AgentError::Transport(TransportError::ConnectionClosed)),
        };

        info!(%session_id, "Logged in to broker");
        reconnect.reset();

        for proxy in &self.config.proxies {
            self.register_proxy(&mut channel, session_cancel, proxy).await?;
        }

        // Steady state: heartbeats out, pings answered, data channels
        // opened on demand.
        let timeout_window = heartbeat_interval * self.config.heartbeat_timeout_multiple.max(2);
        let mut last_traffic = Instant::now();
        let mut tick = tokio::time::interval(heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(%session_id, "Shutting down agent session");
                    return Ok(SessionEnd::Shutdown);
                }

                _ = tick.tick() => {
                    if last_traffic.elapsed() >= timeout_window {
                        warn!(%session_id, "No broker traffic for {:?}, presuming dead", timeout_window);
                        return Ok(SessionEnd::Disconnected);
                    }
                    channel.send(&ControlMessage::Ping { timestamp: unix_now() }).await?;
                }

                inbound = channel.recv() => {
                    match inbound {
                        Ok(Some(msg)) => {
                            last_traffic = Instant::now();
                            self.handle_message(&mut channel, session_cancel, msg).await?;
                        }
                        Ok(None) => {
                            debug!(%session_id, "Broker closed the control channel");
                            return Ok(SessionEnd::Disconnected);
                        }
                        Err(e) => {
                            warn!(%session_id, "Control channel error: {}", e);
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                }
            }
        }
    }

    /// Register one proxy, retrying a bounded number of times
    ///
    /// A registration that still fails after the retries is logged and
    /// skipped; the session carries on with the remaining proxies.
    async fn register_proxy(
        &self,
        channel: &mut ControlChannel<TcpStream>,
        session_cancel: &CancellationToken,
        proxy: &ProxyConfig,
    ) -> Result<(), AgentError> {
        let attempts = self.config.registration_retries + 1;

        for attempt in 1..=attempts {
            channel
                .send(&ControlMessage::NewProxy {
                    proxy_name: proxy.name.clone(),
                    kind: proxy.kind,
                    public_spec: PublicSpec::Port(proxy.remote_port),
                    local_target: proxy.local_target.clone(),
                })
                .await?;

            match self
                .await_proxy_resp(channel, session_cancel, &proxy.name)
                .await?
            {
                None => {
                    return Ok(());
                }
                Some(reason) if attempt < attempts => {
                    // Conflicts can be transient right after a reconnect,
                    // while the broker is still sweeping our old session.
                    warn!(
                        proxy_name = %proxy.name,
                        attempt,
                        "Registration failed ({}), retrying",
                        reason
                    );
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Some(reason) => {
                    error!(proxy_name = %proxy.name, "Registration failed: {}", reason);
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Wait for the NewProxyResp matching `proxy_name`
    ///
    /// Heartbeats and work-connection requests for already-registered
    /// proxies may interleave with registration traffic; both are served
    /// inline so nothing stalls behind a slow registration.
    async fn await_proxy_resp(
        &self,
        channel: &mut ControlChannel<TcpStream>,
        session_cancel: &CancellationToken,
        proxy_name: &str,
    ) -> Result<Option<String>, AgentError> {
        loop {
            match channel.recv().await? {
                Some(ControlMessage::NewProxyResp {
                    proxy_name: name,
                    remote_addr,
                    error,
                }) if name == proxy_name => {
                    return match error {
                        None => {
                            info!(
                                proxy_name = %name,
                                remote_addr = remote_addr.as_deref().unwrap_or("-"),
                                "Proxy registered"
                            );
                            Ok(None)
                        }
                        Some(reason) => Ok(Some(reason)),
                    };
                }
                Some(ControlMessage::Ping { timestamp }) => {
                    channel.send(&ControlMessage::Pong { timestamp }).await?;
                }
                Some(ControlMessage::NewWorkConn {
                    correlation_id,
                    proxy_name: requested,
                }) => {
                    self.spawn_work_connection(session_cancel, correlation_id, &requested);
                }
                Some(other) => {
                    debug!("Ignoring message while awaiting registration: {:?}", other);
                }
                None => {
                    return Err(AgentError::Transport(TransportError::ConnectionClosed));
                }
            }
        }
    }

    async fn handle_message(
        &self,
        channel: &mut ControlChannel<TcpStream>,
        session_cancel: &CancellationToken,
        msg: ControlMessage,
    ) -> Result<(), AgentError> {
        match msg {
            ControlMessage::Ping { timestamp } => {
                channel.send(&ControlMessage::Pong { timestamp }).await?;
            }
            ControlMessage::Pong { .. } => {
                debug!("Pong from broker");
            }
            ControlMessage::NewWorkConn {
                correlation_id,
                proxy_name,
            } => {
                self.spawn_work_connection(session_cancel, correlation_id, &proxy_name);
            }
            other => {
                warn!("Unexpected message from broker: {:?}", other);
            }
        }

        Ok(())
    }

    /// Open a data channel for one forwarded connection in the background
    fn spawn_work_connection(
        &self,
        session_cancel: &CancellationToken,
        correlation_id: uuid::Uuid,
        proxy_name: &str,
    ) {
        let Some(proxy) = self.config.proxies.iter().find(|p| p.name == proxy_name) else {
            warn!(proxy_name, "Work connection requested for unknown proxy");
            return;
        };

        debug!(proxy_name, %correlation_id, "Opening data channel");

        let data_addr = self.config.data_addr.clone();
        let local_target = proxy.local_target.clone();
        let cancel = session_cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) =
                workconn::open_work_connection(&data_addr, correlation_id, &local_target, cancel)
                    .await
            {
                warn!(%correlation_id, "Work connection failed: {}", e);
            }
        });
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
