//! Per-agent control-channel session handling
//!
//! One task per connected agent owns the control stream and drives the
//! session state machine:
//! `Connecting → Authenticating → Registered → Active → Closing → Closed`.
//! Registration requests, heartbeats and work-connection signalling all flow
//! through this task; teardown removes every trace of the session in one
//! pass.

use crate::heartbeat::HeartbeatVerdict;
use crate::public::run_public_listener;
use crate::server::ServerState;
use crate::task_tracker::TaskTracker;
use chrono::{DateTime, Utc};
use portbridge_auth::{AuthError, Identity};
use portbridge_connection::{ControlChannel, TransportError};
use portbridge_proto::{ControlMessage, ProxyKind, PublicSpec};
use portbridge_router::ProxyRegistration;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, nothing exchanged yet
    Connecting,
    /// Waiting for / validating the Login message
    Authenticating,
    /// Login accepted, session exists, no proxy yet
    Registered,
    /// At least one proxy registered, steady-state traffic
    Active,
    /// Teardown in progress
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Registered => "registered",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Session-level errors; all of these cascade to full teardown
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No traffic for {0:?}, session presumed dead")]
    HeartbeatTimeout(Duration),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// One connected agent
///
/// Owned by its control task; the registry and the multiplexer hold only
/// the session id as a back-reference.
pub struct AgentSession {
    pub id: String,
    pub run_id: Option<String>,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl AgentSession {
    fn new(
        run_id: Option<String>,
        identity: Identity,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id,
            identity,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState::Registered),
            outbound,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap();
        debug!(
            session_id = %self.id,
            from = state.as_str(),
            to = next.as_str(),
            "Session state transition"
        );
        *state = next;
    }

    /// Queue for messages the server pushes to the agent
    pub fn outbound(&self) -> mpsc::Sender<ControlMessage> {
        self.outbound.clone()
    }

    /// Cancelled when the session tears down; forwarding loops and pending
    /// waits tied to this session observe it cooperatively.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Handle one control connection from accept to teardown
pub async fn handle_control_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    info!(%peer_addr, "New control connection");
    let mut channel = ControlChannel::new(stream);

    // Connecting → Authenticating: the peer gets a bounded window to
    // present its Login before the connection is dropped.
    let (token, run_id) = match timeout(state.auth_deadline, channel.recv()).await {
        Ok(Ok(Some(ControlMessage::Login { token, run_id }))) => (token, run_id),
        Ok(Ok(Some(other))) => {
            warn!(%peer_addr, "Expected Login as first message, got {:?}", other);
            return;
        }
        Ok(Ok(None)) => {
            debug!(%peer_addr, "Connection closed before Login");
            return;
        }
        Ok(Err(e)) => {
            error!(%peer_addr, "Failed to read Login: {}", e);
            return;
        }
        Err(_) => {
            warn!(%peer_addr, "No Login within {:?}", state.auth_deadline);
            return;
        }
    };

    let identity = match state.validator.validate(&token).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%peer_addr, "Authentication failed: {}", e);
            // The failure is observable on the agent side; the transport is
            // closed and no session state is ever created.
            let _ = channel
                .send(&ControlMessage::LoginResp {
                    session_id: String::new(),
                    heartbeat_interval_secs: state.heartbeat.interval().as_secs(),
                    error: Some(format!("Authentication failed: {}", e)),
                })
                .await;
            return;
        }
    };

    // Authenticated → Registered: the session now exists.
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let session = Arc::new(AgentSession::new(run_id, identity, outbound_tx));
    state
        .mux
        .register_session(session.id.clone(), session.cancel_token());

    if let Err(e) = channel
        .send(&ControlMessage::LoginResp {
            session_id: session.id.clone(),
            heartbeat_interval_secs: state.heartbeat.interval().as_secs(),
            error: None,
        })
        .await
    {
        error!(session_id = %session.id, "Failed to send LoginResp: {}", e);
        state.mux.unregister_session(&session.id);
        return;
    }

    info!(
        session_id = %session.id,
        subject = %session.identity.subject,
        run_id = session.run_id.as_deref().unwrap_or("-"),
        %peer_addr,
        "Agent session registered"
    );

    let tracker = TaskTracker::new();
    let result = run_session_loop(&state, &session, &mut channel, outbound_rx, &tracker).await;

    // Teardown: whatever ended the loop, every resource owned by this
    // session goes away before the state turns Closed.
    session.set_state(SessionState::Closing);
    match &result {
        Ok(()) => info!(session_id = %session.id, "Session closing"),
        Err(e) => warn!(session_id = %session.id, "Session closing: {}", e),
    }

    session.cancel_token().cancel();
    state.mux.unregister_session(&session.id);
    let removed = state.registry.remove_session(&session.id);
    tracker.abort_all();

    session.set_state(SessionState::Closed);
    info!(
        session_id = %session.id,
        released_proxies = removed.len(),
        "Session closed"
    );
}

async fn run_session_loop(
    state: &Arc<ServerState>,
    session: &Arc<AgentSession>,
    channel: &mut ControlChannel<TcpStream>,
    mut outbound_rx: mpsc::Receiver<ControlMessage>,
    tracker: &TaskTracker,
) -> Result<(), SessionError> {
    let cancel = session.cancel_token();
    let mut last_activity = Instant::now();

    let mut tick = tokio::time::interval(state.heartbeat.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session.id, "Session cancelled");
                return Ok(());
            }

            _ = state.shutdown.cancelled() => {
                debug!(session_id = %session.id, "Broker shutting down");
                return Ok(());
            }

            maybe_out = outbound_rx.recv() => {
                match maybe_out {
                    Some(msg) => channel.send(&msg).await?,
                    None => return Ok(()),
                }
            }

            _ = tick.tick() => {
                match state.heartbeat.verdict(last_activity.elapsed()) {
                    HeartbeatVerdict::Idle => {}
                    HeartbeatVerdict::SendPing => {
                        debug!(session_id = %session.id, "Probing quiet session");
                        channel.send(&ControlMessage::Ping { timestamp: unix_now() }).await?;
                    }
                    HeartbeatVerdict::Expired => {
                        return Err(SessionError::HeartbeatTimeout(state.heartbeat.timeout()));
                    }
                }
            }

            inbound = channel.recv() => {
                match inbound {
                    Ok(Some(msg)) => {
                        last_activity = Instant::now();
                        handle_message(state, session, channel, tracker, msg).await?;
                    }
                    Ok(None) => {
                        debug!(session_id = %session.id, "Control channel closed by agent");
                        return Ok(());
                    }
                    Err(e) => return Err(SessionError::Transport(e)),
                }
            }
        }
    }
}

async fn handle_message(
    state: &Arc<ServerState>,
    session: &Arc<AgentSession>,
    channel: &mut ControlChannel<TcpStream>,
    tracker: &TaskTracker,
    msg: ControlMessage,
) -> Result<(), SessionError> {
    match msg {
        ControlMessage::Ping { timestamp } => {
            channel.send(&ControlMessage::Pong { timestamp }).await?;
        }
        ControlMessage::Pong { .. } => {
            debug!(session_id = %session.id, "Pong received");
        }
        ControlMessage::NewProxy {
            proxy_name,
            kind,
            public_spec,
            local_target,
        } => {
            let resp = handle_new_proxy(
                state,
                session,
                tracker,
                proxy_name,
                kind,
                public_spec,
                local_target,
            )
            .await;
            let accepted = matches!(
                resp,
                ControlMessage::NewProxyResp { error: None, .. }
            );
            channel.send(&resp).await?;
            if accepted && session.state() == SessionState::Registered {
                session.set_state(SessionState::Active);
            }
        }
        ControlMessage::CloseProxy { proxy_name } => {
            match state.registry.lookup(&proxy_name) {
                Some(reg) if reg.session_id == session.id => {
                    let _ = state.registry.remove(&proxy_name);
                    tracker.unregister(&proxy_name);
                    info!(session_id = %session.id, proxy_name = %proxy_name, "Proxy closed by agent");
                }
                Some(_) => {
                    warn!(
                        session_id = %session.id,
                        proxy_name = %proxy_name,
                        "CloseProxy for a proxy owned by another session"
                    );
                }
                None => {
                    warn!(session_id = %session.id, proxy_name = %proxy_name, "CloseProxy for unknown proxy");
                }
            }
        }
        ControlMessage::Login { .. } => {
            return Err(SessionError::Protocol(
                "Login repeated after handshake".to_string(),
            ));
        }
        other => {
            warn!(session_id = %session.id, "Unexpected message on control channel: {:?}", other);
        }
    }

    Ok(())
}

async fn handle_new_proxy(
    state: &Arc<ServerState>,
    session: &Arc<AgentSession>,
    tracker: &TaskTracker,
    proxy_name: String,
    kind: ProxyKind,
    public_spec: PublicSpec,
    local_target: String,
) -> ControlMessage {
    let registration = ProxyRegistration {
        proxy_name: proxy_name.clone(),
        kind,
        public_spec,
        local_target,
        session_id: session.id.clone(),
        remote_addr: None,
        registered_at: Utc::now(),
    };

    match state.registry.register(registration.clone()) {
        Ok(Some(existing)) => {
            // Identical resubmission from the same session; answer with the
            // already-bound address.
            ControlMessage::NewProxyResp {
                proxy_name,
                remote_addr: existing.remote_addr,
                error: None,
            }
        }
        Err(e) => {
            // A single failed registration never takes the session down.
            warn!(session_id = %session.id, proxy_name = %proxy_name, "Registration rejected: {}", e);
            ControlMessage::NewProxyResp {
                proxy_name,
                remote_addr: None,
                error: Some(e.to_string()),
            }
        }
        Ok(None) => match state.binder.bind(&registration).await {
            Ok(bound) => {
                let public_addr = bound.public_addr;
                if let Err(e) = state.registry.confirm_bound(
                    &proxy_name,
                    public_addr.to_string(),
                    public_addr.port(),
                ) {
                    // Only reachable if teardown raced us; undo the bind.
                    warn!(proxy_name = %proxy_name, "Lost registration while binding: {}", e);
                    return ControlMessage::NewProxyResp {
                        proxy_name,
                        remote_addr: None,
                        error: Some(e.to_string()),
                    };
                }

                let handle = tokio::spawn(run_public_listener(
                    bound.listener,
                    proxy_name.clone(),
                    session.clone(),
                    state.mux.clone(),
                    state.work_conn_timeout,
                ));
                tracker.register(proxy_name.clone(), handle);

                info!(
                    session_id = %session.id,
                    proxy_name = %proxy_name,
                    public_addr = %public_addr,
                    "Proxy online"
                );
                ControlMessage::NewProxyResp {
                    proxy_name,
                    remote_addr: Some(public_addr.to_string()),
                    error: None,
                }
            }
            Err(e) => {
                let _ = state.registry.remove(&proxy_name);
                warn!(session_id = %session.id, proxy_name = %proxy_name, "Public bind failed: {}", e);
                ControlMessage::NewProxyResp {
                    proxy_name,
                    remote_addr: None,
                    error: Some(e.to_string()),
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> AgentSession {
        let (tx, _rx) = mpsc::channel(8);
        AgentSession::new(
            Some("run-1".to_string()),
            Identity {
                subject: "tester".to_string(),
            },
            tx,
        )
    }

    #[test]
    fn test_new_session_is_registered() {
        let session = test_session();
        assert_eq!(session.state(), SessionState::Registered);
        assert!(!session.id.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let session = test_session();
        session.set_state(SessionState::Active);
        assert_eq!(session.state(), SessionState::Active);
        session.set_state(SessionState::Closing);
        session.set_state(SessionState::Closed);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_cancel_token_propagates() {
        let session = test_session();
        let observer = session.cancel_token();
        assert!(!observer.is_cancelled());
        session.cancel_token().cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_session_ids_unique() {
        let a = test_session();
        let b = test_session();
        assert_ne!(a.id, b.id);
    }
}
