//! Data-channel multiplexer
//!
//! Every public connection that needs forwarding parks a single-use pending
//! slot here, keyed by a fresh correlation identifier, and the agent is
//! asked (over its control channel) to dial back one data channel carrying
//! that identifier. The arriving channel is matched to its slot and handed
//! to the forwarder; a slot whose channel never arrives is discarded after
//! a bounded wait.

use dashmap::DashMap;
use portbridge_connection::read_preamble;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long an accepted data channel gets to announce its correlation id
const PREAMBLE_DEADLINE: Duration = Duration::from_secs(5);

/// Work-connection errors
#[derive(Debug, Error)]
pub enum WorkConnError {
    #[error("Agent did not open a data channel within {0:?}")]
    Timeout(Duration),

    #[error("Session closed while waiting for a data channel")]
    SessionClosed,

    #[error("Correlation identifier reused: {0}")]
    DuplicateCorrelation(Uuid),
}

struct PendingSlot {
    session_id: String,
    tx: oneshot::Sender<TcpStream>,
}

/// Pending-request table pairing data channels with waiting public sockets
///
/// Correlation identifiers are single-use: a consumed identifier showing up
/// again is a protocol violation and the owning session is dropped through
/// its cancellation token.
pub struct WorkConnMultiplexer {
    pending: DashMap<Uuid, PendingSlot>,
    /// Consumed ids kept until their session tears down, to tell reuse
    /// apart from plain unknown garbage.
    consumed: DashMap<Uuid, String>,
    sessions: DashMap<String, CancellationToken>,
}

impl WorkConnMultiplexer {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            consumed: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Track a session so protocol violations can drop it
    pub fn register_session(&self, session_id: String, cancel: CancellationToken) {
        self.sessions.insert(session_id, cancel);
    }

    /// Forget a session: every outstanding wait is cancelled and its
    /// consumed-id memory is released.
    pub fn unregister_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        // Dropping a slot drops its sender, which wakes the waiter with
        // SessionClosed.
        self.pending
            .retain(|_, slot| slot.session_id != session_id);
        self.consumed.retain(|_, owner| owner != session_id);
    }

    /// Park a pending slot and hand back the identifier the agent must echo
    pub fn begin_request(&self, session_id: &str) -> (Uuid, oneshot::Receiver<TcpStream>) {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingSlot {
                session_id: session_id.to_string(),
                tx,
            },
        );

        debug!(%correlation_id, session_id, "Parked work-connection slot");
        (correlation_id, rx)
    }

    /// Discard a slot whose NewWorkConn request could not be sent
    pub fn abandon(&self, correlation_id: Uuid) {
        self.pending.remove(&correlation_id);
    }

    /// Wait for the slot to be filled, bounded by `timeout`
    pub async fn wait(
        &self,
        correlation_id: Uuid,
        rx: oneshot::Receiver<TcpStream>,
        timeout: Duration,
    ) -> Result<TcpStream, WorkConnError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(_)) => {
                // Sender dropped: the owning session tore down first.
                self.pending.remove(&correlation_id);
                Err(WorkConnError::SessionClosed)
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                warn!(%correlation_id, "Work-connection wait timed out");
                Err(WorkConnError::Timeout(timeout))
            }
        }
    }

    /// Match an arrived data channel to its pending slot
    pub fn deliver(&self, correlation_id: Uuid, stream: TcpStream) -> Result<(), WorkConnError> {
        if let Some((_, slot)) = self.pending.remove(&correlation_id) {
            self.consumed
                .insert(correlation_id, slot.session_id.clone());
            if slot.tx.send(stream).is_err() {
                // The waiter gave up in the meantime; the channel is simply
                // dropped and the agent sees a closed socket.
                debug!(%correlation_id, "Waiter gone, dropping data channel");
            }
            return Ok(());
        }

        if let Some(owner) = self.consumed.get(&correlation_id) {
            let session_id = owner.value().clone();
            drop(owner);
            warn!(
                %correlation_id,
                %session_id,
                "Correlation identifier reused, dropping session"
            );
            if let Some(cancel) = self.sessions.get(&session_id) {
                cancel.cancel();
            }
            return Err(WorkConnError::DuplicateCorrelation(correlation_id));
        }

        // Unknown id: either a very late arrival for a discarded slot or
        // garbage; the connection is dropped on return.
        warn!(%correlation_id, "Data channel for unknown correlation id");
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for WorkConnMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept loop on the data-channel port
///
/// Each accepted connection must announce its correlation id within a short
/// deadline; everything after the preamble is payload and never parsed.
pub async fn run_data_listener(
    listener: TcpListener,
    mux: Arc<WorkConnMultiplexer>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "Accepted data channel");
                        let mux = mux.clone();
                        tokio::spawn(async move {
                            let mut stream = stream;
                            match read_preamble(&mut stream, PREAMBLE_DEADLINE).await {
                                Ok(correlation_id) => {
                                    let _ = mux.deliver(correlation_id, stream);
                                }
                                Err(e) => {
                                    warn!(%peer_addr, "Data channel preamble failed: {}", e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept data channel: {}", e);
                    }
                }
            }
        }
    }

    debug!("Data listener stopped");
}
