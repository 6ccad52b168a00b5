//! Agent side of a work connection
//!
//! Dials the broker's data port, announces the correlation identifier,
//! dials the local service, then relays bytes both ways until either side
//! ends.

use crate::agent::AgentError;
use portbridge_connection::{copy_bidirectional, write_preamble};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Open and drive one data channel end-to-end
pub async fn open_work_connection(
    data_addr: &str,
    correlation_id: Uuid,
    local_target: &str,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    let mut data_stream = TcpStream::connect(data_addr).await.map_err(|source| {
        AgentError::ConnectionFailed {
            address: data_addr.to_string(),
            source,
        }
    })?;

    write_preamble(&mut data_stream, correlation_id).await?;

    // The channel is announced before the local dial so a dead local
    // service fails the waiting public connection immediately (the broker
    // pairs the channel and sees it close) instead of timing out.
    let local_stream = match TcpStream::connect(local_target).await {
        Ok(stream) => stream,
        Err(source) => {
            return Err(AgentError::ConnectionFailed {
                address: local_target.to_string(),
                source,
            });
        }
    };

    debug!(%correlation_id, local_target, "Forwarding work connection");

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%correlation_id, "Work connection cancelled");
        }
        result = copy_bidirectional(data_stream, local_stream) => {
            match result {
                Ok((to_local, to_broker)) => {
                    info!(
                        %correlation_id,
                        bytes_to_local = to_local,
                        bytes_to_broker = to_broker,
                        "Work connection finished"
                    );
                }
                Err(e) => {
                    debug!(%correlation_id, "Work connection ended: {}", e);
                }
            }
        }
    }

    Ok(())
}
