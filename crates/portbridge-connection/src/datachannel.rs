//! Data-channel preamble exchange
//!
//! A freshly dialed data channel announces which pending work-connection
//! request it answers by sending its correlation identifier as a raw
//! 16-byte UUID, then the channel becomes a transparent byte pipe.

use crate::control::TransportError;
use portbridge_proto::{ControlCodec, PREAMBLE_LEN};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use uuid::Uuid;

/// Write the correlation preamble on a freshly dialed data channel
pub async fn write_preamble<S>(stream: &mut S, correlation_id: Uuid) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let preamble = ControlCodec::encode_preamble(correlation_id);
    stream.write_all(&preamble).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the correlation preamble from an accepted data channel
///
/// The peer gets `deadline` to produce the full preamble; a connection that
/// stalls or closes early is rejected rather than left pending.
pub async fn read_preamble<S>(stream: &mut S, deadline: Duration) -> Result<Uuid, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut preamble = [0u8; PREAMBLE_LEN];

    match timeout(deadline, stream.read_exact(&mut preamble)).await {
        Ok(Ok(_)) => Ok(ControlCodec::decode_preamble(&preamble)),
        Ok(Err(e)) => Err(TransportError::IoError(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}
