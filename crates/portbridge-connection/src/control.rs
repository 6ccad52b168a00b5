//! Framed control-channel IO

use bytes::BytesMut;
use portbridge_proto::{CodecError, ControlCodec, ControlMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Message-framed view over a control-channel stream
///
/// `recv` is cancel-safe: bytes already pulled off the socket stay in the
/// internal buffer across cancelled calls, so the channel can sit inside a
/// `tokio::select!` loop.
pub struct ControlChannel<S> {
    stream: S,
    read_buf: BytesMut,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Send one control message
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<(), TransportError> {
        let frame = ControlCodec::encode(msg)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next control message
    ///
    /// Returns Ok(None) on a clean end-of-stream between frames; a stream
    /// that ends inside a frame is a protocol error.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>, TransportError> {
        loop {
            if let Some(msg) = ControlCodec::decode(&mut self.read_buf)? {
                return Ok(Some(msg));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ProtocolError(
                    "connection closed mid-frame".to_string(),
                ));
            }
        }
    }

    /// Surrender the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut tx = ControlChannel::new(client);
        let mut rx = ControlChannel::new(server);

        let msg = ControlMessage::Ping { timestamp: 42 };
        tx.send(&msg).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, Some(msg));
    }

    #[tokio::test]
    async fn test_recv_after_clean_close() {
        let (client, server) = tokio::io::duplex(1024);
        let mut tx = ControlChannel::new(client);
        let mut rx = ControlChannel::new(server);

        tx.send(&ControlMessage::Pong { timestamp: 7 }).await.unwrap();
        drop(tx);

        assert!(rx.recv().await.unwrap().is_some());
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_truncated_frame_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut rx = ControlChannel::new(server);

        // A length header promising more bytes than ever arrive.
        client.write_all(&8u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let result = rx.recv().await;
        assert!(matches!(result, Err(TransportError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_back_to_back_messages() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = ControlChannel::new(client);
        let mut rx = ControlChannel::new(server);

        for ts in 0..10u64 {
            tx.send(&ControlMessage::Ping { timestamp: ts }).await.unwrap();
        }

        for ts in 0..10u64 {
            let received = rx.recv().await.unwrap();
            assert_eq!(received, Some(ControlMessage::Ping { timestamp: ts }));
        }
    }
}
