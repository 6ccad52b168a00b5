//! Transparent bidirectional byte relay
//!
//! Two independent copy loops, one per direction. End-of-stream on one
//! direction half-closes the peer's write side while the reverse direction
//! keeps flowing; the first IO error tears down both loops. No framing, no
//! buffering beyond one read buffer per direction.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// Pump bytes both ways between two streams until both directions end
///
/// Returns (bytes a→b, bytes b→a). An error on either direction aborts the
/// other loop as well; the caller drops both streams on return either way.
pub async fn copy_bidirectional<A, B>(a: A, b: B) -> Result<(u64, u64), RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = copy_half(&mut a_read, &mut b_write);
    let b_to_a = copy_half(&mut b_read, &mut a_write);

    // try_join! drops the surviving loop as soon as one errors, which
    // closes both streams when the caller returns.
    tokio::try_join!(a_to_b, b_to_a)
}

/// Copy one direction until end-of-stream, then half-close the destination
async fn copy_half<R, W>(read: &mut R, write: &mut W) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = read.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        write.write_all(&buffer[..n]).await?;
        total += n as u64;
    }

    // Propagate the end-of-stream as a write-side close so the peer sees
    // EOF while its own sending direction stays open.
    write.shutdown().await?;

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Build a relayed pair: what `left` writes comes out of `right` and
    /// vice versa, passing through copy_bidirectional in between.
    fn relayed_pair() -> (
        tokio::io::DuplexStream,
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<Result<(u64, u64), RelayError>>,
    ) {
        let (left, left_inner) = tokio::io::duplex(1024);
        let (right, right_inner) = tokio::io::duplex(1024);
        let relay = tokio::spawn(copy_bidirectional(left_inner, right_inner));
        (left, right, relay)
    }

    #[tokio::test]
    async fn test_byte_fidelity_both_directions() {
        let (mut left, mut right, relay) = relayed_pair();

        let request: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
        let response = b"response payload".to_vec();

        let request_clone = request.clone();
        let writer = tokio::spawn(async move {
            left.write_all(&request_clone).await.unwrap();
            left.shutdown().await.unwrap();

            let mut echoed = Vec::new();
            left.read_to_end(&mut echoed).await.unwrap();
            echoed
        });

        let mut received = Vec::new();
        right.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, request);

        right.write_all(&response).await.unwrap();
        right.shutdown().await.unwrap();

        let echoed = writer.await.unwrap();
        assert_eq!(echoed, response);

        let (to_right, to_left) = relay.await.unwrap().unwrap();
        assert_eq!(to_right, request.len() as u64);
        assert_eq!(to_left, response.len() as u64);
    }

    #[tokio::test]
    async fn test_half_close_keeps_reverse_direction_open() {
        let (mut left, mut right, _relay) = relayed_pair();

        // Left finishes sending immediately.
        left.write_all(b"done").await.unwrap();
        left.shutdown().await.unwrap();

        // Right observes the EOF...
        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"done");

        // ...and can still answer on the reverse direction afterwards.
        right.write_all(b"late reply").await.unwrap();
        right.shutdown().await.unwrap();

        let mut reply = Vec::new();
        left.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");
    }

    #[tokio::test]
    async fn test_write_error_tears_down_both_loops() {
        let (mut left, left_inner) = tokio::io::duplex(1024);
        let (right, right_inner) = tokio::io::duplex(1024);

        let relay = tokio::spawn(copy_bidirectional(left_inner, right_inner));

        // Kill the destination endpoint, then push bytes into the relay:
        // the forward loop hits a broken pipe and must take the whole relay
        // down with it instead of leaving the reverse loop running.
        drop(right);
        left.write_all(b"payload").await.unwrap();

        let result = relay.await.unwrap();
        assert!(result.is_err());

        // With the relay gone our own read side is closed too.
        let mut buf = Vec::new();
        left.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
