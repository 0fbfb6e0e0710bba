//! Bidirectional stream bridge
//!
//! Copies both directions concurrently. When one direction reads EOF its
//! writer is shut down (half-close) and the other direction keeps draining;
//! the bridge only returns once both directions are done.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::ForwardStats;

/// Idle timeout for forwarded connections (5 minutes)
pub const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const COPY_BUFFER_SIZE: usize = 32768;

#[derive(Clone, Copy)]
enum Flow {
    Upstream,
    Downstream,
}

/// Bridge a local client with a remote channel
///
/// Returns `(bytes_sent, bytes_received)` for this connection.
pub async fn bridge_streams<L, R>(
    local: L,
    remote: R,
    stats: Arc<RwLock<ForwardStats>>,
) -> (u64, u64)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = copy_half(&mut local_read, &mut remote_write, Flow::Upstream, &stats);
    let downstream = copy_half(&mut remote_read, &mut local_write, Flow::Downstream, &stats);

    let (sent, received) = tokio::join!(upstream, downstream);
    debug!("Bridge closed: {} bytes sent, {} bytes received", sent, received);
    (sent, received)
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    flow: Flow,
    stats: &RwLock<ForwardStats>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match tokio::time::timeout(FORWARD_IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("Bridge write error: {}", e);
                    break;
                }
                total += n as u64;
                let mut s = stats.write();
                match flow {
                    Flow::Upstream => s.bytes_sent += n as u64,
                    Flow::Downstream => s.bytes_received += n as u64,
                }
            }
            Ok(Err(e)) => {
                debug!("Bridge read error: {}", e);
                break;
            }
            Err(_) => {
                debug!(
                    "Bridge idle timeout ({}s), closing direction",
                    FORWARD_IDLE_TIMEOUT.as_secs()
                );
                break;
            }
        }
    }

    // Half-close: the peer sees EOF, the opposite direction keeps running
    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_half_close_drains_other_direction() {
        let (local, mut client) = duplex(1024);
        let (remote, mut server) = duplex(1024);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let bridge = tokio::spawn(bridge_streams(local, remote, stats.clone()));

        // Client sends a request and closes its write side immediately
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        // Server sees the full request followed by EOF
        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"GET / HTTP/1.0\r\n\r\n");

        // Response still flows back after the client half-closed
        server.write_all(b"HTTP/1.0 200 OK\r\n\r\nbody").await.unwrap();
        server.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\nbody");

        let (sent, received) = bridge.await.unwrap();
        assert_eq!(sent, 18);
        assert_eq!(received, 23);

        let s = stats.read().clone();
        assert_eq!(s.bytes_sent, 18);
        assert_eq!(s.bytes_received, 23);
    }
}
