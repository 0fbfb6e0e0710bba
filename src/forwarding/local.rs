//! Local Port Forwarding
//!
//! Forwards connections from a local port to a fixed remote host:port
//! through SSH. Example: local:8888 -> remote jupyter:8888

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::debug;

use super::bridge::bridge_streams;
use super::ForwardStats;
use crate::ssh::{SshError, Transport};

/// Handle a single forwarded connection
pub(super) async fn handle_forward_connection(
    transport: Arc<dyn Transport>,
    local_stream: TcpStream,
    peer_addr: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    stats: Arc<RwLock<ForwardStats>>,
) -> Result<(), SshError> {
    let channel = transport
        .open_direct_tcpip(
            remote_host,
            remote_port,
            &peer_addr.ip().to_string(),
            peer_addr.port(),
        )
        .await?;

    debug!(
        "Opened channel for forward {} -> {}:{}",
        peer_addr, remote_host, remote_port
    );

    bridge_streams(local_stream, channel, stats).await;
    debug!("Forward connection from {} closed", peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_forward_connection_reaches_remote() {
        let transport = Arc::new(MockTransport::new());
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let task = tokio::spawn(handle_forward_connection(
            transport.clone(),
            server_side,
            peer,
            "localhost",
            8888,
            stats.clone(),
        ));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.shutdown().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(
            transport.opened_targets(),
            vec![("localhost".to_string(), 8888)]
        );
        assert_eq!(stats.read().bytes_sent, 4);
        assert_eq!(stats.read().bytes_received, 4);
    }

    #[tokio::test]
    async fn test_channel_failure_is_reported() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_direct_tcpip(true);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let result =
            handle_forward_connection(transport, server_side, peer, "db", 5432, stats).await;
        assert!(matches!(result, Err(SshError::ChannelError(_))));
    }
}
