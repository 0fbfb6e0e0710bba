//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Local SOCKS5 proxy that tunnels each CONNECT through SSH.
//! Example: SOCKS5 on 127.0.0.1:1080 -> SSH tunnel -> any destination
//!
//! Only the no-auth method and the CONNECT command are supported. A
//! malformed handshake closes the connection without writing a reply.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::bridge::bridge_streams;
use super::ForwardStats;
use crate::ssh::{SshError, Transport};

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_CONN_REFUSED: u8 = 0x05;
}

/// Destination requested by a SOCKS5 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn handshake_error(what: &str, e: std::io::Error) -> SshError {
    SshError::TunnelError(format!("Failed to read SOCKS5 {}: {}", what, e))
}

/// Run the method negotiation and read the CONNECT request
///
/// On success the client has been sent the `05 00` method selection and
/// the requested destination is returned. The connect reply is left to
/// the caller.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddr, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Phase 1: VER NMETHODS METHODS
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| handshake_error("greeting", e))?;

    if header[0] != socks5::VERSION {
        return Err(SshError::TunnelError(format!(
            "Unsupported SOCKS version: {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| handshake_error("auth methods", e))?;

    stream
        .write_all(&[socks5::VERSION, socks5::AUTH_NONE])
        .await
        .map_err(|e| SshError::TunnelError(format!("Failed to send auth response: {}", e)))?;

    // Phase 2: VER CMD RSV ATYP
    let mut request = [0u8; 4];
    stream
        .read_exact(&mut request)
        .await
        .map_err(|e| handshake_error("request", e))?;

    let [version, cmd, _reserved, atyp] = request;

    if version != socks5::VERSION {
        return Err(SshError::TunnelError(
            "Invalid SOCKS5 version in request".into(),
        ));
    }

    if cmd != socks5::CMD_CONNECT {
        return Err(SshError::TunnelError(format!(
            "Unsupported SOCKS5 command: {}",
            cmd
        )));
    }

    let host = match atyp {
        socks5::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(|e| handshake_error("IPv4 address", e))?;
            Ipv4Addr::from(octets).to_string()
        }
        socks5::ATYP_DOMAIN => {
            let len = stream
                .read_u8()
                .await
                .map_err(|e| handshake_error("domain length", e))?;
            let mut name = vec![0u8; len as usize];
            stream
                .read_exact(&mut name)
                .await
                .map_err(|e| handshake_error("domain", e))?;
            String::from_utf8_lossy(&name).into_owned()
        }
        socks5::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(|e| handshake_error("IPv6 address", e))?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            return Err(SshError::TunnelError(format!(
                "Unsupported address type: {}",
                other
            )));
        }
    };

    let port = stream
        .read_u16()
        .await
        .map_err(|e| handshake_error("port", e))?;

    Ok(TargetAddr { host, port })
}

/// Send a SOCKS5 reply with a 0.0.0.0:0 bound address
async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> Result<(), SshError>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];

    stream
        .write_all(&reply)
        .await
        .map_err(|e| SshError::TunnelError(format!("Failed to send SOCKS5 reply: {}", e)))
}

/// Handle a single SOCKS5 connection
pub(super) async fn handle_socks5_connection(
    transport: Arc<dyn Transport>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stats: Arc<RwLock<ForwardStats>>,
) -> Result<(), SshError> {
    let target = read_connect_request(&mut stream).await?;

    debug!("SOCKS5: {} connecting to {}", peer_addr, target);

    let channel = match transport
        .open_direct_tcpip(
            &target.host,
            target.port,
            &peer_addr.ip().to_string(),
            peer_addr.port(),
        )
        .await
    {
        Ok(ch) => ch,
        Err(e) => {
            warn!("Failed to open SSH channel to {}: {}", target, e);
            send_socks5_reply(&mut stream, socks5::REP_CONN_REFUSED).await?;
            return Err(e);
        }
    };

    send_socks5_reply(&mut stream, socks5::REP_SUCCESS).await?;

    debug!("SOCKS5: Tunnel established to {}", target);

    bridge_streams(stream, channel, stats).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_rejects_socks4_without_reply() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let result = read_connect_request(&mut server).await;
        assert!(matches!(result, Err(SshError::TunnelError(_))));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_parses_ipv4_connect() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50])
            .await
            .unwrap();

        let target = read_connect_request(&mut server).await.unwrap();
        assert_eq!(target.to_string(), "93.184.216.34:80");

        let mut selection = [0u8; 2];
        client.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_parses_domain_connect() {
        let (mut client, mut server) = duplex(64);
        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = read_connect_request(&mut server).await.unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn test_parses_ipv6_connect() {
        let (mut client, mut server) = duplex(64);
        let mut request = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = read_connect_request(&mut server).await.unwrap();
        assert_eq!(target.to_string(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_rejects_bind_command_without_reply() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        assert!(read_connect_request(&mut server).await.is_err());
        drop(server);

        // Only the method selection was written
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![0x05, 0x00]);
    }

    async fn socks_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[tokio::test]
    async fn test_channel_failure_sends_refused_reply() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_direct_tcpip(true);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));
        let (mut client, server, peer) = socks_pair().await;

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();

        let result = handle_socks5_connection(transport, server, peer, stats).await;
        assert!(result.is_err());

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_connect_bridges_through_transport() {
        let transport = Arc::new(MockTransport::new());
        let stats = Arc::new(RwLock::new(ForwardStats::default()));
        let (mut client, server, peer) = socks_pair().await;

        let task = tokio::spawn(handle_socks5_connection(
            transport.clone(),
            server,
            peer,
            stats,
        ));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50])
            .await
            .unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        client.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(
            transport.opened_targets(),
            vec![("93.184.216.34".to_string(), 80)]
        );
    }
}
