//! Transport seam between the session layer and the SSH implementation
//!
//! The session runtime and the tunnels only ever see these traits. The
//! production implementation is [`HandleController`](super::HandleController),
//! produced by [`RusshConnector`](super::RusshConnector).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::config::{ConnectionPolicy, ServerDescriptor};
use super::error::SshError;

/// PTY parameters for the interactive shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub rows: u32,
    pub cols: u32,
    pub echo: bool,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            rows: 24,
            cols: 80,
            echo: true,
        }
    }
}

/// Commands accepted by the shell channel task
#[derive(Debug)]
pub enum ShellCommand {
    /// Bytes for the remote stdin
    Data(Vec<u8>),
    /// Window change
    Resize { rows: u32, cols: u32 },
    /// Send EOF and close the channel
    Close,
}

/// One chunk read from a remote output stream
pub type ShellOutput = Result<Vec<u8>, SshError>;

/// I/O endpoints of an opened shell
///
/// Both receivers end (`None`) when the remote side closes the channel.
pub struct ShellIo {
    pub input: mpsc::Sender<ShellCommand>,
    pub stdout: mpsc::Receiver<ShellOutput>,
    pub stderr: mpsc::Receiver<ShellOutput>,
}

/// Byte stream usable as a tunnel endpoint
pub trait AsyncStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> AsyncStream for T {}

/// A `direct-tcpip` channel opened through the transport
pub type TunnelStream = Pin<Box<dyn AsyncStream>>;

/// An established, authenticated SSH transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session channel, request a PTY and start the login shell
    async fn open_shell(&self, pty: PtyRequest) -> Result<ShellIo, SshError>;

    /// Open a `direct-tcpip` channel to `host:port`
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<TunnelStream, SshError>;

    /// Protocol-level keepalive with reply
    async fn keepalive(&self) -> Result<(), SshError>;

    /// Tear down the transport
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Dials and authenticates transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        policy: &ConnectionPolicy,
    ) -> Result<Arc<dyn Transport>, SshError>;
}
