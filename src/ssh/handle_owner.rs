//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable [`HandleController`] which sends commands over an
//! mpsc channel, so the handle is never shared behind a lock or touched
//! concurrently.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::session::spawn_shell_channel;
use super::transport::{PtyRequest, ShellIo, Transport, TunnelStream};

/// Bound on a single keepalive round trip
const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; the link may just be slow
    Timeout,
    /// The connection is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local forward / SOCKS5)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// keepalive@openssh.com with want_reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Controller for the Handle Owner Task
///
/// Cloning is cheap (one `Sender`). Any holder has full control over the
/// connection, so it must stay inside the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn open_direct_tcpip_channel(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl Transport for HandleController {
    async fn open_shell(&self, pty: PtyRequest) -> Result<ShellIo, SshError> {
        let channel = self.open_session_channel().await?;

        debug!("Channel opened, requesting PTY ({})", pty.term);
        let modes = [(russh::Pty::ECHO, u32::from(pty.echo))];
        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &modes)
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        Ok(spawn_shell_channel(channel))
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<TunnelStream, SshError> {
        let channel = self
            .open_direct_tcpip_channel(
                host,
                u32::from(port),
                originator_host,
                u32::from(originator_port),
            )
            .await?;
        Ok(Box::pin(channel.into_stream()))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        match self.ping().await {
            PingResult::Ok => Ok(()),
            PingResult::Timeout => Err(SshError::Timeout("Keepalive reply timed out".to_string())),
            PingResult::IoError => Err(SshError::Disconnected),
        }
    }

    async fn close(&self) {
        self.disconnect().await;
    }

    fn is_closed(&self) -> bool {
        !self.is_connected()
    }
}

/// Spawn the Handle Owner Task
///
/// Takes ownership of the handle; `label` is only used in logs.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        info!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result = match tokio::time::timeout(
                        KEEPALIVE_REPLY_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            warn!("Keepalive failed for {}: {}", label, e);
                            PingResult::IoError
                        }
                        Err(_) => {
                            warn!(
                                "Keepalive timeout for {} ({}s)",
                                label,
                                KEEPALIVE_REPLY_TIMEOUT.as_secs()
                            );
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Close the queue and answer everything still in it with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Controller wired to a scripted owner that answers pings
    fn scripted_controller(answer: PingResult) -> HandleController {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(8);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::Ping { reply_tx } => {
                        let _ = reply_tx.send(answer);
                    }
                    HandleCommand::Disconnect => break,
                    _ => {}
                }
            }
        });
        HandleController { cmd_tx }
    }

    #[tokio::test]
    async fn test_keepalive_maps_ping_result() {
        let ok = scripted_controller(PingResult::Ok);
        assert!(ok.keepalive().await.is_ok());

        let slow = scripted_controller(PingResult::Timeout);
        assert!(matches!(slow.keepalive().await, Err(SshError::Timeout(_))));

        let dead = scripted_controller(PingResult::IoError);
        assert!(matches!(dead.keepalive().await, Err(SshError::Disconnected)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_controller() {
        let controller = scripted_controller(PingResult::Ok);
        assert!(!Transport::is_closed(&controller));

        controller.close().await;
        for _ in 0..50 {
            if Transport::is_closed(&controller) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(Transport::is_closed(&controller));
        assert_eq!(controller.ping().await, PingResult::IoError);
    }

    #[tokio::test]
    async fn test_drain_answers_pending_pings() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx.send(HandleCommand::Ping { reply_tx }).await.unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert_eq!(reply_rx.await.unwrap(), PingResult::IoError);
        assert!(cmd_tx.is_closed());
    }
}
