//! Shell channel task
//!
//! One task owns the russh session channel. Terminal input and resizes
//! arrive through a command queue; remote stdout and stderr are split into
//! two output queues so each can be pumped independently.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;
use super::transport::{ShellCommand, ShellIo, ShellOutput};

const COMMAND_QUEUE: usize = 1024;
const OUTPUT_QUEUE: usize = 1024;

/// SSH extended data type for stderr
const EXTENDED_DATA_STDERR: u32 = 1;

/// Spawn the owner task for an interactive shell channel
pub fn spawn_shell_channel(mut channel: Channel<Msg>) -> ShellIo {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(COMMAND_QUEUE);
    let (stdout_tx, stdout_rx) = mpsc::channel::<ShellOutput>(OUTPUT_QUEUE);
    let (stderr_tx, stderr_rx) = mpsc::channel::<ShellOutput>(OUTPUT_QUEUE);
    let channel_id = channel.id();

    tokio::spawn(async move {
        debug!("Shell channel task started for {:?}", channel_id);

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        ShellCommand::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to SSH channel: {}", e);
                                let _ = stdout_tx.send(Err(SshError::from(e))).await;
                                break;
                            }
                        }
                        ShellCommand::Resize { rows, cols } => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                // A failed resize leaves the shell usable
                                error!("Failed to resize PTY: {}", e);
                            } else {
                                debug!("PTY resized to {}x{}", cols, rows);
                            }
                        }
                        ShellCommand::Close => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = stdout_tx.send(Ok(data.to_vec())).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) if ext == EXTENDED_DATA_STDERR => {
                            let _ = stderr_tx.send(Ok(data.to_vec())).await;
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            info!("SSH shell channel {:?} ended", channel_id);
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Remote shell exited with status {}", exit_status);
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        // Dropping both senders ends the output streams
        debug!("Shell channel task terminated for {:?}", channel_id);
    });

    ShellIo {
        input: cmd_tx,
        stdout: stdout_rx,
        stderr: stderr_rx,
    }
}
