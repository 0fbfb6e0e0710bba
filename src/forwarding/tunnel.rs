//! Tunnel listener and handle
//!
//! Binds the local address, runs the accept loop and dispatches each
//! connection to the local or SOCKS5 handler. Per-connection failures are
//! logged and never affect the listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{dynamic, local, ForwardStats, TunnelInfo, TunnelSpec, TunnelStatus};
use crate::ssh::{SshError, Transport};

/// Handle to a running tunnel
pub struct TunnelHandle {
    id: String,
    spec: TunnelSpec,
    /// Actual bound address (may differ from requested if port was 0)
    bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl TunnelHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Check if the accept loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            kind: self.spec.kind(),
            bound_addr: self.bound_addr.to_string(),
            remote: self.spec.remote(),
            status: if self.is_running() {
                TunnelStatus::Active
            } else {
                TunnelStatus::Stopped
            },
            stats: self.stats(),
        }
    }

    /// Stop accepting connections
    ///
    /// Returns once the accept loop has exited and the listener is
    /// dropped. Connections already bridged drain on their own.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().take();
        let Some(stop_tx) = stop_tx else {
            return;
        };

        info!("Stopping tunnel {} on {}", self.id, self.bound_addr);
        let _ = stop_tx.send(());

        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Tunnel {} accept loop ended abnormally: {}", self.id, e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("bound_addr", &self.bound_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn bind_listener(addr: &str) -> Result<TcpListener, SshError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::TunnelError(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::TunnelError(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::TunnelError(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => SshError::TunnelError(format!("Failed to bind to {}: {}", addr, e)),
    })
}

/// Bind the tunnel's local address and start accepting connections
///
/// Bind errors are returned before any task is spawned.
pub async fn start_tunnel(
    transport: Arc<dyn Transport>,
    spec: TunnelSpec,
) -> Result<TunnelHandle, SshError> {
    let listener = bind_listener(&spec.bind_addr()).await?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::TunnelError(format!("Failed to get bound address: {}", e)))?;

    let id = uuid::Uuid::new_v4().to_string();
    match spec.remote() {
        Some(remote) => info!("Started local tunnel {}: {} -> {}", id, bound_addr, remote),
        None => info!("Started SOCKS5 tunnel {} on {}", id, bound_addr),
    }

    let running = Arc::new(AtomicBool::new(true));
    let (stop_tx, stop_rx) = oneshot::channel();
    let stats = Arc::new(RwLock::new(ForwardStats::default()));

    let accept_task = tokio::spawn(accept_loop(
        listener,
        transport,
        spec.clone(),
        id.clone(),
        stop_rx,
        running.clone(),
        stats.clone(),
    ));

    Ok(TunnelHandle {
        id,
        spec,
        bound_addr,
        running,
        stop_tx: Mutex::new(Some(stop_tx)),
        accept_task: Mutex::new(Some(accept_task)),
        stats,
    })
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    spec: TunnelSpec,
    tunnel_id: String,
    mut stop_rx: oneshot::Receiver<()>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ForwardStats>>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("Tunnel {} stopped by request", tunnel_id);
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("Tunnel {}: accepted connection from {}", tunnel_id, peer_addr);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let transport = transport.clone();
                        let spec = spec.clone();
                        let stats_for_conn = stats.clone();
                        let tunnel_id = tunnel_id.clone();

                        tokio::spawn(async move {
                            let result = match &spec {
                                TunnelSpec::Local { remote_host, remote_port, .. } => {
                                    local::handle_forward_connection(
                                        transport,
                                        stream,
                                        peer_addr,
                                        remote_host,
                                        *remote_port,
                                        stats_for_conn.clone(),
                                    )
                                    .await
                                }
                                TunnelSpec::Dynamic { .. } => {
                                    dynamic::handle_socks5_connection(
                                        transport,
                                        stream,
                                        peer_addr,
                                        stats_for_conn.clone(),
                                    )
                                    .await
                                }
                            };

                            {
                                let mut s = stats_for_conn.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }

                            if let Err(e) = result {
                                warn!("Tunnel {}: connection from {} failed: {}", tunnel_id, peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Tunnel {} accept error: {}", tunnel_id, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("Tunnel {} accept loop exited", tunnel_id);
}
