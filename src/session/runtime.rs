//! Live SSH session
//!
//! A [`Session`] owns one transport, the interactive shell on it, the output
//! pumps, the keepalive and health tickers, and the tunnels it started.
//! Output and lifecycle notices go out through the shared [`EventBus`].

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::events::EventBus;
use super::health::{HealthSample, HealthTracker};
use super::log_buffer::SessionLog;
use super::reconnect::RetryPolicy;
use super::types::{Direction, SessionLogEntry, SessionState, SessionSummary};
use crate::forwarding::{start_tunnel, TunnelHandle, TunnelInfo, TunnelSpec};
use crate::ssh::{
    ConnectionPolicy, Connector, PtyRequest, ServerDescriptor, ShellCommand, ShellIo, ShellOutput,
    SshError, Transport,
};

pub struct Session {
    id: String,
    descriptor: ServerDescriptor,
    policy: ConnectionPolicy,
    connector: Arc<dyn Connector>,
    events: EventBus,
    created_at: DateTime<Utc>,
    state: AtomicU8,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Held across the send so concurrent writes keep their order
    shell_input: tokio::sync::Mutex<Option<mpsc::Sender<ShellCommand>>>,
    log: Mutex<SessionLog>,
    health: Mutex<HealthTracker>,
    keepalive_stop: Mutex<Option<oneshot::Sender<()>>>,
    health_stop: Mutex<Option<oneshot::Sender<()>>>,
    tunnels: Mutex<Vec<Arc<TunnelHandle>>>,
    /// Disconnect notice guard of the current connection
    notified: Mutex<Arc<AtomicBool>>,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(
        descriptor: ServerDescriptor,
        policy: ConnectionPolicy,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Self {
        let log = SessionLog::with_capacity(policy.max_log_entries);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            descriptor,
            policy,
            connector,
            events,
            created_at: Utc::now(),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            connected_at: Mutex::new(None),
            transport: Mutex::new(None),
            shell_input: tokio::sync::Mutex::new(None),
            log: Mutex::new(log),
            health: Mutex::new(HealthTracker::new()),
            keepalive_stop: Mutex::new(None),
            health_stop: Mutex::new(None),
            tunnels: Mutex::new(Vec::new()),
            notified: Mutex::new(Arc::new(AtomicBool::new(false))),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    /// True once the transport is gone, either closed here or dropped by
    /// the remote side
    pub fn is_torn_down(&self) -> bool {
        if self.torn_down.load(Ordering::SeqCst) {
            return true;
        }
        self.transport().map_or(false, |t| t.is_closed())
    }

    pub fn last_health(&self) -> Option<HealthSample> {
        self.health.lock().last().cloned()
    }

    /// Connect with retries; fails if the shell is already gone on return
    pub async fn connect(self: &Arc<Self>) -> Result<(), SshError> {
        if self.transport().is_some() {
            self.close().await;
        }

        self.set_state(SessionState::Connecting);
        info!(
            "Session {}: connecting to {}@{}",
            self.id,
            self.descriptor.username,
            self.descriptor.address()
        );

        let retry = RetryPolicy::from(&self.policy);
        if let Err(e) = retry.run(&self.id, move |_| self.connect_once()).await {
            self.set_state(SessionState::Disconnected);
            return Err(e);
        }

        // The shell can exit before we get here (nologin, `exit` in a profile)
        if self.torn_down.load(Ordering::SeqCst) {
            warn!("Session {}: shell ended during connect", self.id);
            return Err(SshError::Disconnected);
        }

        info!("Session {}: connected", self.id);
        Ok(())
    }

    /// One dial and shell request, then the probes and output pumps
    ///
    /// The session is `Connected` before the pumps run, so a shell that ends
    /// at once leaves it `Disconnected`.
    pub async fn connect_once(self: &Arc<Self>) -> Result<(), SshError> {
        let transport = self
            .connector
            .connect(&self.descriptor, &self.policy)
            .await?;

        let shell = match transport.open_shell(PtyRequest::default()).await {
            Ok(shell) => shell,
            Err(e) => {
                warn!("Session {}: shell request failed: {}", self.id, e);
                transport.close().await;
                return Err(e);
            }
        };

        let ShellIo {
            input,
            stdout,
            stderr,
        } = shell;

        *self.transport.lock() = Some(transport);
        *self.shell_input.lock().await = Some(input);
        self.torn_down.store(false, Ordering::SeqCst);

        // One notice per connection, shared by both pumps and the keepalive
        let notified = Arc::new(AtomicBool::new(false));
        *self.notified.lock() = notified.clone();

        self.set_state(SessionState::Connected);
        *self.connected_at.lock() = Some(Utc::now());
        self.health.lock().reset();

        if let Some(interval) = self.policy.keepalive_interval() {
            self.start_keepalive(interval);
        }
        self.start_health(self.policy.health_interval());

        self.spawn_pump(stdout, "stdout", notified.clone());
        self.spawn_pump(stderr, "stderr", notified);

        Ok(())
    }

    fn spawn_pump(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<ShellOutput>,
        stream: &'static str,
        notified: Arc<AtomicBool>,
    ) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    Ok(data) => {
                        session.log.lock().record(&session.id, Direction::Output, &data);
                        session.events.output(&session.id, data);
                    }
                    Err(e) => {
                        error!("Session {}: {} read error: {}", session.id, stream, e);
                        break;
                    }
                }
            }
            debug!("Session {}: {} pump ended", session.id, stream);
            session.notify_disconnect(&notified).await;
        });
    }

    /// Publish the disconnect notice once per connection, then tear down
    async fn notify_disconnect(&self, notified: &AtomicBool) {
        if notified.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Session {}: connection lost", self.id);
        self.events.disconnected(&self.id);
        self.close().await;
    }

    fn start_keepalive(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *self.keepalive_stop.lock() = Some(stop_tx);
        let weak: Weak<Session> = Arc::downgrade(self);
        let notified = self.notified.lock().clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick completes immediately

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(session) = weak.upgrade() else { break };
                        let Some(transport) = session.transport() else { break };
                        if let Err(e) = transport.keepalive().await {
                            warn!("Session {}: keepalive failed: {}", session.id, e);
                            session.notify_disconnect(&notified).await;
                            break;
                        }
                        debug!("Session {}: keepalive ok", session.id);
                    }
                }
            }
        });
    }

    fn start_health(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *self.health_stop.lock() = Some(stop_tx);
        let weak: Weak<Session> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(session) = weak.upgrade() else { break };
                        if let Err(e) = session.probe_health().await {
                            debug!("Session {}: health probe failed: {}", session.id, e);
                        }
                    }
                }
            }
        });
    }

    /// Time one keepalive round trip and publish the sample
    pub async fn probe_health(&self) -> Result<HealthSample, SshError> {
        let transport = self.transport().ok_or(SshError::NotConnected)?;

        let start = Instant::now();
        transport.keepalive().await?;
        let latency_ms = start.elapsed().as_millis() as u64;

        let sample = self.health.lock().record(latency_ms);
        debug!(
            "Session {}: latency {}ms (avg {}ms, {:?})",
            self.id, sample.latency_ms, sample.avg_latency_ms, sample.status
        );
        self.events.health(&self.id, sample.clone());
        Ok(sample)
    }

    /// Send bytes to the remote shell
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        let input = self.shell_input.lock().await;
        let input = input.as_ref().ok_or(SshError::NotConnected)?;

        input
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| SshError::Disconnected)?;

        self.log.lock().record(&self.id, Direction::Input, data);
        Ok(())
    }

    pub async fn resize(&self, rows: u32, cols: u32) -> Result<(), SshError> {
        let input = self.shell_input.lock().await;
        let input = input.as_ref().ok_or(SshError::NotConnected)?;

        input
            .send(ShellCommand::Resize { rows, cols })
            .await
            .map_err(|_| SshError::Disconnected)
    }

    /// Tear everything down; calling it again is a no-op
    ///
    /// An explicit close suppresses the disconnect notice of the current
    /// connection.
    pub async fn close(&self) {
        self.notified.lock().store(true, Ordering::SeqCst);

        if let Some(stop) = self.keepalive_stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(stop) = self.health_stop.lock().take() {
            let _ = stop.send(());
        }

        let tunnels = std::mem::take(&mut *self.tunnels.lock());
        for tunnel in &tunnels {
            tunnel.stop().await;
        }

        let input = self.shell_input.lock().await.take();
        if let Some(input) = input {
            // The shell task may already be gone
            let _ = input.try_send(ShellCommand::Close);
        }

        let transport = self.transport.lock().take();
        self.set_state(SessionState::Disconnected);
        self.torn_down.store(true, Ordering::SeqCst);

        let had_transport = transport.is_some();
        if let Some(transport) = transport {
            transport.close().await;
        }

        if had_transport {
            info!(
                "Session {}: closed ({} tunnels stopped)",
                self.id,
                tunnels.len()
            );
        }
    }

    /// Start a tunnel over this session's transport
    pub async fn create_tunnel(&self, spec: TunnelSpec) -> Result<TunnelInfo, SshError> {
        let transport = self
            .transport()
            .filter(|t| !t.is_closed())
            .ok_or(SshError::NotConnected)?;

        let handle = start_tunnel(transport, spec).await?;
        let info = handle.info();
        self.tunnels.lock().push(Arc::new(handle));

        info!("Session {}: tunnel {} started", self.id, info.id);
        Ok(info)
    }

    pub async fn stop_tunnel(&self, tunnel_id: &str) -> Result<(), SshError> {
        let handle = {
            let mut tunnels = self.tunnels.lock();
            let index = tunnels
                .iter()
                .position(|t| t.id() == tunnel_id)
                .ok_or_else(|| SshError::TunnelError(format!("Tunnel not found: {}", tunnel_id)))?;
            tunnels.remove(index)
        };

        handle.stop().await;
        Ok(())
    }

    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.tunnels.lock().iter().map(|t| t.info()).collect()
    }

    /// Snapshot of the I/O log, oldest first
    pub fn logs(&self) -> Vec<SessionLogEntry> {
        self.log.lock().entries()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            server_name: self.descriptor.name.clone(),
            host: self.descriptor.host.clone(),
            port: self.descriptor.port,
            username: self.descriptor.username.clone(),
            state: self.state(),
            created_at: self.created_at,
            connected_at: *self.connected_at.lock(),
            log_entries: self.log.lock().len(),
            tunnels: self.tunnels.lock().len(),
            last_health: self.last_health(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.descriptor.address())
            .field("state", &self.state())
            .finish()
    }
}
