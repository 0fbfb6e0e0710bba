//! In-memory transports for unit tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::ssh::{
    ConnectionPolicy, Connector, PtyRequest, ServerDescriptor, ShellCommand, ShellIo, ShellOutput,
    SshError, Transport, TunnelStream,
};

/// Remote end of a mock shell, driven by the test
pub(crate) struct RemoteShell {
    pub input: mpsc::Receiver<ShellCommand>,
    pub stdout: mpsc::Sender<ShellOutput>,
    pub stderr: mpsc::Sender<ShellOutput>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_shell: AtomicBool,
    fail_direct_tcpip: AtomicBool,
    fail_keepalive: AtomicBool,
    hang_up_shell: AtomicBool,
    remote_shell: Mutex<Option<RemoteShell>>,
    pty: Mutex<Option<PtyRequest>>,
    targets: Mutex<Vec<(String, u16)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_direct_tcpip(&self, fail: bool) {
        self.fail_direct_tcpip.store(fail, Ordering::SeqCst);
    }

    pub fn fail_keepalive(&self, fail: bool) {
        self.fail_keepalive.store(fail, Ordering::SeqCst);
    }

    pub fn fail_shell(&self, fail: bool) {
        self.fail_shell.store(fail, Ordering::SeqCst);
    }

    /// Shells opened from now on have their output already closed
    pub fn hang_up_shell(&self, hang_up: bool) {
        self.hang_up_shell.store(hang_up, Ordering::SeqCst);
    }

    pub fn take_remote_shell(&self) -> Option<RemoteShell> {
        self.remote_shell.lock().take()
    }

    pub fn requested_pty(&self) -> Option<PtyRequest> {
        self.pty.lock().clone()
    }

    pub fn opened_targets(&self) -> Vec<(String, u16)> {
        self.targets.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_shell(&self, pty: PtyRequest) -> Result<ShellIo, SshError> {
        if self.fail_shell.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("shell request refused".into()));
        }

        let (input_tx, input_rx) = mpsc::channel(64);
        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);

        *self.pty.lock() = Some(pty);
        if !self.hang_up_shell.load(Ordering::SeqCst) {
            *self.remote_shell.lock() = Some(RemoteShell {
                input: input_rx,
                stdout: stdout_tx,
                stderr: stderr_tx,
            });
        }

        Ok(ShellIo {
            input: input_tx,
            stdout: stdout_rx,
            stderr: stderr_rx,
        })
    }

    /// Echoes everything back, like a remote `cat`
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        _originator_host: &str,
        _originator_port: u16,
    ) -> Result<TunnelStream, SshError> {
        if self.fail_direct_tcpip.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError(format!(
                "connect to {}:{} refused",
                host, port
            )));
        }
        self.targets.lock().push((host.to_string(), port));

        let (local, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });
        Ok(Box::pin(local))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        if self.fail_keepalive.load(Ordering::SeqCst) {
            return Err(SshError::Timeout("keepalive".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        // Remote side goes away with the transport
        self.remote_shell.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector that fails a scripted number of attempts
#[derive(Default)]
pub(crate) struct MockConnector {
    attempts: AtomicU32,
    failures: AtomicU32,
    fail_shell: AtomicBool,
    hang_up_shell: AtomicBool,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` attempts
    pub fn failing_first(n: u32) -> Self {
        let connector = Self::default();
        connector.failures.store(n, Ordering::SeqCst);
        connector
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    /// Transports handed out will refuse the shell request
    pub fn refusing_shell() -> Self {
        let connector = Self::default();
        connector.fail_shell.store(true, Ordering::SeqCst);
        connector
    }

    /// Shells exit as soon as they are opened, like a `nologin` account
    pub fn hanging_up_shell() -> Self {
        let connector = Self::default();
        connector.hang_up_shell.store(true, Ordering::SeqCst);
        connector
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        _policy: &ConnectionPolicy,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures.load(Ordering::SeqCst) {
            return Err(SshError::ConnectionFailed(format!(
                "{} unreachable (attempt {})",
                descriptor.address(),
                attempt
            )));
        }

        let transport = Arc::new(MockTransport::new());
        transport.fail_shell(self.fail_shell.load(Ordering::SeqCst));
        transport.hang_up_shell(self.hang_up_shell.load(Ordering::SeqCst));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Policy with millisecond backoff and no background probes
pub(crate) fn fast_policy() -> ConnectionPolicy {
    ConnectionPolicy {
        retry_backoff_ms: 1,
        keepalive_interval_secs: 0,
        health_interval_ms: 60_000,
        ..Default::default()
    }
}

pub(crate) fn test_descriptor() -> ServerDescriptor {
    ServerDescriptor::new("build.example.com", 22, "deploy")
}
