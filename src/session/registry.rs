//! Session Manager
//!
//! Thread-safe session registry using DashMap for concurrent access.
//! Enforces the connection limit and reaps sessions whose transport died.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::events::{EventBus, SessionEvent};
use super::runtime::Session;
use super::types::{SessionLogEntry, SessionSummary};
use crate::forwarding::{TunnelInfo, TunnelSpec};
use crate::ssh::{
    AuthResolver, ConnectionPolicy, Connector, DefaultAuthResolver, RusshConnector,
    ServerDescriptor, SshError,
};

/// How often torn-down sessions are swept from the registry
pub const REAPER_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Connection limit reached: {current}/{max} sessions active")]
    CapacityReached { current: usize, max: usize },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl serde::Serialize for ManagerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

struct SessionEntry {
    order: usize,
    session: Arc<Session>,
}

/// Counts a create in flight until dropped
struct SlotReservation<'a>(&'a AtomicUsize);

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionManager {
    sessions: DashMap<String, SessionEntry>,
    /// Counter for creation order
    order_counter: AtomicUsize,
    /// Creates that hold a slot but are still connecting
    connecting: AtomicUsize,
    /// Lock for create_session to prevent TOCTOU race
    create_lock: parking_lot::Mutex<()>,
    policy: ConnectionPolicy,
    connector: Arc<dyn Connector>,
    events: EventBus,
    reaper_stop: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl SessionManager {
    /// Create a manager without the background reaper
    pub fn new(policy: ConnectionPolicy, connector: Arc<dyn Connector>, events: EventBus) -> Self {
        if policy.max_sessions > policy.effective_max_sessions() {
            warn!(
                "Configured max_sessions {} exceeds the hard limit, using {}",
                policy.max_sessions,
                policy.effective_max_sessions()
            );
        }

        Self {
            sessions: DashMap::new(),
            order_counter: AtomicUsize::new(0),
            connecting: AtomicUsize::new(0),
            create_lock: parking_lot::Mutex::new(()),
            policy,
            connector,
            events,
            reaper_stop: parking_lot::Mutex::new(None),
        }
    }

    /// Create a shared manager and start its reaper
    pub fn start(
        policy: ConnectionPolicy,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Arc<Self> {
        let manager = Arc::new(Self::new(policy, connector, events));
        manager.spawn_reaper(REAPER_INTERVAL);
        manager
    }

    /// Manager backed by russh with the default agent/key/known-hosts policy
    pub fn with_russh(policy: ConnectionPolicy) -> Arc<Self> {
        let resolver: Arc<dyn AuthResolver> = Arc::new(DefaultAuthResolver::from_policy(&policy));
        Self::with_resolver(policy, resolver)
    }

    pub fn with_resolver(policy: ConnectionPolicy, resolver: Arc<dyn AuthResolver>) -> Arc<Self> {
        let connector = Arc::new(RusshConnector::new(resolver));
        Self::start(policy, connector, EventBus::new())
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, ManagerError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))
    }

    /// Connect a new session and register it
    ///
    /// The session is only registered once connected. A failed connect
    /// leaves the registry unchanged.
    pub async fn create_session(
        &self,
        descriptor: ServerDescriptor,
    ) -> Result<String, ManagerError> {
        let _reservation = {
            // Hold lock to prevent TOCTOU race between count check and reserve
            let _guard = self.create_lock.lock();

            let current = self.sessions.len() + self.connecting.load(Ordering::SeqCst);
            let max = self.policy.effective_max_sessions();
            if current >= max {
                warn!(
                    "Refusing session to {}: {}/{} slots in use",
                    descriptor.address(),
                    current,
                    max
                );
                return Err(ManagerError::CapacityReached { current, max });
            }

            self.connecting.fetch_add(1, Ordering::SeqCst);
            SlotReservation(&self.connecting)
        };

        let session = Arc::new(Session::new(
            descriptor,
            self.policy.clone(),
            self.connector.clone(),
            self.events.clone(),
        ));
        session.connect().await?;

        let session_id = session.id().to_string();
        let order = self.order_counter.fetch_add(1, Ordering::SeqCst);

        info!(
            "Registered session {}: {}@{} (order: {})",
            session_id,
            session.descriptor().username,
            session.descriptor().address(),
            order
        );

        self.sessions
            .insert(session_id.clone(), SessionEntry { order, session });
        Ok(session_id)
    }

    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), ManagerError> {
        let session = self.session(session_id)?;
        session.write(data).await?;
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, rows: u32, cols: u32) -> Result<(), ManagerError> {
        let session = self.session(session_id)?;
        session.resize(rows, cols).await?;
        Ok(())
    }

    /// Remove a session from the registry and close it
    pub async fn close_session(&self, session_id: &str) -> Result<(), ManagerError> {
        let (_, entry) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))?;

        info!("Closing session {}", session_id);
        entry.session.close().await;
        Ok(())
    }

    pub fn get_session_logs(&self, session_id: &str) -> Result<Vec<SessionLogEntry>, ManagerError> {
        Ok(self.session(session_id)?.logs())
    }

    pub async fn create_tunnel(
        &self,
        session_id: &str,
        spec: TunnelSpec,
    ) -> Result<TunnelInfo, ManagerError> {
        let session = self.session(session_id)?;
        Ok(session.create_tunnel(spec).await?)
    }

    pub async fn stop_tunnel(&self, session_id: &str, tunnel_id: &str) -> Result<(), ManagerError> {
        let session = self.session(session_id)?;
        session.stop_tunnel(tunnel_id).await?;
        Ok(())
    }

    pub fn list_tunnels(&self, session_id: &str) -> Result<Vec<TunnelInfo>, ManagerError> {
        Ok(self.session(session_id)?.list_tunnels())
    }

    /// Summaries of every registered session, oldest first
    pub fn get_all_sessions(&self) -> Vec<SessionSummary> {
        let mut entries: Vec<(usize, SessionSummary)> = self
            .sessions
            .iter()
            .map(|entry| (entry.order, entry.session.summary()))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Remove sessions whose transport has been torn down
    pub fn reap_stale(&self) -> usize {
        let stale_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.session.is_torn_down())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in &stale_ids {
            if self.sessions.remove(id).is_some() {
                debug!("Reaped session {}", id);
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Reaped {} stale sessions", removed);
        }
        removed
    }

    /// Sweep torn-down sessions every `interval` until shutdown
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        if let Some(previous) = self.reaper_stop.lock().replace(stop_tx) {
            let _ = previous.send(());
        }
        let weak: Weak<SessionManager> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.reap_stale();
                    }
                }
            }
            debug!("Session reaper stopped");
        });
    }

    /// Stop the reaper, close every session and clear the registry
    pub async fn shutdown(&self) {
        if let Some(stop) = self.reaper_stop.lock().take() {
            let _ = stop.send(());
        }

        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!("Closing {} sessions on shutdown", session_ids.len());

        for session_id in session_ids {
            if let Some((_, entry)) = self.sessions.remove(&session_id) {
                entry.session.close().await;
            }
        }
        self.sessions.clear();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("connecting", &self.connecting.load(Ordering::SeqCst))
            .field("max_sessions", &self.policy.effective_max_sessions())
            .finish()
    }
}
