//! Session Event Bus
//!
//! Multi-consumer topic for session output, disconnects and health samples.
//! Sessions publish without knowing who listens; a GUI bridge, a logger and
//! an exporter can each hold their own subscription.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::health::HealthSample;

/// Default number of events buffered per subscriber
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Session event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Bytes read from the remote stdout or stderr
    Output { session_id: String, data: Vec<u8> },
    /// The connection ended (fired once per connection)
    Disconnected { session_id: String },
    /// New latency sample
    Health {
        session_id: String,
        sample: HealthSample,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Output { session_id, .. }
            | SessionEvent::Disconnected { session_id }
            | SessionEvent::Health { session_id, .. } => session_id,
        }
    }
}

/// Broadcast topic shared by every session of a manager
///
/// Publishing never blocks. A subscriber that falls behind loses the
/// oldest events and sees `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            trace!("Session event dropped, no subscribers");
        }
    }

    pub fn output(&self, session_id: &str, data: Vec<u8>) {
        self.publish(SessionEvent::Output {
            session_id: session_id.to_string(),
            data,
        });
    }

    pub fn disconnected(&self, session_id: &str) {
        self.publish(SessionEvent::Disconnected {
            session_id: session_id.to_string(),
        });
    }

    pub fn health(&self, session_id: &str, sample: HealthSample) {
        self.publish(SessionEvent::Health {
            session_id: session_id.to_string(),
            sample,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        // Should not panic
        bus.output("sess-1", b"hello".to_vec());
        bus.disconnected("sess-1");
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::new();
        let mut gui = bus.subscribe();
        let mut logger = bus.subscribe();

        bus.output("sess-1", b"hi".to_vec());
        bus.disconnected("sess-1");

        for rx in [&mut gui, &mut logger] {
            match rx.recv().await.unwrap() {
                SessionEvent::Output { session_id, data } => {
                    assert_eq!(session_id, "sess-1");
                    assert_eq!(data, b"hi");
                }
                other => panic!("unexpected event: {:?}", other),
            }
            assert!(matches!(
                rx.recv().await.unwrap(),
                SessionEvent::Disconnected { .. }
            ));
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::Disconnected {
            session_id: "sess-1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("disconnected"));
        assert!(json.contains("sess-1"));
        assert_eq!(event.session_id(), "sess-1");
    }
}
