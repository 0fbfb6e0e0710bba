//! Session Management Module
//!
//! Provides the session registry with:
//! - Concurrent connection limiting
//! - Thread-safe session access via DashMap
//! - Connect retries with exponential backoff
//! - Connection health monitoring
//! - Bounded per-session I/O logs
//! - Event bus for output, disconnect and health notices

mod events;
pub mod export;
mod health;
mod log_buffer;
mod reconnect;
mod registry;
mod runtime;
mod types;

pub use events::{EventBus, SessionEvent};
pub use health::{HealthSample, HealthStatus, HealthThresholds, HealthTracker};
pub use log_buffer::{SessionLog, DEFAULT_MAX_ENTRIES};
pub use reconnect::RetryPolicy;
pub use registry::{ManagerError, SessionManager, REAPER_INTERVAL};
pub use runtime::Session;
pub use types::{Direction, SessionLogEntry, SessionState, SessionSummary};
