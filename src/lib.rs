//! termhub - SSH sessions and tunnels for the developer console
//!
//! Built on russh and tokio. [`SessionManager`] owns every live session;
//! each [`Session`] runs an interactive shell and any number of local or
//! SOCKS5 tunnels over one SSH transport.

pub mod forwarding;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use forwarding::{ForwardStats, TunnelInfo, TunnelKind, TunnelSpec, TunnelStatus};
pub use session::{
    Direction, EventBus, HealthSample, HealthStatus, ManagerError, Session, SessionEvent,
    SessionLogEntry, SessionManager, SessionState, SessionSummary,
};
pub use ssh::{
    AuthMode, AuthResolver, ConnectionPolicy, Connector, DefaultAuthResolver, RusshConnector,
    ServerDescriptor, SshError, Transport,
};

/// Install the `tracing` subscriber
///
/// Filter comes from `RUST_LOG` and defaults to `info`. Calling this more
/// than once, or after the host application installed its own subscriber,
/// is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_logging_twice() {
        super::init_logging();
        super::init_logging();
    }
}
