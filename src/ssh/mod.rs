//! SSH module - transports, authentication and host key verification
//!
//! Built on russh. The rest of the crate only depends on the [`Transport`]
//! and [`Connector`] traits; [`RusshConnector`] is the production connector
//! and [`HandleController`] the production transport.

mod auth;
mod client;
mod config;
mod error;
mod handle_owner;
mod known_hosts;
mod session;
mod transport;

pub use auth::{
    default_key_paths, load_private_key, AgentConnection, AuthMaterial, AuthResolver,
    DefaultAuthResolver,
};
pub use client::{ClientHandler, RusshConnector};
pub use config::{
    AuthMode, ConnectionPolicy, ServerDescriptor, HARD_MAX_SESSIONS, MAX_RETRY_BACKOFF,
};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use session::spawn_shell_channel;
pub use transport::{
    AsyncStream, Connector, PtyRequest, ShellCommand, ShellIo, ShellOutput, Transport,
    TunnelStream,
};
