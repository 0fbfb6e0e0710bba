//! Port Forwarding Module
//!
//! Local (`-L`) and dynamic SOCKS5 (`-D`) tunnels carried over
//! `direct-tcpip` channels of a session's transport.

mod bridge;
mod dynamic;
mod local;
mod tunnel;

use serde::{Deserialize, Serialize};

pub use bridge::{bridge_streams, FORWARD_IDLE_TIMEOUT};
pub use dynamic::{read_connect_request, TargetAddr};
pub use tunnel::{start_tunnel, TunnelHandle};

/// Tunnel definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelSpec {
    /// Fixed local port to one remote destination
    Local {
        /// Local address to bind to (e.g., "127.0.0.1:8888")
        local_addr: String,
        remote_host: String,
        remote_port: u16,
    },
    /// SOCKS5 proxy; destination chosen per connection
    Dynamic { local_host: String, local_port: u16 },
}

impl TunnelSpec {
    pub fn local(local_addr: impl Into<String>, remote_host: impl Into<String>, remote_port: u16) -> Self {
        TunnelSpec::Local {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn dynamic(local_host: impl Into<String>, local_port: u16) -> Self {
        TunnelSpec::Dynamic {
            local_host: local_host.into(),
            local_port,
        }
    }

    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelSpec::Local { .. } => TunnelKind::Local,
            TunnelSpec::Dynamic { .. } => TunnelKind::Dynamic,
        }
    }

    /// Address handed to `TcpListener::bind`
    pub fn bind_addr(&self) -> String {
        match self {
            TunnelSpec::Local { local_addr, .. } => local_addr.clone(),
            TunnelSpec::Dynamic {
                local_host,
                local_port,
            } if local_host.contains(':') => format!("[{}]:{}", local_host, local_port),
            TunnelSpec::Dynamic {
                local_host,
                local_port,
            } => format!("{}:{}", local_host, local_port),
        }
    }

    /// Fixed destination, if any
    pub fn remote(&self) -> Option<String> {
        match self {
            TunnelSpec::Local {
                remote_host,
                remote_port,
                ..
            } => Some(format!("{}:{}", remote_host, remote_port)),
            TunnelSpec::Dynamic { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    Local,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Stopped,
}

/// Statistics for a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> client)
    pub bytes_received: u64,
}

/// Tunnel info for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub kind: TunnelKind,
    /// Actual bound address (differs from the requested one for port 0)
    pub bound_addr: String,
    pub remote: Option<String>,
    pub status: TunnelStatus,
    pub stats: ForwardStats,
}
