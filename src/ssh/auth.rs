//! Authentication material resolution
//!
//! The session layer consumes authentication through [`AuthResolver`]:
//! agent lookup, private-key loading and host-key verification. Callers can
//! inject their own resolver; [`DefaultAuthResolver`] covers the usual
//! desktop setup (system agent, `~/.ssh` keys, `known_hosts`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::{PrivateKey, PublicKey};
use tracing::{debug, info, warn};

use super::config::{ConnectionPolicy, ServerDescriptor};
use super::error::SshError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// Connection to the system SSH agent
pub type AgentConnection = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

#[cfg(windows)]
const WINDOWS_AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// Resolved credentials for one connection attempt
pub enum AuthMaterial {
    /// Agent connection plus the identities it offered
    Agent {
        agent: AgentConnection,
        keys: Vec<PublicKey>,
    },
    /// Sign with a loaded private key
    PrivateKey(Arc<PrivateKey>),
}

impl std::fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMaterial::Agent { keys, .. } => write!(f, "Agent({} keys)", keys.len()),
            AuthMaterial::PrivateKey(key) => write!(f, "PrivateKey({})", key.algorithm()),
        }
    }
}

#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// Pick the authentication method for a server
    async fn resolve_auth(&self, descriptor: &ServerDescriptor) -> Result<AuthMaterial, SshError>;

    /// Host-key policy: `Ok(true)` accepts, `Ok(false)` or `Err` rejects
    fn verify_host_key(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, SshError>;
}

/// Agent / key-file / known_hosts resolver
pub struct DefaultAuthResolver {
    known_hosts: KnownHostsStore,
    strict: bool,
}

impl DefaultAuthResolver {
    pub fn new(known_hosts_path: PathBuf, strict: bool) -> Self {
        Self {
            known_hosts: KnownHostsStore::with_path(known_hosts_path),
            strict,
        }
    }

    pub fn from_policy(policy: &ConnectionPolicy) -> Self {
        Self::new(policy.known_hosts_path(), policy.strict_host_key_checking)
    }
}

#[async_trait]
impl AuthResolver for DefaultAuthResolver {
    async fn resolve_auth(&self, descriptor: &ServerDescriptor) -> Result<AuthMaterial, SshError> {
        if descriptor.wants_agent() {
            match agent_identities().await {
                Ok((agent, keys)) => {
                    debug!(
                        "Using SSH agent for {} ({} keys)",
                        descriptor.address(),
                        keys.len()
                    );
                    return Ok(AuthMaterial::Agent { agent, keys });
                }
                Err(e) if descriptor.key_path.is_none() => return Err(e),
                Err(e) => warn!(
                    "SSH agent unusable for {} ({}), falling back to key file",
                    descriptor.address(),
                    e
                ),
            }
        }

        let key = match &descriptor.key_path {
            Some(path) => load_private_key(path).await?,
            None => load_default_key().await?,
        };
        Ok(AuthMaterial::PrivateKey(Arc::new(key)))
    }

    fn verify_host_key(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, SshError> {
        match self.known_hosts.verify(host, port, key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", host, port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                        host, port, fingerprint
                    );
                    return Err(SshError::HostKeyRejected(format!(
                        "unknown host {}:{} ({})",
                        host, port, fingerprint
                    )));
                }
                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    host, port, fingerprint
                );
                if let Err(e) = self.known_hosts.add_host(host, port, key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}",
                    host, port, expected_fingerprint, actual_fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} has changed (expected {}, got {})",
                    host, port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

async fn open_agent() -> Result<AgentConnection, SshError> {
    #[cfg(unix)]
    let agent = AgentClient::connect_env().await.map(AgentClient::dynamic);
    #[cfg(windows)]
    let agent = AgentClient::connect_named_pipe(WINDOWS_AGENT_PIPE)
        .await
        .map(AgentClient::dynamic);
    #[cfg(not(any(unix, windows)))]
    let agent: Result<AgentConnection, String> = Err("unsupported platform".to_string());

    agent.map_err(|e| SshError::AgentNotAvailable(e.to_string()))
}

/// Open the agent and list its identities; an empty agent is an error
async fn agent_identities() -> Result<(AgentConnection, Vec<PublicKey>), SshError> {
    #[cfg(unix)]
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return Err(SshError::AgentNotAvailable("SSH_AUTH_SOCK is not set".to_string()));
    }

    let mut agent = open_agent().await?;
    let keys = agent
        .request_identities()
        .await
        .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;
    if keys.is_empty() {
        return Err(SshError::AgentError("SSH agent has no keys loaded".to_string()));
    }
    Ok((agent, keys))
}

/// Load an unencrypted private key off the runtime threads
pub async fn load_private_key(path: &Path) -> Result<PrivateKey, SshError> {
    let path = expand_tilde(path);
    if !path.exists() {
        return Err(SshError::KeyError(format!(
            "Key file not found: {}",
            path.display()
        )));
    }

    debug!("Loading key from: {:?}", path);
    tokio::task::spawn_blocking(move || russh::keys::load_secret_key(&path, None))
        .await
        .map_err(|e| SshError::KeyError(format!("Task join error: {}", e)))?
        .map_err(SshError::from)
}

async fn load_default_key() -> Result<PrivateKey, SshError> {
    for path in default_key_paths() {
        if !path.exists() {
            continue;
        }
        match load_private_key(&path).await {
            Ok(key) => {
                info!("Loaded key from: {:?}", path);
                return Ok(key);
            }
            Err(e) => debug!("Failed to load {:?}: {}", path, e),
        }
    }
    Err(SshError::KeyError("No usable key in ~/.ssh".to_string()))
}

/// Get default SSH key paths
pub fn default_key_paths() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let ssh_dir = home.join(".ssh");

    vec![
        ssh_dir.join("id_ed25519"),
        ssh_dir.join("id_ecdsa"),
        ssh_dir.join("id_rsa"),
    ]
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        if dirs::home_dir().is_some() {
            let path = expand_tilde(Path::new("~/.ssh/id_rsa"));
            assert!(!path.to_string_lossy().starts_with('~'));
        }
        let absolute = expand_tilde(Path::new("/etc/ssh/key"));
        assert_eq!(absolute, PathBuf::from("/etc/ssh/key"));
    }

    #[tokio::test]
    async fn test_missing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_private_key(&dir.path().join("id_missing")).await;
        assert!(matches!(result, Err(SshError::KeyError(_))));
    }

    #[tokio::test]
    async fn test_key_mode_with_missing_file_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DefaultAuthResolver::new(dir.path().join("known_hosts"), false);
        let descriptor =
            ServerDescriptor::new("example.com", 22, "dev").with_key(dir.path().join("nope"));
        let result = resolver.resolve_auth(&descriptor).await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_without_socket() {
        if std::env::var_os("SSH_AUTH_SOCK").is_some() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let resolver = DefaultAuthResolver::new(dir.path().join("known_hosts"), false);

        let agent_only = ServerDescriptor::new("example.com", 22, "dev").with_agent();
        let result = resolver.resolve_auth(&agent_only).await;
        assert!(matches!(result, Err(SshError::AgentNotAvailable(_))));

        // Falls through to the configured key file
        let with_key = ServerDescriptor::new("example.com", 22, "dev")
            .with_agent()
            .with_key(dir.path().join("id_missing"));
        let result = resolver.resolve_auth(&with_key).await;
        assert!(matches!(result, Err(SshError::KeyError(_))));
    }
}
