//! SSH client: russh handler and the production [`Connector`]

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{ssh_key, PublicKey};
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use super::auth::{AgentConnection, AuthMaterial, AuthResolver};
use super::config::{ConnectionPolicy, ServerDescriptor};
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::transport::{Connector, Transport};

/// russh callbacks; host key checks are delegated to the [`AuthResolver`]
pub struct ClientHandler {
    host: String,
    port: u16,
    resolver: Arc<dyn AuthResolver>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, resolver: Arc<dyn AuthResolver>) -> Self {
        Self {
            host,
            port,
            resolver,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.resolver
            .verify_host_key(&self.host, self.port, server_public_key)
    }
}

/// Dials servers with russh and hands back a [`HandleController`](super::HandleController)
pub struct RusshConnector {
    resolver: Arc<dyn AuthResolver>,
}

impl RusshConnector {
    pub fn new(resolver: Arc<dyn AuthResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        policy: &ConnectionPolicy,
    ) -> Result<Arc<dyn Transport>, SshError> {
        // Auth material first: a resolver failure must not touch the network
        let auth = self.resolver.resolve_auth(descriptor).await?;

        info!("Connecting to SSH server at {}", descriptor.address());

        // Liveness is driven by the session's own keepalive ticker
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: None,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            descriptor.host.clone(),
            descriptor.port,
            self.resolver.clone(),
        );

        let mut handle = tokio::time::timeout(
            policy.connect_timeout(),
            client::connect(
                Arc::new(ssh_config),
                (descriptor.host.as_str(), descriptor.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connection to {} timed out after {}s",
                descriptor.address(),
                policy.connect_timeout().as_secs()
            ))
        })??;

        debug!("SSH handshake completed with {}", descriptor.address());

        if let Err(e) = authenticate(&mut handle, &descriptor.username, auth).await {
            warn!("Authentication failed for {}: {}", descriptor.address(), e);
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(e);
        }

        info!(
            "SSH authentication successful for {}@{}",
            descriptor.username,
            descriptor.address()
        );

        Ok(Arc::new(spawn_handle_owner_task(handle, descriptor.address())))
    }
}

/// Borrows the agent for one signature; the key is cloned up front so the
/// signing future stays `Send`
struct AgentSigner<'a>(&'a mut AgentConnection);

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.0
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    username: &str,
    auth: AuthMaterial,
) -> Result<(), SshError> {
    match auth {
        AuthMaterial::Agent { mut agent, keys } => {
            for key in &keys {
                let result = handle
                    .authenticate_publickey_with(
                        username,
                        key.clone(),
                        None,
                        &mut AgentSigner(&mut agent),
                    )
                    .await;
                match result {
                    Ok(result) if result.success() => {
                        info!("Agent key accepted: {}", key.comment());
                        return Ok(());
                    }
                    Ok(_) => debug!("Agent key rejected: {}", key.comment()),
                    Err(e) => warn!("Agent signing failed for {}: {}", key.comment(), e),
                }
            }
            Err(SshError::AuthenticationFailed(format!(
                "None of the {} agent keys was accepted",
                keys.len()
            )))
        }
        AuthMaterial::PrivateKey(key) => {
            let key_with_hash = PrivateKeyWithHashAlg::new(key, None);
            let result = handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if result.success() {
                Ok(())
            } else {
                Err(SshError::AuthenticationFailed(
                    "Authentication rejected by server".to_string(),
                ))
            }
        }
    }
}
