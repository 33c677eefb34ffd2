//! SSH transport establishment
//!
//! Dials, verifies the host identity during the handshake, then walks the
//! resolver's ordered offer list until the server accepts one. A rejected
//! offer moves to the next; a transport error aborts. When every offer is
//! rejected the stored secrets for the host identity are invalidated so
//! the next attempt re-prompts instead of replaying stale material.

use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::verify::HostVerifier;
use crate::auth::resolver::{AuthOffer, AuthResolver, InteractivePrompt};
use crate::config::{CoreConfig, Credential, HostConfig};
use crate::error::{ConnectFailure, Error};

/// Ceiling for one keyboard-interactive answer from the prompt source.
const KBI_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// russh callback handler. Host verification runs here, inside the
/// handshake, so no channel can open before the identity check resolves.
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<HostVerifier>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, verifier: Arc<HostVerifier>) -> Self {
        Self {
            host,
            port,
            verifier,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verifier
            .verify(&self.host, self.port, server_public_key)
            .await
    }
}

/// Builds authenticated transports and hands each one to its owner task.
pub struct SshConnector {
    config: Arc<CoreConfig>,
    resolver: Arc<AuthResolver>,
    verifier: Arc<HostVerifier>,
}

impl SshConnector {
    pub fn new(
        config: Arc<CoreConfig>,
        resolver: Arc<AuthResolver>,
        verifier: Arc<HostVerifier>,
    ) -> Self {
        Self {
            config,
            resolver,
            verifier,
        }
    }

    pub fn resolver(&self) -> &Arc<AuthResolver> {
        &self.resolver
    }

    /// Establish, verify and authenticate one transport.
    pub async fn connect(
        &self,
        host: &HostConfig,
        explicit: Option<&Credential>,
    ) -> Result<HandleController, Error> {
        let stored = match explicit {
            Some(_) => None,
            None => self.stored_credential(host).await,
        };
        let credential = explicit.or(stored.as_ref());

        let mut handle = self.establish(host).await?;
        self.authenticate(&mut handle, host, credential).await?;
        info!(host = %host.identity_key(), "SSH transport ready");
        Ok(spawn_handle_owner_task(
            handle,
            host.identity_key().to_string(),
        ))
    }

    /// Stored credential to dial with when the caller named none: a single
    /// stored record for the identity is used automatically, several ask
    /// the directory to choose, and `None` falls back to the resolver's
    /// credential-less probe.
    async fn stored_credential(&self, host: &HostConfig) -> Option<Credential> {
        let mut stored = self.resolver.directory().credentials_for(host).await;
        match stored.len() {
            0 => None,
            1 => {
                let credential = stored.remove(0);
                debug!(
                    host = %host.identity_key(),
                    label = %credential.label,
                    "Using the single stored credential"
                );
                Some(credential)
            }
            _ => self.resolver.directory().choose(host, &stored).await,
        }
    }

    async fn establish(&self, host: &HostConfig) -> Result<client::Handle<ClientHandler>, Error> {
        let connect_timeout = self.config.connect_timeout();
        let addr_input = format!("{}:{}", host.address, host.port);

        info!("Connecting to SSH server at {}", addr_input);

        let addr = tokio::net::lookup_host(&addr_input)
            .await
            .map_err(|e| {
                Error::connection(
                    ConnectFailure::Dns,
                    format!("failed to resolve {}: {}", host.address, e),
                )
            })?
            .next()
            .ok_or_else(|| {
                Error::connection(
                    ConnectFailure::Dns,
                    format!("no addresses found for {}", host.address),
                )
            })?;

        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::connection_io(&e)),
            Err(_) => {
                return Err(Error::connection(
                    ConnectFailure::Timeout,
                    format!("connect to {} timed out", addr_input),
                ))
            }
        };

        let ssh_config = client::Config {
            // Dead transports are detected by the keepalive counter and
            // on-demand pings, not by an inactivity teardown.
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive_interval(),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(host.address.clone(), host.port, self.verifier.clone());

        match timeout(
            connect_timeout,
            client::connect_stream(Arc::new(ssh_config), stream, handler),
        )
        .await
        {
            Ok(Ok(handle)) => {
                debug!("SSH handshake completed for {}", addr_input);
                Ok(handle)
            }
            Ok(Err(e)) => Err(classify_handshake_error(e)),
            Err(_) => Err(Error::connection(
                ConnectFailure::Timeout,
                format!("SSH handshake with {} timed out", addr_input),
            )),
        }
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        host: &HostConfig,
        explicit: Option<&Credential>,
    ) -> Result<(), Error> {
        let offers = self.resolver.resolve(host, explicit).await?;
        let mut tried = Vec::new();

        for offer in offers {
            let method = offer.method();
            debug!(host = %host.identity_key(), method, "Trying authentication offer");

            if self.try_offer(handle, host, offer).await? {
                info!(host = %host.identity_key(), method, "Authentication succeeded");
                return Ok(());
            }
            tried.push(method);
        }

        // A server-side credential rotation invalidates the whole stored
        // set for this identity, not just the secret that was tried.
        self.resolver.invalidate_host_secrets(host).await;
        Err(Error::Authentication(format!(
            "server rejected all offers ({})",
            tried.join(", ")
        )))
    }

    /// Apply one offer. `Ok(false)` is a rejection (try the next offer);
    /// `Err` is a transport failure that aborts the attempt.
    async fn try_offer(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        host: &HostConfig,
        offer: AuthOffer,
    ) -> Result<bool, Error> {
        match offer {
            AuthOffer::Key(key) => {
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key.key), None);
                let result = handle
                    .authenticate_publickey(&host.username, key_with_hash)
                    .await?;
                Ok(result.success())
            }

            AuthOffer::Agent => {
                let mut agent = match SshAgentClient::connect().await {
                    Ok(agent) => agent,
                    Err(e) => {
                        warn!("Agent offer skipped: {}", e);
                        return Ok(false);
                    }
                };
                match agent.authenticate(handle, &host.username).await {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        debug!("Agent authentication rejected: {}", e);
                        Ok(false)
                    }
                }
            }

            AuthOffer::Password(password) => {
                let result = handle
                    .authenticate_password(&host.username, &password)
                    .await?;
                Ok(result.success())
            }

            AuthOffer::Interactive => self.try_keyboard_interactive(handle, host).await,
        }
    }

    /// Keyboard-interactive rounds. Each server info request is forwarded
    /// to the prompt source; a decline or a stalled answer ends the method
    /// as a rejection rather than hanging the connect.
    async fn try_keyboard_interactive(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        host: &HostConfig,
    ) -> Result<bool, Error> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(&host.username, None::<String>)
            .await?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let prompt_list: Vec<InteractivePrompt> = prompts
                        .iter()
                        .map(|p| InteractivePrompt {
                            prompt: p.prompt.clone(),
                            echo: p.echo,
                        })
                        .collect();

                    let answers = match timeout(
                        KBI_PROMPT_TIMEOUT,
                        self.resolver
                            .prompt()
                            .interactive(host, &name, &instructions, &prompt_list),
                    )
                    .await
                    {
                        Ok(Some(answers)) => answers,
                        Ok(None) => {
                            debug!("Keyboard-interactive declined by prompt source");
                            return Ok(false);
                        }
                        Err(_) => {
                            warn!(
                                "Keyboard-interactive answer timed out after {:?}",
                                KBI_PROMPT_TIMEOUT
                            );
                            return Ok(false);
                        }
                    };

                    if answers.len() != prompt_list.len() {
                        return Err(Error::Authentication(format!(
                            "keyboard-interactive expected {} responses, got {}",
                            prompt_list.len(),
                            answers.len()
                        )));
                    }

                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }
}

/// Host verification keeps its own error kind so callers can tell a trust
/// decision from a network problem; everything else during the handshake
/// is a connection failure.
fn classify_handshake_error(err: Error) -> Error {
    match err {
        Error::HostVerification(_) => err,
        other => Error::connection(ConnectFailure::Handshake, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::resolver::{
        CredentialPrompt, MemoryCredentialDirectory, PromptedSecret,
    };
    use crate::auth::store::{MemorySecretStore, SecretCache};
    use crate::ssh::verify::{HostKeyDecider, HostKeyStore, MemoryHostKeyStore};
    use async_trait::async_trait;
    use russh::client::Handler;

    const SAMPLE_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    struct Decide(bool);

    #[async_trait]
    impl HostKeyDecider for Decide {
        async fn accept_unknown(&self, _h: &str, _p: u16, _f: &str) -> bool {
            self.0
        }
        async fn accept_changed(&self, _h: &str, _p: u16, _e: &str, _a: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_handler_accepts_trusted_key_and_persists() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let verifier = Arc::new(HostVerifier::new(store.clone(), Arc::new(Decide(true))));
        let mut handler = ClientHandler::new("example.com".into(), 22, verifier);

        let key = PublicKey::from_openssh(SAMPLE_KEY).unwrap();
        assert!(handler.check_server_key(&key).await.unwrap());
        assert!(store.digest("example.com").is_some());
    }

    #[tokio::test]
    async fn test_handler_rejection_is_host_verification_error() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let verifier = Arc::new(HostVerifier::new(store, Arc::new(Decide(false))));
        let mut handler = ClientHandler::new("example.com".into(), 22, verifier);

        let key = PublicKey::from_openssh(SAMPLE_KEY).unwrap();
        let err = handler.check_server_key(&key).await.unwrap_err();
        assert!(matches!(err, Error::HostVerification(_)));
    }

    #[test]
    fn test_handshake_classification_keeps_verification_kind() {
        let passthrough = classify_handshake_error(Error::HostVerification("changed".into()));
        assert!(matches!(passthrough, Error::HostVerification(_)));

        let wrapped = classify_handshake_error(Error::Protocol("kex failure".into()));
        match wrapped {
            Error::Connection { kind, .. } => assert_eq!(kind, ConnectFailure::Handshake),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    struct NoPrompt;

    #[async_trait]
    impl CredentialPrompt for NoPrompt {
        async fn password(&self, _host: &HostConfig) -> Option<PromptedSecret> {
            None
        }
        async fn passphrase(
            &self,
            _host: &HostConfig,
            _key: &std::path::Path,
        ) -> Option<PromptedSecret> {
            None
        }
        async fn interactive(
            &self,
            _host: &HostConfig,
            _name: &str,
            _instructions: &str,
            _prompts: &[InteractivePrompt],
        ) -> Option<Vec<String>> {
            None
        }
    }

    fn memory_connector(directory: Arc<MemoryCredentialDirectory>) -> SshConnector {
        let secrets = Arc::new(SecretCache::new(Arc::new(MemorySecretStore::new())));
        let resolver = Arc::new(AuthResolver::new(secrets, directory, Arc::new(NoPrompt)));
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let verifier = Arc::new(HostVerifier::new(store, Arc::new(Decide(false))));
        SshConnector::new(Arc::new(CoreConfig::default()), resolver, verifier)
    }

    #[tokio::test]
    async fn test_stored_credential_selection() {
        let directory = Arc::new(MemoryCredentialDirectory::new());
        let connector = memory_connector(directory.clone());
        let host = HostConfig::new("example.com", 22, "alice");

        // Nothing stored: fall through to the credential-less probe.
        assert!(connector.stored_credential(&host).await.is_none());

        directory.add(&host, Credential::password("main", "slot"));
        let chosen = connector.stored_credential(&host).await.unwrap();
        assert_eq!(chosen.label, "main");

        // Two records are ambiguous; the directory's choose picks nothing
        // here, so the probe path runs.
        directory.add(&host, Credential::password("backup", "slot-2"));
        assert!(connector.stored_credential(&host).await.is_none());
    }
}
