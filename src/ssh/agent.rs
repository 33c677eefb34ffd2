//! SSH agent authentication
//!
//! Delegates challenge signing to the system agent via russh's
//! [`AgentClient`]. On Unix the agent is reached through `SSH_AUTH_SOCK`;
//! on Windows through the OpenSSH named pipe.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use crate::error::Error;

/// Send-safe wrapper around [`AgentClient`] implementing [`Signer`].
///
/// russh's built-in `impl Signer for AgentClient` returns its future via
/// RPITIT, and inside `authenticate_publickey_with` that future borrows a
/// local `PublicKey` across an `.await`. The compiler cannot prove `Send`
/// for that borrow (rust-lang/rust#100013), which poisons every caller
/// that must be `Send`. Cloning the key to an owned value before the async
/// block sidesteps the borrow entirely; the clone is a few dozen bytes.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connection to the system SSH agent with a type-erased stream.
pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the system agent.
    pub async fn connect() -> Result<Self, Error> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                Error::Agent(format!(
                    "Failed to connect to SSH agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            debug!("Connected to SSH agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    Error::Agent(format!(
                        "Failed to connect to SSH agent via named pipe: {}. \
                         Make sure the OpenSSH Authentication Agent service is running.",
                        e
                    ))
                })?;
            debug!("Connected to SSH agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(Error::Agent(
                "SSH agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Try every agent-held key against the server until one is accepted.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<crate::ssh::ClientHandler>,
        username: &str,
    ) -> Result<(), Error> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| Error::Agent(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            return Err(Error::Agent(
                "SSH agent has no keys loaded. Add keys with: ssh-add".to_string(),
            ));
        }

        info!("SSH agent reports {} key(s)", keys.len());

        let mut last_error: Option<String> = None;
        for key in &keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("Agent authentication succeeded with key: {}", key.comment());
                    return Ok(());
                }
                Ok(_failure) => {
                    debug!("Key rejected by server: {}", key.comment());
                }
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(Error::Agent(format!(
            "No agent key was accepted by the server (tried {} key(s)){}",
            keys.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

/// Quick availability pre-check; an actual connection may still fail.
pub fn agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        // The named pipe exists whenever the service is installed; real
        // availability is only known at connect time.
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
