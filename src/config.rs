//! Host, credential and core configuration types
//!
//! Secrets never live in these structs. A [`Credential`] only carries the
//! opaque keys under which its material is stored in the injected secret
//! store; the resolver fetches (or prompts for) the material at connect time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Immutable target descriptor for one remote host identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Remote host address
    pub address: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Optional explicit private key path to probe first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,

    /// Display name for presentation layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl HostConfig {
    pub fn new(address: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            username: username.into(),
            key_path: None,
            display_name: None,
        }
    }

    /// Stable identity key deduplicating sessions: `address:port:username`.
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.address, self.port, &self.username)
    }

    /// Name shown in logs and events.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}

/// `address:port:username`, the key under which sessions are deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(address: &str, port: u16, username: &str) -> Self {
        IdentityKey(format!("{}:{}:{}", address, port, username))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored credential record for a host. Many may exist per host, each
/// independently labeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// User-facing label ("work key", "root password", ...)
    pub label: String,

    pub kind: CredentialKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialKind {
    /// Password authentication; the password lives in the secret store.
    Password {
        /// Opaque secret-store key for the password
        secret_key: String,
    },

    /// Private key authentication
    PrivateKey {
        /// Path to the private key file
        key_path: String,
        /// Opaque secret-store key for the passphrase, when the key is encrypted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase_key: Option<String>,
    },
}

impl Credential {
    pub fn password(label: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: CredentialKind::Password {
                secret_key: secret_key.into(),
            },
        }
    }

    pub fn private_key(
        label: impl Into<String>,
        key_path: impl Into<String>,
        passphrase_key: Option<String>,
    ) -> Self {
        Self {
            label: label.into(),
            kind: CredentialKind::PrivateKey {
                key_path: key_path.into(),
                passphrase_key,
            },
        }
    }

    /// Secret-store keys owned by this credential.
    pub fn secret_keys(&self) -> Vec<&str> {
        match &self.kind {
            CredentialKind::Password { secret_key } => vec![secret_key.as_str()],
            CredentialKind::PrivateKey { passphrase_key, .. } => {
                passphrase_key.iter().map(|k| k.as_str()).collect()
            }
        }
    }
}

/// Flat configuration consumed by the core. Supplied externally; the core
/// has no file-based config of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Keepalive interval in milliseconds (0 disables keepalive)
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Fixed delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Reconnect attempt ceiling; 0 means retry indefinitely
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// Starting directory for file operations (defaults to the login cwd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_path: Option<String>,

    /// Search result cap; 0 means unlimited
    #[serde(default = "default_search_result_cap")]
    pub search_result_cap: usize,

    /// How many unique matched paths get metadata enrichment per search
    #[serde(default = "default_search_max_stat_count")]
    pub search_max_stat_count: usize,
}

impl CoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        if self.keepalive_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.keepalive_interval_ms))
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_interval_ms() -> u64 {
    3_000
}

fn default_search_result_cap() -> usize {
    1_000
}

fn default_search_max_stat_count() -> usize {
    100
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: 0,
            default_remote_path: None,
            search_result_cap: default_search_result_cap(),
            search_max_stat_count: default_search_max_stat_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_format() {
        let config = HostConfig::new("example.com", 22, "alice");
        assert_eq!(config.identity_key().as_str(), "example.com:22:alice");

        let config = HostConfig::new("10.0.0.5", 2222, "deploy");
        assert_eq!(config.identity_key().as_str(), "10.0.0.5:2222:deploy");
    }

    #[test]
    fn test_core_config_defaults_from_empty_json() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.connect_timeout_ms, 15_000);
        assert_eq!(config.reconnect_interval_ms, 3_000);
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.search_result_cap, 1_000);
        assert_eq!(config.search_max_stat_count, 100);
        assert!(config.default_remote_path.is_none());
    }

    #[test]
    fn test_core_config_uses_camel_case_keys() {
        let config: CoreConfig = serde_json::from_str(
            r#"{"connectTimeoutMs": 5000, "defaultRemotePath": "/srv/app"}"#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.default_remote_path.as_deref(), Some("/srv/app"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"keepaliveIntervalMs\""));
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let config = CoreConfig {
            keepalive_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.keepalive_interval().is_none());
    }

    #[test]
    fn test_credential_secret_keys() {
        let pw = Credential::password("root password", "example.com:22:root/pw");
        assert_eq!(pw.secret_keys(), vec!["example.com:22:root/pw"]);

        let key = Credential::private_key("work key", "~/.ssh/id_ed25519", None);
        assert!(key.secret_keys().is_empty());
    }
}
