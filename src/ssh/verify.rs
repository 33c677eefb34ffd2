//! Host identity verification
//!
//! Confirms a presented host key against a persisted digest trust store
//! before the transport is considered trustworthy. Unknown hosts and
//! changed keys both require an explicit decision from the injected
//! [`HostKeyDecider`]; a changed key is the MITM-risk path and is never
//! auto-accepted. Runs inside the russh `check_server_key` callback, so
//! the handshake cannot complete until verification resolves.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Error;

/// Result of checking a host key against the trust store.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Digest matches the stored entry
    Verified,
    /// No stored digest for this host (first sight)
    Unknown { fingerprint: String },
    /// Stored digest differs (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Injected decision source for unknown and changed host keys.
#[async_trait]
pub trait HostKeyDecider: Send + Sync {
    /// First sight of this host. `true` trusts and persists the digest.
    async fn accept_unknown(&self, host: &str, port: u16, fingerprint: &str) -> bool;

    /// The stored digest differs from the presented key. Only an explicit
    /// `true` accepts the new key; anything else fails the connection.
    async fn accept_changed(&self, host: &str, port: u16, expected: &str, actual: &str) -> bool;
}

/// Injected digest trust store: `address:port` -> host key digest.
pub trait HostKeyStore: Send + Sync {
    fn digest(&self, key: &str) -> Option<String>;
    fn set_digest(&self, key: &str, digest: &str) -> Result<(), Error>;
    fn remove(&self, key: &str) -> Result<(), Error>;
}

/// In-memory trust store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryHostKeyStore {
    digests: RwLock<HashMap<String, String>>,
}

impl MemoryHostKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostKeyStore for MemoryHostKeyStore {
    fn digest(&self, key: &str) -> Option<String> {
        self.digests.read().get(key).cloned()
    }

    fn set_digest(&self, key: &str, digest: &str) -> Result<(), Error> {
        self.digests
            .write()
            .insert(key.to_string(), digest.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.digests.write().remove(key);
        Ok(())
    }
}

/// File-backed trust store: one JSON object mapping lookup key to digest.
pub struct FileHostKeyStore {
    digests: RwLock<HashMap<String, String>>,
    path: PathBuf,
}

impl FileHostKeyStore {
    /// Store at the default location (`~/.hostline/known_hosts.json`).
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".hostline").join("known_hosts.json"))
            .unwrap_or_else(|| PathBuf::from(".hostline-known-hosts.json"));
        Self::with_path(path)
    }

    /// Custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        let digests = match Self::load(&path) {
            Ok(digests) => digests,
            Err(e) => {
                debug!("Trust store not loaded from {:?}: {}", path, e);
                HashMap::new()
            }
        };

        info!("Loaded {} trusted host digests", digests.len());
        Self {
            digests: RwLock::new(digests),
            path,
        }
    }

    fn load(path: &PathBuf) -> Result<HashMap<String, String>, Error> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Protocol(format!("malformed trust store: {}", e)))
    }

    fn save(&self) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = {
            let digests = self.digests.read();
            serde_json::to_string_pretty(&*digests)
                .map_err(|e| Error::Protocol(format!("trust store encode: {}", e)))?
        };
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl Default for FileHostKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKeyStore for FileHostKeyStore {
    fn digest(&self, key: &str) -> Option<String> {
        self.digests.read().get(key).cloned()
    }

    fn set_digest(&self, key: &str, digest: &str) -> Result<(), Error> {
        self.digests
            .write()
            .insert(key.to_string(), digest.to_string());
        self.save()
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.digests.write().remove(key);
        self.save()
    }
}

/// Stateless verification logic over an injected store and decider.
pub struct HostVerifier {
    store: Arc<dyn HostKeyStore>,
    decider: Arc<dyn HostKeyDecider>,
}

impl HostVerifier {
    pub fn new(store: Arc<dyn HostKeyStore>, decider: Arc<dyn HostKeyDecider>) -> Self {
        Self { store, decider }
    }

    /// SHA256 fingerprint in the OpenSSH display format (unpadded base64).
    pub fn fingerprint(key: &PublicKey) -> String {
        let key_bytes = key.public_key_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Trust store lookup key: bare lowercase host for port 22,
    /// `[host]:port` otherwise.
    pub fn trust_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compare the presented key against the stored digest.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup = Self::trust_key(host, port);
        let fingerprint = Self::fingerprint(key);

        match self.store.digest(&lookup) {
            None => {
                debug!("Unknown host: {}", lookup);
                HostKeyVerification::Unknown { fingerprint }
            }
            Some(stored) if stored == fingerprint => {
                debug!("Host key verified for {}", lookup);
                HostKeyVerification::Verified
            }
            Some(stored) => {
                warn!(
                    "HOST KEY CHANGED for {}! Expected {}, got {}",
                    lookup, stored, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint: stored,
                    actual_fingerprint: fingerprint,
                }
            }
        }
    }

    /// Full verification flow. `Ok(true)` allows the handshake to proceed;
    /// every rejection is `Error::HostVerification` so callers can
    /// distinguish it from network failures.
    pub async fn verify(&self, host: &str, port: u16, key: &PublicKey) -> Result<bool, Error> {
        let lookup = Self::trust_key(host, port);

        match self.check(host, port, key) {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                if self
                    .decider
                    .accept_unknown(host, port, &fingerprint)
                    .await
                {
                    self.store.set_digest(&lookup, &fingerprint)?;
                    info!("Trusted new host {} ({})", lookup, fingerprint);
                    Ok(true)
                } else {
                    Err(Error::HostVerification(format!(
                        "unknown host {} rejected ({})",
                        lookup, fingerprint
                    )))
                }
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                if self
                    .decider
                    .accept_changed(host, port, &expected_fingerprint, &actual_fingerprint)
                    .await
                {
                    self.store.set_digest(&lookup, &actual_fingerprint)?;
                    warn!(
                        "Accepted changed host key for {} ({} -> {})",
                        lookup, expected_fingerprint, actual_fingerprint
                    );
                    Ok(true)
                } else {
                    Err(Error::HostVerification(format!(
                        "host key for {} changed (expected {}, got {})",
                        lookup, expected_fingerprint, actual_fingerprint
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // GitHub's published ed25519 host key and its documented fingerprint.
    const SAMPLE_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const SAMPLE_FINGERPRINT: &str = "SHA256:+DiY3wvvV6TuJJhbpZisF/zLDA0zPMSvHdkr4UvCOqU";

    fn sample_key() -> PublicKey {
        PublicKey::from_openssh(SAMPLE_KEY).unwrap()
    }

    struct FixedDecider {
        unknown: bool,
        changed: bool,
    }

    #[async_trait]
    impl HostKeyDecider for FixedDecider {
        async fn accept_unknown(&self, _h: &str, _p: u16, _f: &str) -> bool {
            self.unknown
        }
        async fn accept_changed(&self, _h: &str, _p: u16, _e: &str, _a: &str) -> bool {
            self.changed
        }
    }

    fn verifier(store: Arc<dyn HostKeyStore>, unknown: bool, changed: bool) -> HostVerifier {
        HostVerifier::new(store, Arc::new(FixedDecider { unknown, changed }))
    }

    #[test]
    fn test_trust_key_normalization() {
        assert_eq!(HostVerifier::trust_key("GitHub.com", 22), "github.com");
        assert_eq!(
            HostVerifier::trust_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_fingerprint_matches_published_value() {
        assert_eq!(HostVerifier::fingerprint(&sample_key()), SAMPLE_FINGERPRINT);
    }

    #[tokio::test]
    async fn test_unknown_host_accept_persists_digest() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let v = verifier(store.clone(), true, false);

        assert!(v.verify("example.com", 22, &sample_key()).await.unwrap());
        assert_eq!(
            store.digest("example.com").as_deref(),
            Some(SAMPLE_FINGERPRINT)
        );

        // Second sight verifies silently even with a refusing decider.
        let v = verifier(store.clone(), false, false);
        assert!(v.verify("example.com", 22, &sample_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_host_reject_fails_with_verification_error() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let v = verifier(store.clone(), false, false);

        let err = v.verify("example.com", 22, &sample_key()).await.unwrap_err();
        assert!(matches!(err, Error::HostVerification(_)));
        assert!(store.digest("example.com").is_none());
    }

    #[tokio::test]
    async fn test_changed_key_blocks_until_explicit_accept() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        store.set_digest("example.com", "SHA256:previously-stored").unwrap();

        // Reject: connection fails, old digest stays, host remains blocked.
        let v = verifier(store.clone(), true, false);
        let err = v.verify("example.com", 22, &sample_key()).await.unwrap_err();
        assert!(matches!(err, Error::HostVerification(_)));
        assert_eq!(
            store.digest("example.com").as_deref(),
            Some("SHA256:previously-stored")
        );

        // Explicit accept: new digest persisted, connection allowed.
        let v = verifier(store.clone(), false, true);
        assert!(v.verify("example.com", 22, &sample_key()).await.unwrap());
        assert_eq!(
            store.digest("example.com").as_deref(),
            Some(SAMPLE_FINGERPRINT)
        );
    }

    #[tokio::test]
    async fn test_non_default_port_uses_bracketed_key() {
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let v = verifier(store.clone(), true, false);

        v.verify("example.com", 2222, &sample_key()).await.unwrap();
        assert!(store.digest("[example.com]:2222").is_some());
        assert!(store.digest("example.com").is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");

        {
            let store = FileHostKeyStore::with_path(path.clone());
            store.set_digest("example.com", "SHA256:abc").unwrap();
        }

        let reloaded = FileHostKeyStore::with_path(path.clone());
        assert_eq!(reloaded.digest("example.com").as_deref(), Some("SHA256:abc"));

        reloaded.remove("example.com").unwrap();
        let again = FileHostKeyStore::with_path(path);
        assert!(again.digest("example.com").is_none());
    }
}
