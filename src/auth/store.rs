//! Secret storage
//!
//! [`SecretStore`] is the injected abstraction for persisted secrets
//! (get/store/delete by opaque key). The core never writes secrets to
//! plain files; the shipped persistent backend is the OS keychain.
//! [`SecretCache`] layers a session-only in-memory overlay on top of a
//! persistent store, so freshly prompted secrets the user declined to
//! persist still work for the rest of the process lifetime.

use async_trait::async_trait;
use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.hostline.secrets";

/// Secret store errors
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}

impl From<SecretError> for crate::error::Error {
    fn from(err: SecretError) -> Self {
        crate::error::Error::Authentication(format!("secret store: {}", err))
    }
}

/// Injected secret store abstraction.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret; `None` when no entry exists.
    async fn get(&self, key: &str) -> Result<Option<String>, SecretError>;

    /// Store or overwrite a secret.
    async fn store(&self, key: &str, secret: &str) -> Result<(), SecretError>;

    /// Delete a secret; deleting a missing entry is not an error.
    async fn delete(&self, key: &str) -> Result<(), SecretError>;
}

/// OS-keychain-backed store. Keyring calls are blocking, so every
/// operation runs on the blocking pool.
pub struct KeychainSecretStore {
    service: String,
}

impl KeychainSecretStore {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Stable keychain account for a key on this machine.
    fn account(key: &str) -> String {
        format!("{}@{}", whoami::username(), key)
    }
}

impl Default for KeychainSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for KeychainSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        let service = self.service.clone();
        let account = Self::account(key);

        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &account)?;
            match entry.get_password() {
                Ok(secret) => Ok(Some(secret)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(SecretError::Keyring(e)),
            }
        })
        .await
        .map_err(|e| SecretError::Task(e.to_string()))?
    }

    async fn store(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        let service = self.service.clone();
        let account = Self::account(key);
        let secret = secret.to_string();

        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &account)?;
            entry.set_password(&secret)?;
            // Read back to confirm the platform store actually kept it.
            let read_back = entry.get_password()?;
            if read_back != secret {
                return Err(SecretError::Keyring(keyring::Error::NoEntry));
            }
            Ok(())
        })
        .await
        .map_err(|e| SecretError::Task(e.to_string()))?
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        let service = self.service.clone();
        let account = Self::account(key);

        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &account)?;
            match entry.delete_credential() {
                Ok(()) => Ok(()),
                Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(SecretError::Keyring(e)),
            }
        })
        .await
        .map_err(|e| SecretError::Task(e.to_string()))?
    }
}

/// Process-local store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn store(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        self.entries
            .write()
            .insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Session-only overlay over a persistent [`SecretStore`].
///
/// Reads hit the overlay first. Secrets the user chose not to persist are
/// remembered here until process exit. Invalidation clears both layers so
/// a stale secret cannot resurface from either side.
pub struct SecretCache {
    overlay: RwLock<HashMap<String, String>>,
    store: Arc<dyn SecretStore>,
}

impl SecretCache {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            overlay: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, SecretError> {
        if let Some(secret) = self.overlay.read().get(key).cloned() {
            return Ok(Some(secret));
        }
        self.store.get(key).await
    }

    /// Remember a secret for this process only.
    pub fn store_session_only(&self, key: &str, secret: &str) {
        self.overlay
            .write()
            .insert(key.to_string(), secret.to_string());
    }

    /// Persist a secret and drop any overlay shadow of it.
    pub async fn persist(&self, key: &str, secret: &str) -> Result<(), SecretError> {
        self.store.store(key, secret).await?;
        self.overlay.write().remove(key);
        Ok(())
    }

    /// Remove the given keys from both layers. Per-key persistent-store
    /// failures are logged and do not abort the sweep.
    pub async fn invalidate(&self, keys: &[&str]) {
        {
            let mut overlay = self.overlay.write();
            for key in keys {
                overlay.remove(*key);
            }
        }
        for key in keys {
            if let Err(e) = self.store.delete(key).await {
                warn!("Failed to delete stored secret '{}': {}", key, e);
            } else {
                debug!("Invalidated stored secret '{}'", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.store("a", "secret").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("secret"));

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        // Deleting again is fine.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_overlay_shadows_store() {
        let backing = Arc::new(MemorySecretStore::new());
        backing.store("k", "persisted").await.unwrap();

        let cache = SecretCache::new(backing.clone());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("persisted"));

        cache.store_session_only("k", "fresh");
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("fresh"));
        // The persistent layer is untouched.
        assert_eq!(backing.get("k").await.unwrap().as_deref(), Some("persisted"));
    }

    #[tokio::test]
    async fn test_cache_persist_clears_overlay() {
        let backing = Arc::new(MemorySecretStore::new());
        let cache = SecretCache::new(backing.clone());

        cache.store_session_only("k", "v1");
        cache.persist("k", "v2").await.unwrap();

        assert_eq!(backing.get("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_invalidate_clears_both_layers() {
        let backing = Arc::new(MemorySecretStore::new());
        backing.store("pw", "stored").await.unwrap();

        let cache = SecretCache::new(backing.clone());
        cache.store_session_only("pw", "session");
        cache.store_session_only("other", "kept");

        cache.invalidate(&["pw"]).await;

        assert!(cache.get("pw").await.unwrap().is_none());
        assert!(backing.get("pw").await.unwrap().is_none());
        assert_eq!(cache.get("other").await.unwrap().as_deref(), Some("kept"));
    }

    // Interacts with the real system keychain; run manually:
    // cargo test keychain -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_keychain_store_roundtrip() {
        let store = KeychainSecretStore::with_service("com.hostline.test");

        store.store("test-key", "test-secret").await.unwrap();
        assert_eq!(
            store.get("test-key").await.unwrap().as_deref(),
            Some("test-secret")
        );

        store.delete("test-key").await.unwrap();
        assert!(store.get("test-key").await.unwrap().is_none());
    }
}
