//! Authentication: key discovery, secret storage, offer resolution

pub mod keys;
pub mod resolver;
pub mod store;

pub use keys::{candidate_key_paths, default_key_paths, KeyError, LoadedKey};
pub use resolver::{
    default_password_secret_key, AuthOffer, AuthResolver, CredentialDirectory, CredentialPrompt,
    InteractivePrompt, MemoryCredentialDirectory, PromptedSecret,
};
pub use store::{
    KeychainSecretStore, MemorySecretStore, SecretCache, SecretError, SecretStore,
};
