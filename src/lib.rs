//! Hostline - persistent multiplexed SSH session core
//!
//! The connection layer of a remote editing client: one authenticated
//! transport per host identity, multiplexing SFTP file access, remote
//! search, change watching and local port forwards, with automatic
//! reconnection when the network drops a transport the caller wanted
//! kept alive.
//!
//! Layering, bottom up: [`ssh`] owns raw transports behind a command
//! channel, [`session`] ties one transport to its sub-resources and a
//! lifecycle state machine, and [`session::SessionRegistry`] keys live
//! sessions by identity and runs the reconnect series. Everything above
//! observes the core through [`events::EventBus`] snapshots rather than
//! shared state.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod forwarding;
pub mod search;
pub mod session;
pub mod sftp;
pub mod ssh;
pub mod watch;

pub use config::{CoreConfig, Credential, CredentialKind, HostConfig, IdentityKey};
pub use error::{ConnectFailure, Error};
pub use events::{CancelToken, ChangeKind, CoreEvent, EventBus, SessionState};
pub use session::{Connector, Session, SessionRegistry};
pub use ssh::SshConnector;
