//! Session Management Module
//!
//! One [`Session`] per host identity, held in a [`SessionRegistry`]:
//! - State machine for the connect/disconnect lifecycle
//! - Remote capability probing (OS family, search and watch tooling)
//! - Automatic reconnection with instance replacement
//! - Thread-safe session access via DashMap

pub mod capability;
mod registry;
mod session;

pub use capability::{CapabilityCell, OsFamily, RemoteCapabilities, WatchStrategy};
pub use registry::SessionRegistry;
pub use session::{Connector, Session};
