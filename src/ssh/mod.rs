//! SSH transport layer
//!
//! Everything between a [`crate::config::HostConfig`] and a live,
//! host-verified, authenticated transport owned by its handle owner task.
//!
//! # Features
//! - Transport establishment with classified connection failures
//! - Host identity verification against a digest trust store
//! - Ordered authentication offers (key, agent, password, interactive)
//! - Single-owner handle access via command channel

pub mod agent;
mod client;
mod handle_owner;
pub mod verify;

pub use agent::{agent_available, SshAgentClient};
pub use client::{ClientHandler, SshConnector};
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, PingResult,
};
pub use verify::{
    FileHostKeyStore, HostKeyDecider, HostKeyStore, HostKeyVerification, HostVerifier,
    MemoryHostKeyStore,
};
