//! Remote file access over SFTP
//!
//! One lazily opened subsystem channel per session carries directory
//! listing, reads, and durably acknowledged writes.

pub mod channel;
pub mod types;

pub use channel::SftpChannel;
pub use types::{FileInfo, FileType, ReadProgress};
