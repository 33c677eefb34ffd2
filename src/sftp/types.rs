//! SFTP data types and remote path helpers

use russh_sftp::protocol::FileAttributes;
use serde::{Deserialize, Serialize};

/// File entry information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full remote path
    pub path: String,
    /// File type
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: i64,
    /// File permissions (octal string, e.g., "755")
    pub permissions: String,
    /// Owner uid (if available)
    pub owner: Option<String>,
    /// Group gid (if available)
    pub group: Option<String>,
    /// Is symbolic link
    pub is_symlink: bool,
    /// Symlink target (if is_symlink)
    pub symlink_target: Option<String>,
}

impl FileInfo {
    /// Build from SFTP attributes; the symlink target is filled in by the
    /// caller when it wants one.
    pub fn from_attributes(name: String, path: String, metadata: &FileAttributes) -> Self {
        let file_type = if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_symlink() {
            FileType::Symlink
        } else if metadata.is_regular() {
            FileType::File
        } else {
            FileType::Unknown
        };

        let permissions = metadata
            .permissions
            .map(|p| format!("{:o}", p & 0o777))
            .unwrap_or_else(|| "000".to_string());

        Self {
            name,
            path,
            file_type,
            size: metadata.size.unwrap_or(0),
            modified: metadata.mtime.map(|t| t as i64).unwrap_or(0),
            permissions,
            owner: metadata.uid.map(|u: u32| u.to_string()),
            group: metadata.gid.map(|g: u32| g.to_string()),
            is_symlink: file_type == FileType::Symlink,
            symlink_target: None,
        }
    }
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Progress report for a chunked read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadProgress {
    /// Remote file path
    pub path: String,
    /// Total bytes expected (0 when the size is unknown)
    pub total_bytes: u64,
    /// Bytes read so far
    pub read_bytes: u64,
}

impl ReadProgress {
    /// Progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.read_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Check if a remote SFTP path is absolute.
///
/// Remote SFTP paths always use `/` as separator (per SFTP protocol).
/// Even Windows SSH servers present paths in Unix style.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Constants for SFTP operations
pub mod constants {
    use std::time::Duration;

    /// Read buffer size for chunked reads (64 KB)
    pub const READ_CHUNK_SIZE: usize = 64 * 1024;

    /// Ceiling for completing the flush-and-close of a write
    pub const WRITE_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
}
