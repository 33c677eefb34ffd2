//! Lazy SFTP sub-channel
//!
//! One SFTP subsystem channel per session, opened on the first file
//! operation and reused for every subsequent one. A transport loss
//! invalidates the channel; [`SftpChannel::reset`] drops it so the next
//! operation reopens on the replacement transport.

use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{
    constants, is_absolute_remote_path, join_remote_path, FileInfo, FileType, ReadProgress,
};
use crate::error::Error;
use crate::events::CancelToken;
use crate::ssh::HandleController;

struct SftpState {
    sftp: SftpSession,
    /// Canonical base directory relative paths resolve against
    base: String,
}

/// Shared file-operation surface of one session.
pub struct SftpChannel {
    controller: HandleController,
    configured_base: Option<String>,
    state: Mutex<Option<Arc<SftpState>>>,
}

impl SftpChannel {
    pub fn new(controller: HandleController, configured_base: Option<String>) -> Self {
        Self {
            controller,
            configured_base,
            state: Mutex::new(None),
        }
    }

    /// Drop the sub-channel so the next operation reopens it.
    pub async fn reset(&self) {
        *self.state.lock().await = None;
    }

    /// Canonical base directory (opens the subsystem if needed).
    pub async fn base_dir(&self) -> Result<String, Error> {
        Ok(self.ensure().await?.base.clone())
    }

    async fn ensure(&self) -> Result<Arc<SftpState>, Error> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }

        debug!("Opening SFTP subsystem");
        let channel = self.controller.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Channel(format!("SFTP subsystem request failed: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        let base = match self.configured_base.as_deref() {
            Some(configured) => match sftp.canonicalize(configured).await {
                Ok(base) => base,
                Err(e) => {
                    warn!(
                        "Configured base directory '{}' unusable ({}), falling back to login cwd",
                        configured, e
                    );
                    sftp.canonicalize(".")
                        .await
                        .map_err(|e| map_sftp_error(e, "."))?
                }
            },
            None => sftp
                .canonicalize(".")
                .await
                .map_err(|e| map_sftp_error(e, "."))?,
        };

        info!("SFTP subsystem ready, base directory {}", base);
        let state = Arc::new(SftpState { sftp, base });
        *guard = Some(state.clone());
        Ok(state)
    }

    /// List directory contents, directories first, names case-insensitive.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>, Error> {
        let state = self.ensure().await?;
        let canonical = resolve_path(&state, path).await?;
        debug!("Listing directory: {}", canonical);

        let read_dir = state
            .sftp
            .read_dir(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }

            let full_path = join_remote_path(&canonical, &name);
            let mut info = FileInfo::from_attributes(name, full_path.clone(), &entry.metadata());
            if info.is_symlink {
                info.symlink_target = state.sftp.read_link(&full_path).await.ok();
            }
            entries.push(info);
        }

        entries.sort_by(|a, b| {
            let a_is_dir = a.file_type == FileType::Directory;
            let b_is_dir = b.file_type == FileType::Directory;
            if a_is_dir != b_is_dir {
                return b_is_dir.cmp(&a_is_dir);
            }
            a.name.to_lowercase().cmp(&b.name.to_lowercase())
        });

        debug!("Listed {} entries in {}", entries.len(), canonical);
        Ok(entries)
    }

    /// Get file information
    pub async fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        let state = self.ensure().await?;
        let canonical = resolve_path(&state, path).await?;

        let metadata = state
            .sftp
            .metadata(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        let name = canonical
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut info = FileInfo::from_attributes(name, canonical.clone(), &metadata);
        if info.is_symlink {
            info.symlink_target = state.sftp.read_link(&canonical).await.ok();
        }
        Ok(info)
    }

    /// Whether the path exists (any file type).
    pub async fn exists(&self, path: &str) -> Result<bool, Error> {
        let state = self.ensure().await?;
        let candidate = if is_absolute_remote_path(path) {
            path.to_string()
        } else {
            join_remote_path(&state.base, path)
        };
        Ok(state.sftp.metadata(&candidate).await.is_ok())
    }

    /// Read a whole file into memory.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        let state = self.ensure().await?;
        let canonical = resolve_path(&state, path).await?;
        debug!("Reading file: {}", canonical);

        let mut file = state
            .sftp
            .open(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| transfer_error(&canonical, "read", &e))?;

        debug!("Read {} bytes from {}", data.len(), canonical);
        Ok(data)
    }

    /// Read a file in chunks, reporting progress after each chunk.
    ///
    /// `chunk_size` of zero selects the default chunk size. Cancellation
    /// aborts the read and returns [`Error::Cancelled`]; no partial content
    /// escapes.
    pub async fn read_file_chunked(
        &self,
        path: &str,
        chunk_size: usize,
        progress: Option<mpsc::Sender<ReadProgress>>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, Error> {
        let state = self.ensure().await?;
        let canonical = resolve_path(&state, path).await?;

        let total_bytes = state
            .sftp
            .metadata(&canonical)
            .await
            .ok()
            .and_then(|m| m.size)
            .unwrap_or(0);

        debug!("Chunked read of {} ({} bytes)", canonical, total_bytes);

        let mut file = state
            .sftp
            .open(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        let chunk = if chunk_size == 0 {
            constants::READ_CHUNK_SIZE
        } else {
            chunk_size
        };
        let mut data = Vec::with_capacity(usize::try_from(total_bytes).unwrap_or(0));
        let mut buf = vec![0u8; chunk];

        loop {
            if cancel.is_cancelled() {
                debug!("Chunked read of {} cancelled", canonical);
                return Err(Error::Cancelled);
            }

            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Chunked read of {} cancelled mid-read", canonical);
                    return Err(Error::Cancelled);
                }
                result = file.read(&mut buf) => {
                    result.map_err(|e| transfer_error(&canonical, "read", &e))?
                }
            };

            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);

            if let Some(tx) = &progress {
                let _ = tx
                    .send(ReadProgress {
                        path: canonical.clone(),
                        total_bytes,
                        read_bytes: data.len() as u64,
                    })
                    .await;
            }
        }

        debug!("Chunked read of {} complete ({} bytes)", canonical, data.len());
        Ok(data)
    }

    /// Write a file, resolving only after the remote close is acknowledged.
    ///
    /// `shutdown` sends the SFTP close and waits for the server's response,
    /// so a resolved write means the server has the handle closed, not just
    /// that bytes left this process. The whole sequence is bounded so a
    /// wedged server cannot hang the caller indefinitely.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        let state = self.ensure().await?;
        // The target may not exist yet, so resolve without canonicalizing.
        let canonical = if is_absolute_remote_path(path) {
            path.to_string()
        } else {
            join_remote_path(&state.base, path)
        };
        debug!("Writing {} bytes to {}", content.len(), canonical);

        let write_close = async {
            let mut file = state
                .sftp
                .open_with_flags(
                    &canonical,
                    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
                )
                .await
                .map_err(|e| map_sftp_error(e, &canonical))?;

            file.write_all(content)
                .await
                .map_err(|e| transfer_error(&canonical, "write", &e))?;
            file.flush()
                .await
                .map_err(|e| transfer_error(&canonical, "flush", &e))?;
            file.shutdown()
                .await
                .map_err(|e| transfer_error(&canonical, "close", &e))?;
            Ok::<(), Error>(())
        };

        match timeout(constants::WRITE_CLOSE_TIMEOUT, write_close).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    what: format!(
                        "write of {} did not complete within {:?}",
                        canonical,
                        constants::WRITE_CLOSE_TIMEOUT
                    ),
                })
            }
        }

        info!("Wrote {} bytes to {}", content.len(), canonical);
        Ok(())
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &str) -> Result<(), Error> {
        let state = self.ensure().await?;
        let target = if is_absolute_remote_path(path) {
            path.to_string()
        } else {
            join_remote_path(&state.base, path)
        };
        info!("Creating directory: {}", target);

        state
            .sftp
            .create_dir(&target)
            .await
            .map_err(|e| map_sftp_error(e, &target))
    }

    /// Rename/move a file or directory.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), Error> {
        let state = self.ensure().await?;
        let old_canonical = resolve_path(&state, old_path).await?;
        let new_canonical = if is_absolute_remote_path(new_path) {
            new_path.to_string()
        } else {
            join_remote_path(&state.base, new_path)
        };
        info!("Renaming {} to {}", old_canonical, new_canonical);

        state
            .sftp
            .rename(&old_canonical, &new_canonical)
            .await
            .map_err(|e| map_sftp_error(e, &old_canonical))
    }

    /// Delete a file or empty directory.
    pub async fn remove(&self, path: &str) -> Result<(), Error> {
        let state = self.ensure().await?;
        let canonical = resolve_path(&state, path).await?;
        info!("Deleting: {}", canonical);

        let metadata = state
            .sftp
            .metadata(&canonical)
            .await
            .map_err(|e| map_sftp_error(e, &canonical))?;

        if metadata.is_dir() {
            state
                .sftp
                .remove_dir(&canonical)
                .await
                .map_err(|e| map_sftp_error(e, &canonical))
        } else {
            state
                .sftp
                .remove_file(&canonical)
                .await
                .map_err(|e| map_sftp_error(e, &canonical))
        }
    }
}

/// Resolve a user-supplied path to a canonical absolute one. Relative
/// paths resolve against the session base, `~` against the login home.
async fn resolve_path(state: &SftpState, path: &str) -> Result<String, Error> {
    if is_absolute_remote_path(path) {
        state
            .sftp
            .canonicalize(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    } else if path == "~" || path.starts_with("~/") {
        let home = state
            .sftp
            .canonicalize(".")
            .await
            .map_err(|e| map_sftp_error(e, path))?;
        if path == "~" {
            Ok(home)
        } else {
            Ok(join_remote_path(&home, &path[2..]))
        }
    } else {
        let full = join_remote_path(&state.base, path);
        state
            .sftp
            .canonicalize(&full)
            .await
            .map_err(|e| map_sftp_error(e, &full))
    }
}

fn map_sftp_error(err: SftpErrorInner, path: &str) -> Error {
    Error::Transfer {
        path: path.to_string(),
        message: err.to_string(),
    }
}

fn transfer_error(path: &str, stage: &str, err: &std::io::Error) -> Error {
    Error::Transfer {
        path: path.to_string(),
        message: format!("{} failed: {}", stage, err),
    }
}
