//! Crate-wide error types
//!
//! Connection-establishment failures carry a [`ConnectFailure`] class so
//! callers can offer a targeted remediation hint instead of a raw transport
//! string. The registry only ever auto-recovers from `Connection`; both
//! `Authentication` and `HostVerification` end a reconnect series.

use thiserror::Error;

/// Classification of connection-establishment failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    /// The connect or handshake did not finish within the configured timeout.
    Timeout,
    /// The remote host actively refused the TCP connection.
    Refused,
    /// Hostname resolution failed or returned no addresses.
    Dns,
    /// No route to host / network unreachable.
    Unreachable,
    /// The TCP connection worked but the SSH handshake failed.
    Handshake,
    /// Any other transport-level IO failure.
    Io,
}

impl ConnectFailure {
    /// Map an IO error to a failure class.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ConnectFailure::Timeout,
            ErrorKind::ConnectionRefused => ConnectFailure::Refused,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                ConnectFailure::Unreachable
            }
            ErrorKind::NotFound => ConnectFailure::Dns,
            _ => ConnectFailure::Io,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection failed: {message}")]
    Connection {
        kind: ConnectFailure,
        message: String,
    },

    #[error("Host verification failed: {0}")]
    HostVerification(String),

    #[error("Transfer failed for '{path}': {message}")]
    Transfer { path: String, message: String },

    #[error("Remote command failed (exit {exit_code:?}): {stderr}")]
    Exec {
        command: String,
        exit_code: Option<u32>,
        stderr: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("SSH agent error: {0}")]
    Agent(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Timeout: {what}")]
    Timeout { what: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl Error {
    /// Connection error with an explicit failure class.
    pub fn connection(kind: ConnectFailure, message: impl Into<String>) -> Self {
        Error::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Connection error classified from an IO error.
    pub fn connection_io(err: &std::io::Error) -> Self {
        Error::Connection {
            kind: ConnectFailure::from_io(err),
            message: err.to_string(),
        }
    }

    /// Whether the registry may retry this failure automatically.
    ///
    /// Authentication and host-verification failures require caller action
    /// (new credential, explicit trust decision) and must end the series.
    pub fn is_reconnectable(&self) -> bool {
        !matches!(
            self,
            Error::Authentication(_) | Error::HostVerification(_) | Error::Cancelled
        )
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => Error::Disconnected,
            russh::Error::NotAuthenticated => {
                Error::Authentication("not authenticated".to_string())
            }
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Key(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for Error {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        Error::Channel(format!("SFTP: {}", err))
    }
}
