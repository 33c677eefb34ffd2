//! Caller-facing events and cancellation primitives
//!
//! Presentation layers observe the core exclusively through [`CoreEvent`]s
//! on a broadcast bus; the core never calls back into presentation code.
//! Every event is emitted at most once per transition, by the component
//! that owns the transition.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::config::IdentityKey;

/// Default broadcast capacity. Slow subscribers that fall further behind
/// than this lose oldest events (broadcast lag semantics).
const EVENT_BUS_CAPACITY: usize = 256;

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Error { message: String },
}

impl SessionState {
    pub fn error(message: impl Into<String>) -> Self {
        SessionState::Error {
            message: message.into(),
        }
    }
}

/// Normalized file-change kind produced by the watch broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Modify,
    Delete,
    Create,
}

/// Events emitted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A session's state changed.
    ConnectionStateChanged {
        key: IdentityKey,
        state: SessionState,
    },

    /// A reconnect series progressed. `attempt` 0 announces the series,
    /// N >= 1 numbers the retries; `is_reconnecting: false` marks the end
    /// of a series that did not succeed.
    Reconnecting {
        key: IdentityKey,
        host: String,
        attempt: u32,
        is_reconnecting: bool,
    },

    /// A reconnect series ended with a live session.
    Reconnected { key: IdentityKey },

    /// A watched remote file changed.
    FileChange {
        key: IdentityKey,
        path: String,
        kind: ChangeKind,
    },
}

/// Broadcast bus carrying [`CoreEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation handle shared between a caller and an in-flight
/// operation (search, chunked read). Signaling is sticky: once cancelled,
/// always cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Suspend until cancellation is signaled. Never resolves spuriously.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without a cancel; nothing can ever
                // signal this token, so park forever.
                futures_util::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
