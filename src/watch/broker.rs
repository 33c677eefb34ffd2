//! File change watching over long-lived exec channels
//!
//! One watcher process per watched path, multiplexed over the session
//! transport. Strategy selection comes from the cached capability probe;
//! hosts without a native watch tool report `false` from [`watch_file`]
//! and the caller falls back to its own polling.

use parking_lot::Mutex;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::parser::{parse_fswatch_line, parse_inotify_line, split_lines};
use crate::config::IdentityKey;
use crate::error::Error;
use crate::events::{CancelToken, ChangeKind, CoreEvent, EventBus};
use crate::search::shell_quote;
use crate::session::capability::{CapabilityCell, WatchStrategy};
use crate::ssh::HandleController;

/// How long a watch request waits for an unresolved capability probe
/// before falling back to polling.
const PROBE_WAIT: Duration = Duration::from_secs(2);

struct WatcherEntry {
    id: u64,
    cancel: CancelToken,
}

/// Per-session watcher registry.
pub struct ChangeWatchBroker {
    controller: HandleController,
    capabilities: Arc<CapabilityCell>,
    events: EventBus,
    identity: IdentityKey,
    watchers: Arc<Mutex<HashMap<String, WatcherEntry>>>,
    next_id: AtomicU64,
}

impl ChangeWatchBroker {
    pub fn new(
        controller: HandleController,
        capabilities: Arc<CapabilityCell>,
        events: EventBus,
        identity: IdentityKey,
    ) -> Self {
        Self {
            controller,
            capabilities,
            events,
            identity,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start watching a remote file. Returns `Ok(false)` when the host has
    /// no native watch tool, or when the capability probe is still
    /// unresolved after a bounded wait; watching an already-watched path
    /// is a no-op that reports success.
    pub async fn watch_file(&self, path: &str) -> Result<bool, Error> {
        let Some(caps) = self.capabilities.wait(PROBE_WAIT).await else {
            debug!(
                "Capability probe unresolved for {}, caller must poll",
                self.identity
            );
            return Ok(false);
        };
        let strategy = caps.watch;

        let Some(command) = build_watch_command(strategy, path) else {
            debug!(
                "No native watch tool for {} (os {:?}), caller must poll",
                self.identity, caps.os
            );
            return Ok(false);
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelToken::new();
        {
            let mut watchers = self.watchers.lock();
            if watchers.contains_key(path) {
                return Ok(true);
            }
            // Reserve the slot before the channel round-trip so a
            // concurrent watch of the same path does not double-spawn.
            watchers.insert(
                path.to_string(),
                WatcherEntry {
                    id,
                    cancel: cancel.clone(),
                },
            );
        }

        debug!("Starting watcher ({:?}): {}", strategy, command);
        let channel = match self.controller.open_session_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.remove_entry(path, id);
                return Err(e);
            }
        };
        if let Err(e) = channel.exec(true, command.as_str()).await {
            self.remove_entry(path, id);
            return Err(Error::Channel(format!("failed to start watcher: {}", e)));
        }

        let watchers = self.watchers.clone();
        let events = self.events.clone();
        let identity = self.identity.clone();
        let disconnect_rx = self.controller.subscribe_disconnect();
        let watch_path = path.to_string();
        tokio::spawn(async move {
            watch_loop(
                channel,
                strategy,
                watch_path,
                id,
                identity,
                events,
                cancel,
                disconnect_rx,
                watchers,
            )
            .await;
        });

        Ok(true)
    }

    /// Stop watching a path. Unknown paths are ignored.
    pub fn unwatch_file(&self, path: &str) {
        let entry = self.watchers.lock().remove(path);
        if let Some(entry) = entry {
            debug!("Stopping watcher for {}", path);
            entry.cancel.cancel();
        }
    }

    /// Stop every watcher.
    pub fn unwatch_all(&self) {
        let entries: Vec<(String, WatcherEntry)> = self.watchers.lock().drain().collect();
        for (path, entry) in entries {
            debug!("Stopping watcher for {}", path);
            entry.cancel.cancel();
        }
    }

    pub fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.watchers.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn remove_entry(&self, path: &str, id: u64) {
        let mut watchers = self.watchers.lock();
        if watchers.get(path).map(|e| e.id) == Some(id) {
            watchers.remove(path);
        }
    }
}

/// Build the monitor invocation for a strategy; `None` for hosts where
/// only polling is possible.
fn build_watch_command(strategy: WatchStrategy, path: &str) -> Option<String> {
    match strategy {
        WatchStrategy::Inotify => Some(format!(
            "inotifywait -m -q --format '%e %w%f' \
             -e modify -e attrib -e close_write -e move -e create -e delete -e delete_self {}",
            shell_quote(path)
        )),
        WatchStrategy::Fswatch => Some(format!("fswatch -x {}", shell_quote(path))),
        WatchStrategy::Poll => None,
    }
}

/// Read watcher output until cancelled, disconnected, or the remote
/// process dies. Removes its own registry entry on the way out (unless a
/// newer watcher already took the slot).
#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    mut channel: Channel<Msg>,
    strategy: WatchStrategy,
    path: String,
    id: u64,
    identity: IdentityKey,
    events: EventBus,
    cancel: CancelToken,
    mut disconnect_rx: broadcast::Receiver<()>,
    watchers: Arc<Mutex<HashMap<String, WatcherEntry>>>,
) {
    debug!("Watcher started for {}", path);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = channel.signal(Sig::KILL).await;
                let _ = channel.close().await;
                break;
            }
            _ = disconnect_rx.recv() => {
                debug!("Transport closed, watcher for {} exiting", path);
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    for event in frame_events(&mut pending, &data, strategy, &identity, &path) {
                        events.emit(event);
                    }
                }
                Some(ChannelMsg::ExtendedData { .. }) => {}
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    if exit_status != 0 {
                        warn!("Watcher process for {} exited with {}", path, exit_status);
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    {
        let mut map = watchers.lock();
        if map.get(&path).map(|e| e.id) == Some(id) {
            map.remove(&path);
        }
    }
    debug!("Watcher stopped for {}", path);
}

/// Change events for one stdout frame: buffer the chunk, take the complete
/// lines and map each recognized change to an event. Events always carry
/// the watched path, not the path the tool happened to report (a rename
/// target, say).
fn frame_events(
    pending: &mut Vec<u8>,
    data: &[u8],
    strategy: WatchStrategy,
    identity: &IdentityKey,
    path: &str,
) -> Vec<CoreEvent> {
    pending.extend_from_slice(data);
    split_lines(pending)
        .into_iter()
        .filter_map(|line| change_kind(strategy, &line))
        .map(|kind| CoreEvent::FileChange {
            key: identity.clone(),
            path: path.to_string(),
            kind,
        })
        .collect()
}

fn change_kind(strategy: WatchStrategy, line: &str) -> Option<ChangeKind> {
    match strategy {
        WatchStrategy::Inotify => parse_inotify_line(line).map(|(_, kind)| kind),
        WatchStrategy::Fswatch => parse_fswatch_line(line).map(|(_, kind)| kind),
        WatchStrategy::Poll => None,
    }
}
