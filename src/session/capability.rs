//! Remote capability probe
//!
//! One-shot detection of the remote OS family and the available file-watch
//! tooling, run once per transport and cached in a [`CapabilityCell`].
//! Reconnects reset the cell because the answer can change (different
//! machine behind a load balancer, tool installed meanwhile).
//!
//! Consumers that race the probe wait a bounded ~2s and fall back to the
//! poll strategy rather than blocking a watch request on a slow probe.

use russh::ChannelMsg;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;
use crate::ssh::HandleController;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_WAIT_LIMIT: Duration = Duration::from_secs(2);
const MAX_PROBE_OUTPUT: usize = 4096;

/// Single exec that answers everything at once. Markers keep the parse
/// independent of locale and of tools writing to stdout on their own.
const PROBE_CMD: &str = "echo '===OS==='; uname -s 2>/dev/null || echo unknown; \
     echo '===INOTIFY==='; command -v inotifywait >/dev/null 2>&1 && echo yes || echo no; \
     echo '===FSWATCH==='; command -v fswatch >/dev/null 2>&1 && echo yes || echo no; \
     echo '===END==='";

/// Coarse OS family from `uname -s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Linux,
    Mac,
    Bsd,
    Windows,
    Unknown,
}

impl OsFamily {
    fn classify(uname: &str) -> Self {
        let s = uname.trim();
        let upper = s.to_uppercase();

        if upper.starts_with("MINGW") || upper.starts_with("MSYS") || upper.starts_with("CYGWIN") {
            return OsFamily::Windows;
        }

        match s {
            "Linux" => OsFamily::Linux,
            "Darwin" => OsFamily::Mac,
            "FreeBSD" | "OpenBSD" | "NetBSD" | "DragonFly" => OsFamily::Bsd,
            _ => OsFamily::Unknown,
        }
    }
}

/// How file change watching will be implemented on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStrategy {
    /// `inotifywait -m` (Linux, inotify-tools installed)
    Inotify,
    /// `fswatch -x` (macOS and BSDs, fswatch installed)
    Fswatch,
    /// Periodic `stat` polling, always available
    Poll,
}

/// Probe result, cached per transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCapabilities {
    pub os: OsFamily,
    /// Raw `uname -s` output for logs
    pub uname: String,
    pub watch: WatchStrategy,
    /// Probe timestamp (Unix seconds)
    pub probed_at: i64,
}

impl RemoteCapabilities {
    /// Result used when the probe fails or times out: nothing is assumed
    /// beyond what always works.
    pub fn fallback() -> Self {
        Self {
            os: OsFamily::Unknown,
            uname: String::new(),
            watch: WatchStrategy::Poll,
            probed_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Parse the marker-delimited probe output. Total garbage degrades to the
/// fallback shape instead of erroring.
fn parse_probe_output(output: &str) -> RemoteCapabilities {
    let uname = extract_section(output, "===OS===", "===INOTIFY===")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let inotify = extract_section(output, "===INOTIFY===", "===FSWATCH===")
        .map(|s| s.trim() == "yes")
        .unwrap_or(false);

    let fswatch = extract_section(output, "===FSWATCH===", "===END===")
        .map(|s| s.trim() == "yes")
        .unwrap_or(false);

    let os = OsFamily::classify(&uname);

    // Tool presence is gated on the OS family: inotify is only meaningful
    // on Linux, fswatch answers for Mac, the BSDs and hosts whose uname is
    // unhelpful. Anything else polls.
    let watch = match os {
        OsFamily::Linux if inotify => WatchStrategy::Inotify,
        OsFamily::Mac | OsFamily::Bsd | OsFamily::Unknown if fswatch => WatchStrategy::Fswatch,
        _ => WatchStrategy::Poll,
    };

    RemoteCapabilities {
        os,
        uname,
        watch,
        probed_at: chrono::Utc::now().timestamp(),
    }
}

fn extract_section(text: &str, start_marker: &str, end_marker: &str) -> Option<String> {
    let start = text.find(start_marker)?;
    let after_start = start + start_marker.len();
    let end = text[after_start..].find(end_marker)?;
    Some(text[after_start..after_start + end].to_string())
}

/// Run the probe over a temporary exec channel. Never errors outward; any
/// failure degrades to [`RemoteCapabilities::fallback`].
pub async fn probe_capabilities(controller: &HandleController) -> RemoteCapabilities {
    match timeout(PROBE_TIMEOUT, probe_inner(controller)).await {
        Ok(Ok(caps)) => {
            debug!(
                "Capability probe: uname='{}' watch={:?}",
                caps.uname, caps.watch
            );
            caps
        }
        Ok(Err(e)) => {
            warn!("Capability probe failed: {}", e);
            RemoteCapabilities::fallback()
        }
        Err(_) => {
            warn!("Capability probe timed out after {:?}", PROBE_TIMEOUT);
            RemoteCapabilities::fallback()
        }
    }
}

async fn probe_inner(controller: &HandleController) -> Result<RemoteCapabilities, Error> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, PROBE_CMD)
        .await
        .map_err(|e| Error::Channel(e.to_string()))?;

    let mut stdout = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                stdout.extend_from_slice(&data);
                if stdout.len() > MAX_PROBE_OUTPUT {
                    break;
                }
                if String::from_utf8_lossy(&stdout).contains("===END===") {
                    break;
                }
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    let _ = channel.close().await;

    Ok(parse_probe_output(&String::from_utf8_lossy(&stdout)))
}

/// Probe-once cell shared by everything on one transport.
#[derive(Default)]
pub struct CapabilityCell {
    state: parking_lot::Mutex<Option<RemoteCapabilities>>,
    probing: AtomicBool,
    ready: Notify,
}

impl CapabilityCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<RemoteCapabilities> {
        self.state.lock().clone()
    }

    pub fn set(&self, caps: RemoteCapabilities) {
        *self.state.lock() = Some(caps);
        self.ready.notify_waiters();
    }

    /// Forget the cached result. Called when the transport is replaced.
    pub fn reset(&self) {
        *self.state.lock() = None;
        self.probing.store(false, Ordering::SeqCst);
    }

    /// Cached result, or run the probe (first caller) or wait bounded for
    /// the in-flight probe (everyone else). Losers of the wait get the
    /// poll fallback without caching it.
    pub async fn get_or_probe(&self, controller: &HandleController) -> RemoteCapabilities {
        if let Some(caps) = self.get() {
            return caps;
        }

        if self
            .probing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let caps = probe_capabilities(controller).await;
            self.set(caps.clone());
            caps
        } else {
            match self.wait(PROBE_WAIT_LIMIT).await {
                Some(caps) => caps,
                None => RemoteCapabilities::fallback(),
            }
        }
    }

    /// Bounded wait for a result someone else is producing. `None` means
    /// the probe is still unresolved after `limit`.
    pub async fn wait(&self, limit: Duration) -> Option<RemoteCapabilities> {
        if let Some(caps) = self.get() {
            return Some(caps);
        }

        let notified = self.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // Re-check after registering so a set() between the first check and
        // enable() cannot be missed.
        if let Some(caps) = self.get() {
            return Some(caps);
        }

        match timeout(limit, notified).await {
            Ok(()) => self.get(),
            Err(_) => None,
        }
    }
}
