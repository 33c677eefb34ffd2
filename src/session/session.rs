//! One session per host identity
//!
//! A [`Session`] owns at most one live transport and every sub-resource
//! multiplexed over it: the lazy SFTP channel, change watchers, local port
//! forwards, the remote search engine and the capability probe cache. All
//! of them die with the transport; the owner task's close notification is
//! the single trigger that releases them, whether the transport was torn
//! down deliberately or dropped by the network.
//!
//! Reconnection never reuses a `Session` value. The registry builds a
//! fresh instance for each attempt, so a session's transport is set at
//! most once and `connect()` after a drop is a registry concern.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use russh::ChannelMsg;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CoreConfig, Credential, HostConfig, IdentityKey};
use crate::error::{ConnectFailure, Error};
use crate::events::{CancelToken, CoreEvent, EventBus, SessionState};
use crate::forwarding::{start_local_forward, ForwardStats, LocalForward, LocalForwardHandle};
use crate::search::{shell_quote, RemoteSearchEngine, SearchMatch, SearchRequest};
use crate::session::capability::{CapabilityCell, RemoteCapabilities};
use crate::sftp::{FileInfo, ReadProgress, SftpChannel};
use crate::ssh::{HandleController, PingResult, SshConnector};
use crate::watch::ChangeWatchBroker;

/// Ceiling on one exec invocation so a wedged server cannot hang callers.
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport factory seam. Production code passes an [`SshConnector`];
/// tests substitute scripted transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &HostConfig,
        explicit: Option<&Credential>,
    ) -> Result<HandleController, Error>;
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &HostConfig,
        explicit: Option<&Credential>,
    ) -> Result<HandleController, Error> {
        SshConnector::connect(self, host, explicit).await
    }
}

/// Everything that lives exactly as long as one transport.
struct TransportResources {
    controller: HandleController,
    sftp: Arc<SftpChannel>,
    engine: Arc<RemoteSearchEngine>,
    broker: Arc<ChangeWatchBroker>,
}

pub struct Session {
    host: HostConfig,
    identity: IdentityKey,
    /// Distinguishes rebuilt instances of the same identity in logs.
    instance: Uuid,
    config: Arc<CoreConfig>,
    connector: Arc<dyn Connector>,
    events: EventBus,
    state: Arc<RwLock<SessionState>>,
    transport: Arc<RwLock<Option<Arc<TransportResources>>>>,
    forwards: Arc<Mutex<HashMap<u16, LocalForwardHandle>>>,
    capabilities: Arc<CapabilityCell>,
    connect_lock: tokio::sync::Mutex<()>,
    /// The explicit credential the live transport authenticated with, if
    /// any. Reconnection reuses it instead of re-probing.
    credential: Mutex<Option<Credential>>,
    /// Fires once the close listener has released every sub-resource.
    closed: CancelToken,
    /// Set before the transport goes down on a caller-requested
    /// disconnect, so observers of `closed` can tell it from a drop.
    manual_close: AtomicBool,
}

impl Session {
    pub fn new(
        host: HostConfig,
        config: Arc<CoreConfig>,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Self {
        let identity = host.identity_key();
        Self {
            host,
            identity,
            instance: Uuid::new_v4(),
            config,
            connector,
            events,
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            transport: Arc::new(RwLock::new(None)),
            forwards: Arc::new(Mutex::new(HashMap::new())),
            capabilities: Arc::new(CapabilityCell::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            credential: Mutex::new(None),
            closed: CancelToken::new(),
            manual_close: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Connected state backed by a live owner task. The state flag alone
    /// can lag a transport drop by one close-notification delivery.
    pub fn is_connected(&self) -> bool {
        if *self.state.read() != SessionState::Connected {
            return false;
        }
        self.transport
            .read()
            .as_ref()
            .map(|r| r.controller.is_connected())
            .unwrap_or(false)
    }

    /// Last probed capabilities, if the probe has finished.
    pub fn capabilities(&self) -> Option<RemoteCapabilities> {
        self.capabilities.get()
    }

    /// Token that fires after the transport is gone and every
    /// sub-resource has been released.
    pub(crate) fn closed(&self) -> CancelToken {
        self.closed.clone()
    }

    /// Whether [`Session::disconnect`] was called on this instance.
    pub(crate) fn manual_close(&self) -> bool {
        self.manual_close.load(Ordering::SeqCst)
    }

    /// Record caller intent to close before the transport is told to.
    /// A close notification racing in must already see the flag.
    pub(crate) fn mark_manual_close(&self) {
        self.manual_close.store(true, Ordering::SeqCst);
    }

    /// Explicit credential the live transport was built with, if any.
    pub(crate) fn credential(&self) -> Option<Credential> {
        self.credential.lock().clone()
    }

    // ---- lifecycle ----

    /// Establish the transport and wire up its sub-resources.
    ///
    /// Connecting an already-connected session is a no-op. Concurrent
    /// calls serialize on an internal lock so only the first one dials.
    pub async fn connect(&self, explicit: Option<&Credential>) -> Result<(), Error> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            debug!("Session {} already connected, ignoring connect", self.identity);
            return Ok(());
        }

        self.manual_close.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Connecting);
        info!(
            "Connecting session {} (instance {})",
            self.identity, self.instance
        );

        let controller = match self.connector.connect(&self.host, explicit).await {
            Ok(controller) => controller,
            Err(e) => {
                warn!("Connect failed for {}: {}", self.identity, e);
                self.set_state(SessionState::error(e.to_string()));
                return Err(e);
            }
        };

        let sftp = Arc::new(SftpChannel::new(
            controller.clone(),
            self.config.default_remote_path.clone(),
        ));
        let engine = Arc::new(RemoteSearchEngine::new(
            controller.clone(),
            sftp.clone(),
            self.config.clone(),
        ));
        let broker = Arc::new(ChangeWatchBroker::new(
            controller.clone(),
            self.capabilities.clone(),
            self.events.clone(),
            self.identity.clone(),
        ));

        self.capabilities.reset();
        *self.credential.lock() = explicit.cloned();
        *self.transport.write() = Some(Arc::new(TransportResources {
            controller: controller.clone(),
            sftp,
            engine,
            broker,
        }));

        self.spawn_close_listener(&controller);
        if let Some(interval) = self.config.keepalive_interval() {
            self.spawn_heartbeat(&controller, interval);
        }

        // Probe in the background; Connected must not wait on uname.
        let capabilities = self.capabilities.clone();
        let probe_controller = controller;
        tokio::spawn(async move {
            capabilities.get_or_probe(&probe_controller).await;
        });

        self.set_state(SessionState::Connected);
        info!("Session {} connected", self.identity);
        Ok(())
    }

    /// Tear down sub-resources, then the transport. Order matters: the
    /// SFTP channel first, then watchers, then forwards, and the
    /// transport only once nothing rides on it. Failures along the way
    /// are logged, never raised.
    pub async fn disconnect(&self) {
        self.mark_manual_close();
        info!("Disconnecting session {}", self.identity);

        let resources = self.transport.read().clone();
        if let Some(resources) = &resources {
            resources.sftp.reset().await;
            resources.broker.unwatch_all();
        }

        let handles: Vec<LocalForwardHandle> = {
            let mut map = self.forwards.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }

        match resources {
            // The close notification finishes the job: state transition
            // and transport release both happen there.
            Some(resources) => resources.controller.disconnect().await,
            None => self.set_state(SessionState::Disconnected),
        }
    }

    /// On-demand liveness probe of the transport.
    pub async fn ping(&self) -> PingResult {
        match self.controller() {
            Ok(controller) => controller.ping().await,
            Err(_) => PingResult::IoError,
        }
    }

    // ---- remote execution ----

    /// Run a command on the remote host and return its stdout.
    ///
    /// A non-zero exit status is an [`Error::Exec`] carrying the captured
    /// stderr. Servers that close the channel without reporting a status
    /// are treated as success.
    pub async fn exec(&self, command: &str) -> Result<String, Error> {
        self.exec_with_timeout(command, Some(EXEC_TIMEOUT)).await
    }

    pub async fn exec_with_timeout(
        &self,
        command: &str,
        limit: Option<Duration>,
    ) -> Result<String, Error> {
        let controller = self.controller()?;
        let mut channel = controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Channel(format!("failed to execute command: {}", e)))?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut exit_code: Option<u32> = None;

        let collect = async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { ref data }) => {
                        stdout.extend_from_slice(data);
                    }
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        stderr.extend_from_slice(data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        };

        match limit {
            Some(duration) => {
                if timeout(duration, collect).await.is_err() {
                    warn!("Command timed out after {:?}: {}", duration, command);
                    let _ = channel.close().await;
                    return Err(Error::Timeout {
                        what: format!("command did not complete within {:?}", duration),
                    });
                }
            }
            None => collect.await,
        }

        match exit_code {
            Some(code) if code != 0 => {
                debug!("Command exited {}: {}", code, command);
                Err(Error::Exec {
                    command: command.to_string(),
                    exit_code: Some(code),
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                })
            }
            _ => Ok(String::from_utf8_lossy(&stdout).to_string()),
        }
    }

    /// Read from a byte offset to EOF with remote `tail -c`. Cheaper than
    /// an SFTP round trip for polling append-only files.
    pub async fn read_file_tail(&self, path: &str, byte_offset: u64) -> Result<String, Error> {
        // tail -c counts from 1
        let command = format!(
            "tail -c +{} {}",
            byte_offset.saturating_add(1),
            shell_quote(path)
        );
        self.exec(&command).await
    }

    /// First `line_count` lines of a remote file.
    pub async fn read_head_lines(&self, path: &str, line_count: u64) -> Result<String, Error> {
        let command = format!("head -n {} {}", line_count, shell_quote(path));
        self.exec(&command).await
    }

    /// Last `line_count` lines of a remote file.
    pub async fn read_tail_lines(&self, path: &str, line_count: u64) -> Result<String, Error> {
        let command = format!("tail -n {} {}", line_count, shell_quote(path));
        self.exec(&command).await
    }

    // ---- file operations ----

    pub async fn list_files(&self, path: &str) -> Result<Vec<FileInfo>, Error> {
        self.sftp()?.list_dir(path).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.sftp()?.read_file(path).await
    }

    /// Streamed read with per-chunk progress and cooperative cancellation.
    /// `chunk_size` of zero selects the default chunk size. Cancelling
    /// rejects with [`Error::Cancelled`]; partial bytes are discarded.
    pub async fn read_file_chunked(
        &self,
        path: &str,
        chunk_size: usize,
        progress: Option<mpsc::Sender<ReadProgress>>,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, Error> {
        self.sftp()?
            .read_file_chunked(path, chunk_size, progress, cancel)
            .await
    }

    /// Write and durably close a remote file. Resolves only after the
    /// server acknowledges the close.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), Error> {
        self.sftp()?.write_file(path, content).await
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), Error> {
        self.sftp()?.mkdir(path).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        self.sftp()?.rename(from, to).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<(), Error> {
        self.sftp()?.remove(path).await
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        self.sftp()?.stat(path).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool, Error> {
        self.sftp()?.exists(path).await
    }

    /// Canonical base directory for relative remote paths (opens the SFTP
    /// sub-channel on first use).
    pub async fn remote_base_dir(&self) -> Result<String, Error> {
        self.sftp()?.base_dir().await
    }

    // ---- search ----

    /// Run a remote search. Cancellation resolves with the matches
    /// gathered so far rather than an error.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchMatch>, Error> {
        self.resources()?.engine.search(request, cancel).await
    }

    // ---- change watching ----

    /// Start watching a remote path. `Ok(false)` means the host offers no
    /// watch tool and the caller should poll instead.
    pub async fn watch_file(&self, path: &str) -> Result<bool, Error> {
        self.resources()?.broker.watch_file(path).await
    }

    pub fn unwatch_file(&self, path: &str) {
        if let Some(resources) = self.transport.read().as_ref() {
            resources.broker.unwatch_file(path);
        }
    }

    pub fn unwatch_all(&self) {
        if let Some(resources) = self.transport.read().as_ref() {
            resources.broker.unwatch_all();
        }
    }

    pub fn watched_paths(&self) -> Vec<String> {
        self.transport
            .read()
            .as_ref()
            .map(|resources| resources.broker.watched_paths())
            .unwrap_or_default()
    }

    // ---- port forwarding ----

    /// Forward a local port to `remote_host:remote_port` through the
    /// transport. Port 0 picks a free port; the bound port is returned
    /// and identifies the forward from then on.
    pub async fn forward_port(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<u16, Error> {
        let controller = self.controller()?;

        if local_port != 0 && self.forwards.lock().contains_key(&local_port) {
            return Err(Error::connection(
                ConnectFailure::Io,
                format!("local port {} is already forwarded", local_port),
            ));
        }

        let config = LocalForward::loopback(local_port, remote_host, remote_port);
        let handle = start_local_forward(controller, config).await?;
        let bound = handle.local_port();
        self.forwards.lock().insert(bound, handle);
        info!(
            "Forwarding 127.0.0.1:{} -> {}:{} for {}",
            bound, remote_host, remote_port, self.identity
        );
        Ok(bound)
    }

    /// Stop one forward. Returns whether it existed.
    pub async fn stop_forward(&self, local_port: u16) -> bool {
        let handle = self.forwards.lock().remove(&local_port);
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn active_forwards(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.forwards.lock().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn forward_stats(&self, local_port: u16) -> Option<ForwardStats> {
        self.forwards.lock().get(&local_port).map(|h| h.stats())
    }

    // ---- internals ----

    fn resources(&self) -> Result<Arc<TransportResources>, Error> {
        self.transport.read().clone().ok_or(Error::NotConnected)
    }

    fn controller(&self) -> Result<HandleController, Error> {
        Ok(self.resources()?.controller.clone())
    }

    fn sftp(&self) -> Result<Arc<SftpChannel>, Error> {
        Ok(self.resources()?.sftp.clone())
    }

    fn set_state(&self, next: SessionState) {
        {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            *state = next.clone();
        }
        self.events.emit(CoreEvent::ConnectionStateChanged {
            key: self.identity.clone(),
            state: next,
        });
    }

    /// Release everything when the owner task goes away. Runs for manual
    /// disconnects and for network drops alike, so this is the one place
    /// that transitions to Disconnected while a transport exists.
    fn spawn_close_listener(&self, controller: &HandleController) {
        let mut disconnect_rx = controller.subscribe_disconnect();
        let state = self.state.clone();
        let transport = self.transport.clone();
        let forwards = self.forwards.clone();
        let capabilities = self.capabilities.clone();
        let events = self.events.clone();
        let identity = self.identity.clone();
        let instance = self.instance;
        let closed = self.closed.clone();

        tokio::spawn(async move {
            // A delivered notification and a dropped sender both mean the
            // owner task is gone.
            let _ = disconnect_rx.recv().await;
            debug!("Transport closed for {} (instance {})", identity, instance);

            let resources = transport.write().take();
            if let Some(resources) = resources {
                resources.sftp.reset().await;
                resources.broker.unwatch_all();
            }

            let handles: Vec<LocalForwardHandle> = {
                let mut map = forwards.lock();
                map.drain().map(|(_, handle)| handle).collect()
            };
            for handle in handles {
                handle.stop().await;
            }

            capabilities.reset();

            let changed = {
                let mut current = state.write();
                if *current == SessionState::Disconnected {
                    false
                } else {
                    *current = SessionState::Disconnected;
                    true
                }
            };
            if changed {
                events.emit(CoreEvent::ConnectionStateChanged {
                    key: identity,
                    state: SessionState::Disconnected,
                });
            }

            // Last, so anyone waiting on the token sees the released state.
            closed.cancel();
        });
    }

    /// Periodic transport probe. A ping that times out inside the
    /// protocol window is survivable and only logged; an I/O failure
    /// means the owner task is unreachable, so the transport is forced
    /// down to get the close path running promptly.
    fn spawn_heartbeat(&self, controller: &HandleController, interval: Duration) {
        let controller = controller.clone();
        let mut disconnect_rx = controller.subscribe_disconnect();
        let identity = self.identity.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = disconnect_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match controller.ping().await {
                    PingResult::Ok => {}
                    PingResult::Timeout => {
                        debug!("Heartbeat ping timed out for {}", identity);
                    }
                    PingResult::IoError => {
                        warn!("Heartbeat lost the transport for {}, forcing close", identity);
                        controller.disconnect().await;
                        break;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::HandleCommand;
    use tokio::sync::broadcast;

    struct ScriptedConnector {
        outcomes: Mutex<Vec<Result<HandleController, Error>>>,
    }

    impl ScriptedConnector {
        fn new(outcomes: Vec<Result<HandleController, Error>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            _host: &HostConfig,
            _explicit: Option<&Credential>,
        ) -> Result<HandleController, Error> {
            self.outcomes.lock().remove(0)
        }
    }

    fn test_host() -> HostConfig {
        HostConfig::new("example.com", 22, "deploy")
    }

    fn test_session(connector: Arc<dyn Connector>) -> (Session, EventBus) {
        let events = EventBus::new();
        let session = Session::new(
            test_host(),
            Arc::new(CoreConfig::default()),
            connector,
            events.clone(),
        );
        (session, events)
    }

    async fn next_state(
        rx: &mut broadcast::Receiver<CoreEvent>,
    ) -> SessionState {
        loop {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event bus closed");
            if let CoreEvent::ConnectionStateChanged { state, .. } = event {
                return state;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_transitions_and_is_idempotent() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let controller = HandleController::new(cmd_tx);
        let connector = ScriptedConnector::new(vec![Ok(controller)]);
        let (session, events) = test_session(connector);
        let mut rx = events.subscribe();

        assert_eq!(session.state(), SessionState::Disconnected);
        session.connect(None).await.unwrap();

        assert_eq!(next_state(&mut rx).await, SessionState::Connecting);
        assert_eq!(next_state(&mut rx).await, SessionState::Connected);
        assert!(session.is_connected());

        // A second connect must not dial again; the script has no
        // outcome left, so dialing would panic.
        session.connect(None).await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_sets_error_state() {
        let connector = ScriptedConnector::new(vec![Err(Error::Authentication(
            "bad password".into(),
        ))]);
        let (session, events) = test_session(connector);
        let mut rx = events.subscribe();

        let err = session.connect(None).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        assert_eq!(next_state(&mut rx).await, SessionState::Connecting);
        match next_state(&mut rx).await {
            SessionState::Error { message } => {
                assert!(message.contains("bad password"))
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let connector = ScriptedConnector::new(vec![]);
        let (session, _events) = test_session(connector);

        assert!(matches!(
            session.exec("uname -s").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.list_files(".").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            session.forward_port(0, "localhost", 5432).await,
            Err(Error::NotConnected)
        ));
        assert_eq!(session.ping().await, PingResult::IoError);
        assert!(session.watched_paths().is_empty());
        assert!(session.active_forwards().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_forward_port_is_rejected() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let controller = HandleController::new(cmd_tx);
        let connector = ScriptedConnector::new(vec![Ok(controller)]);
        let (session, _events) = test_session(connector);
        session.connect(None).await.unwrap();

        let bound = session.forward_port(0, "localhost", 5432).await.unwrap();
        assert_ne!(bound, 0);
        assert_eq!(session.active_forwards(), vec![bound]);

        let err = session
            .forward_port(bound, "localhost", 5432)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already forwarded"));

        assert!(session.stop_forward(bound).await);
        assert!(!session.stop_forward(bound).await);
        assert!(session.active_forwards().is_empty());
    }

    #[tokio::test]
    async fn test_close_notification_releases_everything() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController::new_with_notifier(cmd_tx, disconnect_tx.clone());
        let connector = ScriptedConnector::new(vec![Ok(controller)]);
        let (session, events) = test_session(connector);
        let mut rx = events.subscribe();

        session.connect(None).await.unwrap();
        assert_eq!(next_state(&mut rx).await, SessionState::Connecting);
        assert_eq!(next_state(&mut rx).await, SessionState::Connected);

        let bound = session.forward_port(0, "localhost", 8080).await.unwrap();
        assert_eq!(session.active_forwards(), vec![bound]);

        // Simulate the owner task dropping the transport.
        disconnect_tx.send(()).unwrap();

        assert_eq!(next_state(&mut rx).await, SessionState::Disconnected);
        assert!(!session.is_connected());
        assert!(session.active_forwards().is_empty());
        assert!(matches!(
            session.exec("true").await,
            Err(Error::NotConnected)
        ));

        let closed = session.closed();
        timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("close token fires after the transport drop");
        assert!(!session.manual_close());
    }

    #[tokio::test]
    async fn test_manual_disconnect_runs_the_close_path() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController::new_with_notifier(cmd_tx, disconnect_tx.clone());
        let connector = ScriptedConnector::new(vec![Ok(controller)]);
        let (session, events) = test_session(connector);
        let mut rx = events.subscribe();

        // Owner stand-in that honors disconnect requests.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if matches!(cmd, HandleCommand::Disconnect) {
                    break;
                }
            }
            let _ = disconnect_tx.send(());
        });

        session.connect(None).await.unwrap();
        assert_eq!(next_state(&mut rx).await, SessionState::Connecting);
        assert_eq!(next_state(&mut rx).await, SessionState::Connected);

        session.disconnect().await;
        assert!(session.manual_close());
        assert_eq!(next_state(&mut rx).await, SessionState::Disconnected);

        let closed = session.closed();
        timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("close token fires after a manual disconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_forces_close_when_transport_dies() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController::new_with_notifier(cmd_tx, disconnect_tx.clone());
        let connector = ScriptedConnector::new(vec![Ok(controller)]);

        let events = EventBus::new();
        let config = CoreConfig {
            keepalive_interval_ms: 100,
            ..CoreConfig::default()
        };
        let session = Session::new(test_host(), Arc::new(config), connector, events.clone());
        let mut rx = events.subscribe();

        // Owner stand-in for a dead transport: pings fail with an I/O
        // error and the disconnect request ends the task as usual.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::Ping { reply_tx } => {
                        let _ = reply_tx.send(PingResult::IoError);
                    }
                    HandleCommand::Disconnect => break,
                    _ => {}
                }
            }
            let _ = disconnect_tx.send(());
        });

        session.connect(None).await.unwrap();
        assert_eq!(next_state(&mut rx).await, SessionState::Connecting);
        assert_eq!(next_state(&mut rx).await, SessionState::Connected);

        // The first heartbeat tick discovers the dead transport.
        assert_eq!(next_state(&mut rx).await, SessionState::Disconnected);
        assert!(!session.manual_close());

        let closed = session.closed();
        timeout(Duration::from_secs(1), closed.cancelled())
            .await
            .expect("close token fires after the forced close");
    }

    #[tokio::test]
    async fn test_disconnect_without_transport_settles_state() {
        let connector = ScriptedConnector::new(vec![Err(Error::connection(
            ConnectFailure::Refused,
            "connection refused",
        ))]);
        let (session, events) = test_session(connector);
        let mut rx = events.subscribe();

        let _ = session.connect(None).await;
        assert_eq!(next_state(&mut rx).await, SessionState::Connecting);
        assert!(matches!(
            next_state(&mut rx).await,
            SessionState::Error { .. }
        ));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(next_state(&mut rx).await, SessionState::Disconnected);
    }
}
