//! Keyed store of live sessions and the reconnection state machine
//!
//! One [`Session`] per identity key, enforced under a per-identity creation
//! lock. The registry watches every session it inserts; an unexpected
//! transport drop opens a reconnect series that retries on a fixed interval,
//! replacing the dead instance with a fresh one on every attempt. Manual
//! disconnects mark their intent and cancel the retry bookkeeping under the
//! same lock the drop watcher takes, before the transport is told to close,
//! so a timer can never resurrect a connection the caller just killed.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, Credential, HostConfig, IdentityKey};
use crate::error::Error;
use crate::events::{CoreEvent, EventBus};

use super::session::{Connector, Session};

/// Bookkeeping for one identity that is disconnected but not closed.
/// Created on an unexpected transport drop, destroyed when the series
/// succeeds, ends or is cancelled.
struct ReconnectRecord {
    host: HostConfig,
    /// Credential the dropped transport was built with; retries reuse it
    /// instead of re-probing storage.
    credential: Option<Credential>,
    attempt: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// How one reconnect attempt ended.
enum Attempt {
    Connected,
    Terminal(Error),
    Retry(Error),
}

struct Inner {
    sessions: DashMap<IdentityKey, Arc<Session>>,
    reconnects: DashMap<IdentityKey, ReconnectRecord>,
    /// Per-identity creation locks closing the double-dial race between
    /// callers and the retry series.
    connect_locks: DashMap<IdentityKey, Arc<tokio::sync::Mutex<()>>>,
    config: Arc<CoreConfig>,
    connector: Arc<dyn Connector>,
    events: EventBus,
}

pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(config: Arc<CoreConfig>, connector: Arc<dyn Connector>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                reconnects: DashMap::new(),
                connect_locks: DashMap::new(),
                config,
                connector,
                events,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Connect (or return) the session for a host identity.
    ///
    /// An already-live session is reused. Otherwise any running reconnect
    /// series for the identity is cancelled, a fresh instance dials, and
    /// the map entry is replaced whatever the outcome, so the last attempt
    /// stays queryable through [`SessionRegistry::get`].
    pub async fn connect_session(
        &self,
        host: HostConfig,
        credential: Option<Credential>,
    ) -> Result<Arc<Session>, Error> {
        let key = host.identity_key();
        let lock = self.inner.connect_lock(&key);
        let _guard = lock.lock().await;

        // A caller-driven connect supersedes any running retry series.
        self.inner.cancel_reconnect(&key);

        if let Some(existing) = self.inner.get_connected(&key) {
            debug!("Session {} already live, reusing", key);
            return Ok(existing);
        }

        let session = Arc::new(Session::new(
            host,
            self.inner.config.clone(),
            self.inner.connector.clone(),
            self.inner.events.clone(),
        ));
        let result = session.connect(credential.as_ref()).await;

        self.inner.sessions.insert(key.clone(), session.clone());
        if result.is_ok() {
            Inner::spawn_drop_watcher(&self.inner, &key, &session);
        }
        result.map(|()| session)
    }

    /// Disconnect one identity and drop its registry entry.
    ///
    /// Ordering contract: mark the manual-close intent, then kill the retry
    /// bookkeeping, both under the identity's creation lock, and only then
    /// tell the transport to close; the close notification and the drop
    /// watcher finish the map cleanup. Cancelling an identity that only had
    /// a reconnect series in flight is a success.
    pub async fn disconnect_session(&self, key: &IdentityKey) -> Result<(), Error> {
        let (session, had_series) = {
            let lock = self.inner.connect_lock(key);
            let _guard = lock.lock().await;

            // Intent first: a drop watcher waking on an already-fired close
            // notification queues behind this lock and reads the flag as
            // set, instead of opening a series the cancel below never saw.
            let session = self.inner.sessions.get(key).map(|entry| entry.clone());
            if let Some(session) = &session {
                session.mark_manual_close();
            }
            (session, self.inner.cancel_reconnect(key))
        };

        let Some(session) = session else {
            return if had_series {
                Ok(())
            } else {
                Err(Error::SessionNotFound(key.to_string()))
            };
        };

        session.disconnect().await;

        // Sessions without a live transport have no close notification
        // coming; remove them here instead of waiting on the watcher.
        self.inner.sessions.remove_if(key, |_, current| {
            Arc::ptr_eq(current, &session) && !current.is_connected()
        });
        Ok(())
    }

    /// Shutdown path: per identity, mark intent and cancel the series under
    /// the creation lock, then disconnect, then clear the map.
    pub async fn disconnect_all(&self) {
        let mut keys: Vec<IdentityKey> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for entry in self.inner.reconnects.iter() {
            if !keys.contains(entry.key()) {
                keys.push(entry.key().clone());
            }
        }

        info!("Disconnecting {} sessions", keys.len());
        for key in keys {
            let session = {
                let lock = self.inner.connect_lock(&key);
                let _guard = lock.lock().await;
                let session = self.inner.sessions.get(&key).map(|entry| entry.clone());
                if let Some(session) = &session {
                    session.mark_manual_close();
                }
                self.inner.cancel_reconnect(&key);
                session
            };
            if let Some(session) = session {
                session.disconnect().await;
            }
        }
        self.inner.sessions.clear();
    }

    pub fn get(&self, key: &IdentityKey) -> Option<Arc<Session>> {
        self.inner.sessions.get(key).map(|entry| entry.clone())
    }

    pub fn connected_keys(&self) -> Vec<IdentityKey> {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_reconnecting(&self, key: &IdentityKey) -> bool {
        self.inner.reconnects.contains_key(key)
    }

    /// Every identity with a running reconnect series and its attempt count.
    pub fn reconnecting_identities(&self) -> Vec<(IdentityKey, u32)> {
        self.inner
            .reconnects
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().attempt.load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}

impl Inner {
    fn connect_lock(&self, key: &IdentityKey) -> Arc<tokio::sync::Mutex<()>> {
        self.connect_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn get_connected(&self, key: &IdentityKey) -> Option<Arc<Session>> {
        self.sessions
            .get(key)
            .map(|entry| entry.clone())
            .filter(|session| session.is_connected())
    }

    /// Tear down reconnect bookkeeping for an identity. The flag stops a
    /// series that is mid-attempt, the abort stops one that is sleeping.
    fn cancel_reconnect(&self, key: &IdentityKey) -> bool {
        match self.reconnects.remove(key) {
            Some((_, record)) => {
                record.cancelled.store(true, Ordering::SeqCst);
                record.task.abort();
                info!(
                    "Cancelled reconnect series for {} ({})",
                    key, record.host.address
                );
                true
            }
            None => false,
        }
    }

    fn finish_failed(&self, key: &IdentityKey, host: &HostConfig, attempt: u32) {
        self.reconnects.remove(key);
        self.events.emit(CoreEvent::Reconnecting {
            key: key.clone(),
            host: host.address.clone(),
            attempt,
            is_reconnecting: false,
        });
    }

    /// Watch one inserted session instance until its transport is gone.
    /// Manual closes delete the entry; unexpected drops open a reconnect
    /// series. Only the watched instance may act: a newer instance in the
    /// map means this drop was already handled.
    ///
    /// The flag check and the series creation happen as one step under the
    /// identity's creation lock. A manual disconnect racing this wake takes
    /// the same lock to set the flag, so one side always sees the other:
    /// either the flag is read as set here, or the series exists by the
    /// time the disconnect cancels it.
    fn spawn_drop_watcher(inner: &Arc<Inner>, key: &IdentityKey, session: &Arc<Session>) {
        let inner = inner.clone();
        let key = key.clone();
        let session = session.clone();

        tokio::spawn(async move {
            let closed = session.closed();
            closed.cancelled().await;

            let lock = inner.connect_lock(&key);
            let _guard = lock.lock().await;

            if session.manual_close() {
                debug!("Session {} closed by caller, dropping entry", key);
                inner
                    .sessions
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &session));
                return;
            }

            let watched_is_current = inner
                .sessions
                .get(&key)
                .map(|current| Arc::ptr_eq(&current, &session))
                .unwrap_or(false);
            if !watched_is_current {
                debug!("Stale drop notification for {}, ignoring", key);
                return;
            }

            Inner::schedule_reconnect(&inner, key, session.host().clone(), session.credential());
        });
    }

    /// Open a reconnect series for an identity whose transport dropped
    /// unexpectedly. Attempt 0 announces the series; the first dial happens
    /// one interval later.
    fn schedule_reconnect(
        inner: &Arc<Inner>,
        key: IdentityKey,
        host: HostConfig,
        credential: Option<Credential>,
    ) {
        if inner.reconnects.contains_key(&key) {
            debug!("Reconnect series for {} already running", key);
            return;
        }

        warn!(
            "Transport for {} dropped unexpectedly, scheduling reconnect",
            key
        );
        let attempt = Arc::new(AtomicU32::new(0));
        let cancelled = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(Inner::run_series(
            inner.clone(),
            key.clone(),
            host.clone(),
            attempt.clone(),
            cancelled.clone(),
        ));
        inner.reconnects.insert(
            key.clone(),
            ReconnectRecord {
                host: host.clone(),
                credential,
                attempt,
                cancelled,
                task,
            },
        );

        inner.events.emit(CoreEvent::Reconnecting {
            key,
            host: host.address,
            attempt: 0,
            is_reconnecting: true,
        });
    }

    async fn run_series(
        inner: Arc<Inner>,
        key: IdentityKey,
        host: HostConfig,
        attempt: Arc<AtomicU32>,
        cancelled: Arc<AtomicBool>,
    ) {
        let interval = inner.config.reconnect_interval();
        let cap = inner.config.max_reconnect_attempts;

        loop {
            tokio::time::sleep(interval).await;

            if cancelled.load(Ordering::SeqCst) {
                debug!("Reconnect series for {} cancelled", key);
                return;
            }
            if inner.get_connected(&key).is_some() {
                debug!("Session {} is live again, ending reconnect series", key);
                inner.reconnects.remove(&key);
                return;
            }

            let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Reconnect attempt {} for {}", n, key);
            inner.events.emit(CoreEvent::Reconnecting {
                key: key.clone(),
                host: host.address.clone(),
                attempt: n,
                is_reconnecting: true,
            });

            let session = Arc::new(Session::new(
                host.clone(),
                inner.config.clone(),
                inner.connector.clone(),
                inner.events.clone(),
            ));
            let credential = inner
                .reconnects
                .get(&key)
                .and_then(|record| record.credential.clone());

            let lock = inner.connect_lock(&key);
            let outcome = {
                let _guard = lock.lock().await;
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                // Each attempt replaces the dead instance, never revives it.
                inner.sessions.remove_if(&key, |_, s| !s.is_connected());

                match session.connect(credential.as_ref()).await {
                    Ok(()) => {
                        inner.sessions.insert(key.clone(), session.clone());
                        Inner::spawn_drop_watcher(&inner, &key, &session);
                        Attempt::Connected
                    }
                    Err(e) if !e.is_reconnectable() || (cap != 0 && n >= cap) => {
                        // The failed instance stays queryable in its Error
                        // state.
                        inner.sessions.insert(key.clone(), session.clone());
                        Attempt::Terminal(e)
                    }
                    Err(e) => Attempt::Retry(e),
                }
            };

            match outcome {
                Attempt::Connected => {
                    info!("Session {} reconnected on attempt {}", key, n);
                    inner.reconnects.remove(&key);
                    inner.events.emit(CoreEvent::Reconnected { key: key.clone() });
                    return;
                }
                Attempt::Terminal(e) => {
                    warn!("Reconnect series for {} ended on attempt {}: {}", key, n, e);
                    inner.finish_failed(&key, &host, n);
                    return;
                }
                Attempt::Retry(e) => {
                    warn!("Reconnect attempt {} for {} failed: {}", n, key, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectFailure;
    use crate::events::SessionState;
    use crate::ssh::{HandleCommand, HandleController, PingResult};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc, oneshot};
    use tokio::time::timeout;

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

    #[async_trait::async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            _host: &HostConfig,
            _explicit: Option<&Credential>,
        ) -> Result<HandleController, Error> {
            self.outcomes.lock().remove(0)
        }
    }

    /// Controller backed by a stand-in owner task. The returned sender
    /// kills the transport the way a network drop would; the owner also
    /// honors disconnect requests and answers pings.
    fn fake_transport() -> (HandleController, oneshot::Sender<()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (disconnect_tx, _) = broadcast::channel(1);
        let controller = HandleController::new_with_notifier(cmd_tx, disconnect_tx.clone());
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(HandleCommand::Ping { reply_tx }) => {
                            let _ = reply_tx.send(PingResult::Ok);
                        }
                        Some(HandleCommand::Disconnect) | None => break,
                        Some(_) => {}
                    }
                }
            }
            let _ = disconnect_tx.send(());
        });

        (controller, kill_tx)
    }

    fn refused() -> Error {
        Error::connection(ConnectFailure::Refused, "connection refused")
    }

    fn test_host() -> HostConfig {
        HostConfig::new("example.com", 22, "deploy")
    }

    fn test_registry(connector: Arc<dyn Connector>) -> (SessionRegistry, EventBus) {
        let events = EventBus::new();
        let registry =
            SessionRegistry::new(Arc::new(CoreConfig::default()), connector, events.clone());
        (registry, events)
    }

    async fn next_reconnect_event(rx: &mut broadcast::Receiver<CoreEvent>) -> CoreEvent {
        loop {
            let event = timeout(Duration::from_secs(30), rx.recv())
                .await
                .expect("timed out waiting for reconnect event")
                .expect("event bus closed");
            if matches!(
                event,
                CoreEvent::Reconnecting { .. } | CoreEvent::Reconnected { .. }
            ) {
                return event;
            }
        }
    }

    async fn expect_reconnecting(rx: &mut broadcast::Receiver<CoreEvent>, expected: u32) {
        match next_reconnect_event(rx).await {
            CoreEvent::Reconnecting {
                attempt,
                is_reconnecting,
                ..
            } => {
                assert_eq!(attempt, expected);
                assert!(is_reconnecting);
            }
            other => panic!("expected reconnecting event, got {:?}", other),
        }
    }

    /// Bounded wait for background cleanup (drop watchers) to land.
    async fn settle(mut cond: impl FnMut() -> bool) {
        for _ in 0..50 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never settled");
    }

    fn drain_reconnect_events(rx: &mut broadcast::Receiver<CoreEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(
                event,
                CoreEvent::Reconnecting { .. } | CoreEvent::Reconnected { .. }
            ) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_connect_registers_one_session_per_identity() {
        let (t1, _kill) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1)]);
        let (registry, _events) = test_registry(connector);
        let key = test_host().identity_key();

        assert!(registry.is_empty());
        let session = registry.connect_session(test_host(), None).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.connected_keys(), vec![key.clone()]);
        assert!(!registry.is_reconnecting(&key));

        // Same identity again: reused, not re-dialed. The script has no
        // outcome left, so a second dial would panic.
        let again = registry.connect_session(test_host(), None).await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_dial() {
        let (t1, _kill) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1)]);
        let (registry, _events) = test_registry(connector);

        let (a, b) = tokio::join!(
            registry.connect_session(test_host(), None),
            registry.connect_session(test_host(), None),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_error_state_queryable() {
        let connector =
            ScriptedConnector::new(vec![Err(Error::Authentication("bad password".into()))]);
        let (registry, _events) = test_registry(connector);
        let key = test_host().identity_key();

        let err = registry
            .connect_session(test_host(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        let session = registry.get(&key).expect("failed session stays queryable");
        assert!(matches!(session.state(), SessionState::Error { .. }));
        assert!(registry.connected_keys().is_empty());
        assert!(!registry.is_reconnecting(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_drop_retries_until_success() {
        let (t1, kill1) = fake_transport();
        let (t2, _kill2) = fake_transport();
        let connector =
            ScriptedConnector::new(vec![Ok(t1), Err(refused()), Err(refused()), Ok(t2)]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        let first = registry.connect_session(test_host(), None).await.unwrap();

        kill1.send(()).unwrap();

        expect_reconnecting(&mut rx, 0).await;
        settle(|| registry.is_reconnecting(&key)).await;
        expect_reconnecting(&mut rx, 1).await;
        expect_reconnecting(&mut rx, 2).await;
        expect_reconnecting(&mut rx, 3).await;
        match next_reconnect_event(&mut rx).await {
            CoreEvent::Reconnected { key: event_key } => assert_eq!(event_key, key),
            other => panic!("expected reconnected event, got {:?}", other),
        }

        settle(|| !registry.is_reconnecting(&key)).await;
        let replacement = registry.get(&key).expect("replacement session present");
        assert!(replacement.is_connected());
        assert!(!Arc::ptr_eq(&first, &replacement));
        assert_eq!(registry.len(), 1);
        assert!(registry.reconnecting_identities().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_never_reconnects() {
        let (t1, _kill) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1)]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        registry.connect_session(test_host(), None).await.unwrap();
        registry.disconnect_session(&key).await.unwrap();

        settle(|| registry.get(&key).is_none()).await;
        assert!(!registry.is_reconnecting(&key));

        // Give any stray timer plenty of room to misfire.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain_reconnect_events(&mut rx), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_concurrent_with_transport_drop() {
        let (t1, kill1) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1)]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        registry.connect_session(test_host(), None).await.unwrap();

        // The network drop and the caller's disconnect land together; the
        // close notification is already in flight when intent is marked.
        kill1.send(()).unwrap();
        registry.disconnect_session(&key).await.unwrap();

        settle(|| registry.get(&key).is_none()).await;
        assert!(!registry.is_reconnecting(&key));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain_reconnect_events(&mut rx), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_racing_manual_close_never_reconnects() {
        let (t1, kill1) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1)]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        let session = registry.connect_session(test_host(), None).await.unwrap();

        // Hold the creation lock so the waking drop watcher queues behind
        // it, unable to run its flag check yet.
        let lock = registry.inner.connect_lock(&key);
        let guard = lock.lock().await;

        kill1.send(()).unwrap();
        settle(|| !session.is_connected()).await;

        // Caller intent lands while the watcher is parked on the lock.
        session.mark_manual_close();
        drop(guard);

        settle(|| registry.get(&key).is_none()).await;
        assert!(!registry.is_reconnecting(&key));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain_reconnect_events(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_running_series() {
        let (t1, kill1) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1), Err(refused())]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        registry.connect_session(test_host(), None).await.unwrap();
        kill1.send(()).unwrap();

        expect_reconnecting(&mut rx, 0).await;
        expect_reconnecting(&mut rx, 1).await;

        // Mid-series the stale entry is gone; cancelling is still a success.
        registry.disconnect_session(&key).await.unwrap();
        assert!(!registry.is_reconnecting(&key));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(drain_reconnect_events(&mut rx), 0);
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_connect_supersedes_series() {
        let (t1, kill1) = fake_transport();
        let (t2, _kill2) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1), Err(refused()), Ok(t2)]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        registry.connect_session(test_host(), None).await.unwrap();
        kill1.send(()).unwrap();

        expect_reconnecting(&mut rx, 0).await;
        expect_reconnecting(&mut rx, 1).await;

        // A caller dial consumes the third outcome and ends the series.
        let session = registry.connect_session(test_host(), None).await.unwrap();
        assert!(session.is_connected());
        assert!(!registry.is_reconnecting(&key));

        tokio::time::sleep(Duration::from_secs(30)).await;
        // No reconnected event: the series did not finish, a caller did.
        assert_eq!(drain_reconnect_events(&mut rx), 0);
        assert!(registry.get(&key).unwrap().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_ends_series_immediately() {
        let (t1, kill1) = fake_transport();
        let connector = ScriptedConnector::new(vec![
            Ok(t1),
            Err(Error::Authentication("key rejected".into())),
        ]);
        let (registry, events) = test_registry(connector);
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        registry.connect_session(test_host(), None).await.unwrap();
        kill1.send(()).unwrap();

        expect_reconnecting(&mut rx, 0).await;
        expect_reconnecting(&mut rx, 1).await;
        match next_reconnect_event(&mut rx).await {
            CoreEvent::Reconnecting {
                attempt,
                is_reconnecting,
                ..
            } => {
                assert_eq!(attempt, 1);
                assert!(!is_reconnecting);
            }
            other => panic!("expected series end event, got {:?}", other),
        }

        settle(|| !registry.is_reconnecting(&key)).await;
        let session = registry.get(&key).expect("terminal session queryable");
        assert!(matches!(session.state(), SessionState::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_stops_series() {
        let (t1, kill1) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1), Err(refused()), Err(refused())]);
        let events = EventBus::new();
        let config = CoreConfig {
            max_reconnect_attempts: 2,
            ..CoreConfig::default()
        };
        let registry = SessionRegistry::new(Arc::new(config), connector, events.clone());
        let mut rx = events.subscribe();
        let key = test_host().identity_key();

        registry.connect_session(test_host(), None).await.unwrap();
        kill1.send(()).unwrap();

        expect_reconnecting(&mut rx, 0).await;
        expect_reconnecting(&mut rx, 1).await;
        expect_reconnecting(&mut rx, 2).await;
        match next_reconnect_event(&mut rx).await {
            CoreEvent::Reconnecting {
                attempt,
                is_reconnecting,
                ..
            } => {
                assert_eq!(attempt, 2);
                assert!(!is_reconnecting);
            }
            other => panic!("expected series end event, got {:?}", other),
        }

        settle(|| !registry.is_reconnecting(&key)).await;
        assert!(registry.connected_keys().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_identity_is_an_error() {
        let connector = ScriptedConnector::new(vec![]);
        let (registry, _events) = test_registry(connector);
        let key = IdentityKey::new("nowhere.example", 22, "nobody");

        assert!(matches!(
            registry.disconnect_session(&key).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_all_clears_registry() {
        let (t1, _k1) = fake_transport();
        let (t2, _k2) = fake_transport();
        let connector = ScriptedConnector::new(vec![Ok(t1), Ok(t2)]);
        let (registry, _events) = test_registry(connector);

        registry.connect_session(test_host(), None).await.unwrap();
        registry
            .connect_session(HostConfig::new("other.example.com", 22, "deploy"), None)
            .await
            .unwrap();
        assert_eq!(registry.len(), 2);

        registry.disconnect_all().await;
        assert!(registry.is_empty());
        assert!(registry.reconnecting_identities().is_empty());
    }
}
