// ABOUTME: Store connection supervisor: opens the store in the background and retries on failure.
// ABOUTME: Publishes ConnectionState to read-only handles and fires a one-shot "opened" signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sqlite::{SqliteStore, StoreLocation, redact_uri};
use crate::store::{SharedStore, StoreError};

/// Process-local view of the store link. Only the ConnectionManager writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Open,
    Errored { retryable: bool, message: String },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

/// How long to wait between failed connection attempts.
///
/// The delay for failure `n` (1-based) is `base_delay * multiplier^(n-1)`,
/// capped at `max_delay`, then reduced by up to `jitter` (a fraction in
/// `[0, 1]`). The default is a fixed 5 s delay with no attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the `attempt`-th consecutive failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let cap = self.max_delay.max(self.base_delay).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter * rand::random::<f64>();
        Duration::from_secs_f64(raw.min(cap) * factor)
    }

    /// Whether another attempt may follow `attempts_made` failures.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }
}

/// Timeouts and cadence for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Bound on store activity: lock waits and health probes.
    pub io_timeout: Duration,
    /// How often an open store is probed.
    pub health_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(45),
            health_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Something that can produce a live store handle.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable target for log lines. Must not contain secrets.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<SharedStore, StoreError>;
}

/// Shortest probe cadence; `tokio::time::interval` rejects zero.
const MIN_HEALTH_INTERVAL: Duration = Duration::from_millis(1);

/// Opens a SqliteStore from a store URI.
pub struct SqliteConnector {
    uri: String,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(uri: impl Into<String>, busy_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            busy_timeout,
        }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn describe(&self) -> String {
        redact_uri(&self.uri)
    }

    async fn connect(&self) -> Result<SharedStore, StoreError> {
        let location = StoreLocation::parse(&self.uri)?;
        let busy_timeout = self.busy_timeout;
        let store = tokio::task::spawn_blocking(move || {
            SqliteStore::open_location(&location, busy_timeout)
        })
        .await
        .map_err(|e| StoreError::Database(format!("store open task failed: {}", e)))??;
        Ok(Arc::new(store))
    }
}

/// Resolves once, with the store, the first time the connection opens.
/// Resolves to `None` if the manager gives up before ever opening.
pub struct OpenedSignal(oneshot::Receiver<SharedStore>);

impl OpenedSignal {
    pub async fn opened(self) -> Option<SharedStore> {
        self.0.await.ok()
    }
}

/// Read-only view of the manager's state, cheap to clone into handlers.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
    store: watch::Receiver<Option<SharedStore>>,
}

impl ConnectionHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// The live store, if the connection is currently open.
    pub fn store(&self) -> Option<SharedStore> {
        self.store.borrow().clone()
    }

    /// Wait until the state satisfies `predicate`. Returns `None` if the
    /// manager stopped without ever reaching such a state.
    pub async fn wait_for<F>(&self, predicate: F) -> Option<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx.wait_for(predicate).await.ok()?;
        Some(state.clone())
    }
}

/// Owns the connection lifecycle. Built once at startup, then consumed by `start`.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    store: watch::Sender<Option<SharedStore>>,
    handle: ConnectionHandle,
    opened_tx: Option<oneshot::Sender<SharedStore>>,
}

impl ConnectionManager {
    /// Build a manager and the one-shot signal fired on its first open.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> (Self, OpenedSignal) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (store, store_rx) = watch::channel(None);
        let (opened_tx, opened_rx) = oneshot::channel();
        let manager = Self {
            connector,
            settings,
            state,
            store,
            handle: ConnectionHandle {
                state: state_rx,
                store: store_rx,
            },
            opened_tx: Some(opened_tx),
        };
        (manager, OpenedSignal(opened_rx))
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Spawn the supervision loop and return immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.supervise())
    }

    async fn supervise(mut self) {
        let target = self.connector.describe();
        loop {
            let Some(store) = self.connect_with_retry(&target).await else {
                return;
            };

            self.store.send_replace(Some(Arc::clone(&store)));
            self.state.send_replace(ConnectionState::Open);
            match self.opened_tx.take() {
                Some(tx) => {
                    tracing::info!(store = %target, "store connection open");
                    let _ = tx.send(Arc::clone(&store));
                }
                None => tracing::info!(store = %target, "store connection re-established"),
            }

            self.watch_health(&store).await;

            self.store.send_replace(None);
            self.state.send_replace(ConnectionState::Disconnected);
            tracing::warn!(store = %target, "store disconnected; reconnecting");
        }
    }

    /// Attempt until success, a terminal error, or the attempt cap.
    async fn connect_with_retry(&self, target: &str) -> Option<SharedStore> {
        let policy = &self.settings.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting { attempt });
            tracing::debug!(store = %target, attempt, "connecting to store");

            let err = match tokio::time::timeout(
                self.settings.connect_timeout,
                self.connector.connect(),
            )
            .await
            {
                Ok(Ok(store)) => return Some(store),
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout(self.settings.connect_timeout),
            };

            if !err.is_retryable() {
                tracing::error!(
                    store = %target,
                    attempt,
                    error = %err,
                    "store connection failed permanently; not retrying"
                );
                self.state.send_replace(ConnectionState::Errored {
                    retryable: false,
                    message: err.to_string(),
                });
                return None;
            }

            if !policy.allows_retry(attempt) {
                tracing::error!(
                    store = %target,
                    attempt,
                    error = %err,
                    "store connection failed; retry limit reached"
                );
                self.state.send_replace(ConnectionState::Errored {
                    retryable: false,
                    message: format!("gave up after {} attempts: {}", attempt, err),
                });
                return None;
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(
                store = %target,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "store connection failed (will retry)"
            );
            self.state.send_replace(ConnectionState::Errored {
                retryable: true,
                message: err.to_string(),
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// Probe the open store until a probe fails or times out.
    async fn watch_health(&self, store: &SharedStore) {
        let mut ticker =
            tokio::time::interval(self.settings.health_interval.max(MIN_HEALTH_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match tokio::time::timeout(self.settings.io_timeout, store.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "store health probe failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.settings.io_timeout.as_millis() as u64,
                        "store health probe timed out"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tally_core::{ApiKeyRecord, UserAccount};

    use crate::store::{CredentialStore, InsertOutcome};

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(200),
            io_timeout: Duration::from_millis(200),
            health_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
        }
    }

    /// Fails with `error()` for the first `failures` attempts, then hands out `store`.
    struct ScriptedConnector {
        failures: u32,
        error: fn() -> StoreError,
        attempts: AtomicU32,
        store: SharedStore,
    }

    impl ScriptedConnector {
        fn new(failures: u32, error: fn() -> StoreError, store: SharedStore) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                attempts: AtomicU32::new(0),
                store,
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn connect(&self) -> Result<SharedStore, StoreError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err((self.error)())
            } else {
                Ok(Arc::clone(&self.store))
            }
        }
    }

    /// Never finishes connecting.
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        fn describe(&self) -> String {
            "hanging".to_string()
        }

        async fn connect(&self) -> Result<SharedStore, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Unreachable("unreachable".into()))
        }
    }

    /// A store whose health probe can be switched off. Nothing else is used.
    #[derive(Debug, Default)]
    struct ProbeStore {
        unhealthy: AtomicBool,
    }

    #[async_trait]
    impl CredentialStore for ProbeStore {
        async fn ping(&self) -> Result<(), StoreError> {
            if self.unhealthy.load(Ordering::SeqCst) {
                Err(StoreError::Unreachable("probe failed".into()))
            } else {
                Ok(())
            }
        }
        async fn find_api_key_by_hash(&self, _: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
            Ok(None)
        }
        async fn insert_api_key(
            &self,
            r: ApiKeyRecord,
        ) -> Result<InsertOutcome<ApiKeyRecord>, StoreError> {
            Ok(InsertOutcome::Created(r))
        }
        async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete_api_key(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn find_admin(&self) -> Result<Option<UserAccount>, StoreError> {
            Ok(None)
        }
        async fn insert_admin_if_absent(
            &self,
            a: UserAccount,
        ) -> Result<InsertOutcome<UserAccount>, StoreError> {
            Ok(InsertOutcome::Created(a))
        }
        async fn insert_user(&self, a: UserAccount) -> Result<UserAccount, StoreError> {
            Ok(a)
        }
        async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn unreachable() -> StoreError {
        StoreError::Unreachable("connection refused".into())
    }

    fn unsupported() -> StoreError {
        StoreError::UnsupportedUri("mongodb://x".into())
    }

    #[test]
    fn default_policy_is_fixed_five_seconds_forever() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(50), Duration::from_secs(5));
        assert!(policy.allows_retry(u32::MAX - 1));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1000));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn jitter_only_shortens_delay() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for attempt in 1..20 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_secs(5));
            assert!(delay >= Duration::from_millis(2500));
        }
    }

    #[tokio::test]
    async fn retries_until_store_opens() {
        let store: SharedStore = Arc::new(ProbeStore::default());
        let connector = ScriptedConnector::new(2, unreachable, store);
        let (manager, opened) = ConnectionManager::new(connector.clone(), fast_settings());
        let handle = manager.handle();
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        let _task = manager.start();
        let store = tokio::time::timeout(Duration::from_secs(5), opened.opened())
            .await
            .expect("store should open")
            .expect("signal should carry the store");

        store.ping().await.unwrap();
        assert_eq!(connector.attempts(), 3);
        let state = handle.wait_for(ConnectionState::is_open).await.unwrap();
        assert!(state.is_open());
        assert!(handle.store().is_some());
    }

    #[tokio::test]
    async fn terminal_error_stops_retrying() {
        let store: SharedStore = Arc::new(ProbeStore::default());
        let connector = ScriptedConnector::new(u32::MAX, unsupported, store);
        let (manager, opened) = ConnectionManager::new(connector.clone(), fast_settings());
        let handle = manager.handle();

        manager.start().await.unwrap();

        assert!(opened.opened().await.is_none());
        assert_eq!(connector.attempts(), 1);
        match handle.state() {
            ConnectionState::Errored { retryable, message } => {
                assert!(!retryable);
                assert!(message.contains("unsupported"), "message: {}", message);
            }
            other => panic!("expected errored state, got {:?}", other),
        }
        assert!(handle.store().is_none());
    }

    #[tokio::test]
    async fn attempt_cap_gives_up() {
        let mut settings = fast_settings();
        settings.retry.max_attempts = Some(3);
        let store: SharedStore = Arc::new(ProbeStore::default());
        let connector = ScriptedConnector::new(u32::MAX, unreachable, store);
        let (manager, _opened) = ConnectionManager::new(connector.clone(), settings);
        let handle = manager.handle();

        manager.start().await.unwrap();

        assert_eq!(connector.attempts(), 3);
        assert!(matches!(
            handle.state(),
            ConnectionState::Errored { retryable: false, .. }
        ));
    }

    #[tokio::test]
    async fn slow_attempt_times_out_and_is_retried() {
        let mut settings = fast_settings();
        settings.connect_timeout = Duration::from_millis(20);
        settings.retry.max_attempts = Some(2);
        let (manager, _opened) = ConnectionManager::new(Arc::new(HangingConnector), settings);
        let handle = manager.handle();

        tokio::time::timeout(Duration::from_secs(5), manager.start())
            .await
            .expect("timeouts should bound every attempt")
            .unwrap();

        match handle.state() {
            ConnectionState::Errored { message, .. } => {
                assert!(message.contains("timed out"), "message: {}", message)
            }
            other => panic!("expected errored state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_probe_reconnects_without_second_open_signal() {
        let mut settings = fast_settings();
        settings.health_interval = Duration::from_millis(10);
        let probe = Arc::new(ProbeStore::default());
        let store: SharedStore = probe.clone();
        let connector = ScriptedConnector::new(0, unreachable, store);
        let (manager, opened) = ConnectionManager::new(connector.clone(), settings);
        let handle = manager.handle();
        let _task = manager.start();

        opened.opened().await.expect("first open");
        assert_eq!(connector.attempts(), 1);

        probe.unhealthy.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while connector.attempts() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "manager never reconnected");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        probe.unhealthy.store(false, Ordering::SeqCst);

        let state = handle.wait_for(ConnectionState::is_open).await.unwrap();
        assert!(state.is_open());
    }

    #[tokio::test]
    async fn zero_health_interval_keeps_supervising() {
        let mut settings = fast_settings();
        settings.health_interval = Duration::ZERO;
        let store: SharedStore = Arc::new(ProbeStore::default());
        let connector = ScriptedConnector::new(0, unreachable, store);
        let (manager, opened) = ConnectionManager::new(connector, settings);
        let handle = manager.handle();
        let task = manager.start();

        opened.opened().await.expect("first open");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished(), "supervisor should still be running");
        assert_eq!(handle.state(), ConnectionState::Open);
        task.abort();
    }

    #[tokio::test]
    async fn sqlite_connector_opens_memory_store() {
        let connector = SqliteConnector::new("sqlite::memory:", Duration::from_secs(1));
        assert_eq!(connector.describe(), "sqlite::memory:");
        let store = connector.connect().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_connector_rejects_foreign_scheme() {
        let connector = SqliteConnector::new("mongodb://localhost/tally", Duration::from_secs(1));
        let err = connector.connect().await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
