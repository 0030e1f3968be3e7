//! Shared fixtures for store integration tests.
//!
//! A [`Node`] is one store driven by its own [`LoopbackReplicator`]. The
//! helpers run each operation in a single-operation transaction and commit
//! it, so tests read like a sequence of client calls.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mvstore::testing::LoopbackReplicator;
use mvstore::IsolationLevel;
use mvstore::OperationContext;
use mvstore::ReadMode;
use mvstore::RebuiltEntry;
use mvstore::Result;
use mvstore::Store;
use mvstore::StoreChangeHandler;
use mvstore::StoreConfig;
use mvstore::TransactionHandle;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Generous timeout for operations that are not expected to wait.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for operations that are expected to block.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(50);

pub type TestStore = Store<String, u64>;

/// Route engine logs to the test writer; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Durable config with consolidation run inline, so checkpoint effects are
/// visible as soon as perform returns.
pub fn durable_config() -> StoreConfig {
    StoreConfig {
        enable_background_consolidation: false,
        enable_sweep: false,
        ..StoreConfig::durable()
    }
}

pub fn volatile_config() -> StoreConfig {
    StoreConfig {
        enable_background_consolidation: false,
        ..StoreConfig::volatile()
    }
}

/// One store and the replicator driving it.
pub struct Node {
    pub store: Arc<TestStore>,
    pub replicator: Arc<LoopbackReplicator>,
    next_txn: AtomicU64,
}

impl Node {
    /// Open a store at `dir` and recover whatever state it holds.
    pub async fn open(dir: &Path, config: StoreConfig, replicator: Arc<LoopbackReplicator>) -> Node {
        let node = Node::open_empty(dir, config, replicator).await;
        node.store.recover_checkpoint().await.unwrap();
        node
    }

    /// Open a store without loading state, as a copy or restore target.
    pub async fn open_empty(dir: &Path, config: StoreConfig, replicator: Arc<LoopbackReplicator>) -> Node {
        init_tracing();
        let store = Store::new("test-store", dir, config, replicator.clone());
        store.open().await.unwrap();
        Node {
            store,
            replicator,
            next_txn: AtomicU64::new(1),
        }
    }

    pub fn begin(&self) -> TransactionHandle {
        TransactionHandle::new(self.next_txn.fetch_add(1, Ordering::Relaxed))
    }

    pub fn begin_snapshot(&self) -> TransactionHandle {
        self.begin().with_isolation(IsolationLevel::Snapshot)
    }

    pub fn finish(&self, txn: &TransactionHandle) {
        self.store.unlock(OperationContext {
            transaction_id: txn.id(),
        });
    }

    /// Add and commit; returns the sequence number of the add.
    pub async fn add(&self, key: &str, value: u64) -> i64 {
        let txn = self.begin();
        self.store
            .add(&txn, key.to_string(), value, TEST_TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        self.replicator.commit(&self.store, &txn).await.unwrap()
    }

    pub async fn update(&self, key: &str, value: u64, version: Option<i64>) -> bool {
        let txn = self.begin();
        let updated = self
            .store
            .conditional_update(&txn, &key.to_string(), value, TEST_TIMEOUT, version, &CancellationToken::new())
            .await
            .unwrap();
        self.replicator.commit(&self.store, &txn).await.unwrap();
        updated
    }

    pub async fn remove(&self, key: &str, version: Option<i64>) -> bool {
        let txn = self.begin();
        let removed = self
            .store
            .conditional_remove(&txn, &key.to_string(), TEST_TIMEOUT, version, &CancellationToken::new())
            .await
            .unwrap();
        self.replicator.commit(&self.store, &txn).await.unwrap();
        removed
    }

    /// Committed `(version, value)` of `key`.
    pub async fn get(&self, key: &str) -> Option<(i64, u64)> {
        let txn = self.begin();
        let value = self
            .store
            .conditional_get(&txn, &key.to_string(), TEST_TIMEOUT, ReadMode::CacheResult, &CancellationToken::new())
            .await
            .unwrap();
        self.finish(&txn);
        value.map(|value| (value.version, value.value))
    }

    /// Every live `(key, version, value)` in key order.
    pub async fn entries(&self) -> Vec<(String, i64, u64)> {
        let txn = self.begin();
        let mut entries = Vec::new();
        {
            let mut enumerator = self.store.create_enumerator(&txn, ..).unwrap();
            while let Some(entry) = enumerator.next().await.unwrap() {
                entries.push(entry);
            }
        }
        self.finish(&txn);
        entries
    }

    /// Prepare, perform, and complete a checkpoint at the last committed
    /// sequence number.
    pub async fn checkpoint(&self) -> i64 {
        let lsn = self.replicator.last_committed_lsn();
        self.store.prepare_checkpoint(lsn).unwrap();
        self.store.perform_checkpoint().await.unwrap();
        self.store.complete_checkpoint().await.unwrap();
        lsn
    }
}

/// Stream `source`'s state into `target` through the copy protocol.
pub async fn copy_state(source: &TestStore, target: &TestStore) -> Result<()> {
    let mut stream = source.get_current_state().await?;
    target.begin_setting_current_state().await?;
    while let Some(chunk) = stream.next_chunk().await? {
        target.set_current_state(&chunk).await?;
    }
    target.end_setting_current_state().await
}

/// Number of key checkpoint files directly under `dir`.
pub fn key_file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_name().to_string_lossy().ends_with(".sptr"))
                .count()
        })
        .unwrap_or(0)
}

/// Change handler that records each event as a line of text.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    /// Events recorded since the last call.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }
}

#[async_trait]
impl StoreChangeHandler<String, u64> for RecordingHandler {
    async fn on_added(&self, _txn: &TransactionHandle, key: &String, value: &u64, lsn: i64, is_primary: bool) {
        self.events.lock().push(format!("added {key}={value}@{lsn} primary={is_primary}"));
    }

    async fn on_updated(&self, _txn: &TransactionHandle, key: &String, value: &u64, lsn: i64, is_primary: bool) {
        self.events.lock().push(format!("updated {key}={value}@{lsn} primary={is_primary}"));
    }

    async fn on_removed(&self, _txn: &TransactionHandle, key: &String, lsn: i64, is_primary: bool) {
        self.events.lock().push(format!("removed {key}@{lsn} primary={is_primary}"));
    }

    async fn on_rebuilt(&self, state: Vec<RebuiltEntry<String, u64>>) {
        let keys: Vec<String> = state.into_iter().map(|entry| format!("{}={}", entry.key, entry.value)).collect();
        self.events.lock().push(format!("rebuilt [{}]", keys.join(",")));
    }
}

/// Collects formatted engine logs so tests can assert on them.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route logs on this thread here until the guard drops. Needs a
    /// current-thread runtime.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
