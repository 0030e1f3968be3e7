//! Eviction of cached values from the consolidated view.
//!
//! Values of checkpointed versions can always be reloaded from their file,
//! so when resident value bytes exceed the configured budget the sweeper
//! drops them using a second-chance clock: a version read since the last
//! pass has its use bit cleared instead of being evicted. The clock hand
//! persists across sweeps, so bounded passes still cover the whole map.

use std::sync::Weak;
use std::time::Duration;

use arc_swap::ArcSwap;
use mvstore_constants::sweep::MAX_SWEEP_ITEMS_PER_PASS;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::consolidation::ConsolidationManager;

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub resident_before: u64,
    pub inspected: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
}

/// Runs sweeps on demand or on a background interval.
#[derive(Debug)]
pub struct SweepManager {
    enabled: bool,
    threshold_bytes: u64,
    interval: Duration,
    /// Position in key order where the next pass resumes.
    hand: Mutex<usize>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SweepManager {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            enabled: config.enable_sweep && config.durable,
            threshold_bytes: config.sweep_threshold_bytes,
            interval: config.sweep_interval,
            hand: Mutex::new(0),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    /// Evict until resident value bytes fall to the threshold.
    pub fn sweep<K: Ord + Clone, V>(&self, manager: &ConsolidationManager<K, V>) -> SweepStats {
        let mut stats = SweepStats {
            resident_before: manager.resident_bytes(),
            ..SweepStats::default()
        };
        let mut resident = stats.resident_before;
        if resident <= self.threshold_bytes {
            return stats;
        }

        let map = manager.consolidated();
        let len = map.len();
        if len == 0 {
            return stats;
        }
        let per_pass = len.min(MAX_SWEEP_ITEMS_PER_PASS);
        let mut hand = self.hand.lock();
        // Two passes: the first clears use bits it finds set, the second
        // evicts whatever was not touched in between.
        'passes: for _ in 0..2 {
            let start = *hand % len;
            for item in map.values().skip(start).chain(map.values().take(start)).take(per_pass) {
                if resident <= self.threshold_bytes {
                    break 'passes;
                }
                *hand = (*hand % len) + 1;
                if !item.has_value() {
                    continue;
                }
                stats.inspected += 1;
                if item.take_in_use() {
                    continue;
                }
                let freed = item.evict_value();
                if freed > 0 {
                    stats.evicted += 1;
                    stats.bytes_freed += freed;
                    resident = resident.saturating_sub(freed);
                }
            }
        }
        drop(hand);

        tracing::debug!(
            resident_before = stats.resident_before,
            evicted = stats.evicted,
            bytes_freed = stats.bytes_freed,
            threshold = self.threshold_bytes,
            "sweep completed"
        );
        stats
    }

    /// Start the background loop over whichever consolidation manager is
    /// current. Stops when the owner drops or [`SweepManager::stop`] runs.
    pub fn start<K, V>(self: &std::sync::Arc<Self>, source: Weak<ArcSwap<ConsolidationManager<K, V>>>)
    where
        K: Ord + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        if !self.enabled {
            return;
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let sweeper = std::sync::Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let (Some(sweeper), Some(source)) = (sweeper.upgrade(), source.upgrade()) else {
                    break;
                };
                let manager = source.load_full();
                sweeper.sweep(&manager);
            }
            tracing::debug!("sweep task stopped");
        }));
    }

    /// Stop the background loop and wait for it.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sweep task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::item::ValueLocator;
    use crate::item::VersionedItem;

    fn checkpointed(lsn: i64) -> Arc<VersionedItem<u64>> {
        let item = VersionedItem::inserted(lsn, Arc::new(lsn as u64), 100);
        item.set_locator(ValueLocator {
            file_id: 1,
            offset: 0,
            len: 100,
        });
        Arc::new(item)
    }

    fn sweeper(threshold_bytes: u64) -> SweepManager {
        let config = StoreConfig {
            sweep_threshold_bytes: threshold_bytes,
            ..StoreConfig::default()
        }
        .finalize();
        SweepManager::new(&config)
    }

    #[test]
    fn test_sweep_below_threshold_is_noop() {
        let map: BTreeMap<u32, _> = (0..3).map(|i| (i, checkpointed(i64::from(i)))).collect();
        let manager = ConsolidationManager::from_consolidated(map);
        let stats = sweeper(1_000).sweep(&manager);
        assert_eq!(stats.resident_before, 300);
        assert_eq!(stats.evicted, 0);
    }

    #[test]
    fn test_sweep_evicts_down_to_threshold_with_second_chance() {
        let map: BTreeMap<u32, _> = (0..10).map(|i| (i, checkpointed(i64::from(i)))).collect();
        let manager = ConsolidationManager::from_consolidated(map);
        let stats = sweeper(500).sweep(&manager);
        assert_eq!(stats.evicted, 5);
        assert_eq!(stats.bytes_freed, 500);
        assert_eq!(manager.resident_bytes(), 500);
    }

    #[test]
    fn test_sweep_resumes_past_pass_bound() {
        let total = MAX_SWEEP_ITEMS_PER_PASS + MAX_SWEEP_ITEMS_PER_PASS / 2;
        let map: BTreeMap<u32, _> = (0..total as u32).map(|i| (i, checkpointed(i64::from(i)))).collect();
        let manager = ConsolidationManager::from_consolidated(map);
        let sweeper = sweeper(0);

        let first = sweeper.sweep(&manager);
        assert!(first.evicted > 0);
        assert!(manager.resident_bytes() > 0);

        for _ in 0..2 {
            sweeper.sweep(&manager);
        }
        assert_eq!(manager.resident_bytes(), 0);
        let last = manager.consolidated().values().last().map(|item| item.has_value());
        assert_eq!(last, Some(false));
    }

    #[test]
    fn test_sweep_skips_items_without_locator() {
        let map: BTreeMap<u32, _> = (0..4)
            .map(|i| (i, Arc::new(VersionedItem::inserted(i64::from(i), Arc::new(0u64), 100))))
            .collect();
        let manager = ConsolidationManager::from_consolidated(map);
        let stats = sweeper(0).sweep(&manager);
        assert_eq!(stats.evicted, 0);
        assert_eq!(manager.resident_bytes(), 400);
    }

    #[test]
    fn test_volatile_config_disables_sweep() {
        let manager = SweepManager::new(&StoreConfig::volatile().finalize());
        assert!(!manager.is_enabled());
    }

    #[tokio::test]
    async fn test_background_sweep_runs_and_stops() {
        let config = StoreConfig {
            sweep_threshold_bytes: 0,
            sweep_interval_ms: 5,
            ..StoreConfig::default()
        }
        .finalize();
        let sweeper = Arc::new(SweepManager::new(&config));
        let map: BTreeMap<u32, _> = (0..2).map(|i| (i, checkpointed(i64::from(i)))).collect();
        let source = Arc::new(ArcSwap::from_pointee(ConsolidationManager::from_consolidated(map)));

        sweeper.start(Arc::downgrade(&source));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweeper.stop().await;

        assert_eq!(source.load().resident_bytes(), 0);
    }
}
