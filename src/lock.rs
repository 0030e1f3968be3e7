//! Two-level lock manager: a store-wide prime lock plus hashed per-key locks.
//!
//! The prime lock is taken Shared by every transaction for its lifetime and
//! Exclusive by close, copy, and remove. Key locks are addressed by the 64-bit
//! hash of the encoded key and support Shared, Update, and Exclusive modes
//! with per-transaction re-entry and upgrade.
//!
//! # Tiger Style
//!
//! - Every wait is bounded by a [`Deadline`] and a cancellation token
//! - `Duration::MAX` is the "wait indefinitely" timeout
//! - A closed manager rejects every acquisition with `ObjectClosed`

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::error::StoreError;

/// Timeout meaning "wait indefinitely".
pub const INFINITE_TIMEOUT: Duration = Duration::MAX;

// ============================================================================
// Deadline
// ============================================================================

/// A caller's timeout, fixed to an instant when the operation starts.
///
/// One deadline covers every wait of an operation (prime lock, key lock,
/// replication retries), so the caller's budget is never exceeded.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            timeout,
        }
    }

    pub fn infinite() -> Self {
        Self::after(INFINITE_TIMEOUT)
    }

    pub fn is_infinite(&self) -> bool {
        self.at.is_none()
    }

    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => INFINITE_TIMEOUT,
        }
    }

    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// The error reported when this deadline passes.
    pub fn timeout_error(&self) -> StoreError {
        StoreError::Timeout {
            duration_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Resolves when the deadline passes; never resolves if infinite.
    pub async fn sleep(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    }
}

// ============================================================================
// Modes
// ============================================================================

/// Key lock mode, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Update,
    Exclusive,
}

impl LockMode {
    /// Compatibility between a mode held by another transaction and a request.
    pub fn is_compatible_with(self, requested: LockMode) -> bool {
        matches!(
            (self, requested),
            (LockMode::Shared, LockMode::Shared) | (LockMode::Shared, LockMode::Update) | (LockMode::Update, LockMode::Shared)
        )
    }
}

/// Prime lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimeLockMode {
    Shared,
    Exclusive,
}

/// Held prime lock; released on drop.
#[derive(Debug)]
pub enum PrimeLockGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

impl PrimeLockGuard {
    pub fn mode(&self) -> PrimeLockMode {
        match self {
            PrimeLockGuard::Shared(_) => PrimeLockMode::Shared,
            PrimeLockGuard::Exclusive(_) => PrimeLockMode::Exclusive,
        }
    }
}

// ============================================================================
// Key lock table
// ============================================================================

#[derive(Debug, Default)]
struct KeyLockEntry {
    holders: Vec<(u64, LockMode)>,
    notify: Arc<Notify>,
}

impl KeyLockEntry {
    fn try_grant(&mut self, txn_id: u64, mode: LockMode) -> bool {
        let compatible = self
            .holders
            .iter()
            .filter(|(holder, _)| *holder != txn_id)
            .all(|(_, held)| held.is_compatible_with(mode));
        if !compatible {
            return false;
        }
        match self.holders.iter_mut().find(|(holder, _)| *holder == txn_id) {
            Some((_, held)) => {
                if mode > *held {
                    *held = mode;
                }
            }
            None => self.holders.push((txn_id, mode)),
        }
        true
    }
}

enum Attempt {
    Granted,
    Wait(Arc<Notify>),
}

/// Store-wide lock manager.
#[derive(Debug)]
pub struct LockManager {
    prime: Arc<RwLock<()>>,
    keys: Mutex<HashMap<u64, KeyLockEntry>>,
    closed: AtomicBool,
    store: String,
}

impl LockManager {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            prime: Arc::new(RwLock::new(())),
            keys: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            store: store.into(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::ObjectClosed {
                store: self.store.clone(),
            });
        }
        Ok(())
    }

    /// Acquire the prime lock.
    pub async fn acquire_prime_lock(
        &self,
        mode: PrimeLockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<PrimeLockGuard> {
        self.check_open()?;
        let prime = Arc::clone(&self.prime);
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            _ = deadline.sleep() => {
                tracing::debug!(store = %self.store, ?mode, "prime lock acquisition timed out");
                return Err(deadline.timeout_error());
            }
            guard = async move {
                match mode {
                    PrimeLockMode::Shared => PrimeLockGuard::Shared(prime.read_owned().await),
                    PrimeLockMode::Exclusive => PrimeLockGuard::Exclusive(prime.write_owned().await),
                }
            } => guard,
        };
        // Close may have completed while we waited.
        self.check_open()?;
        Ok(guard)
    }

    /// Acquire a key lock on behalf of a transaction.
    ///
    /// Re-acquiring a lock already held by the same transaction succeeds
    /// immediately; requesting a stronger mode upgrades once no other holder
    /// conflicts.
    pub async fn acquire_key_lock(
        &self,
        txn_id: u64,
        key_hash: u64,
        mode: LockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let notify = match self.try_acquire(txn_id, key_hash, mode)? {
                Attempt::Granted => return Ok(()),
                Attempt::Wait(notify) => notify,
            };

            let woken = {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                // A release may have landed between the attempt and enable().
                if let Attempt::Granted = self.try_acquire(txn_id, key_hash, mode)? {
                    return Ok(());
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(StoreError::Cancelled),
                    _ = &mut notified => Ok(()),
                    _ = deadline.sleep() => Err(deadline.timeout_error()),
                }
            };
            drop(notify);

            if let Err(err) = woken {
                self.forget_if_idle(key_hash);
                tracing::debug!(store = %self.store, txn_id, key_hash, ?mode, error = %err, "key lock wait abandoned");
                return Err(err);
            }
        }
    }

    fn try_acquire(&self, txn_id: u64, key_hash: u64, mode: LockMode) -> Result<Attempt> {
        let mut keys = self.keys.lock();
        self.check_open()?;
        let entry = keys.entry(key_hash).or_default();
        if entry.try_grant(txn_id, mode) {
            return Ok(Attempt::Granted);
        }
        Ok(Attempt::Wait(Arc::clone(&entry.notify)))
    }

    fn forget_if_idle(&self, key_hash: u64) {
        let mut keys = self.keys.lock();
        if let Some(entry) = keys.get(&key_hash) {
            if entry.holders.is_empty() && Arc::strong_count(&entry.notify) == 1 {
                keys.remove(&key_hash);
            }
        }
    }

    /// Release one key lock held by a transaction.
    pub fn release_key_lock(&self, txn_id: u64, key_hash: u64) {
        let mut keys = self.keys.lock();
        let Some(entry) = keys.get_mut(&key_hash) else {
            return;
        };
        entry.holders.retain(|(holder, _)| *holder != txn_id);
        entry.notify.notify_waiters();
        if entry.holders.is_empty() && Arc::strong_count(&entry.notify) == 1 {
            keys.remove(&key_hash);
        }
    }

    /// Release every listed key lock held by a transaction.
    pub fn release_key_locks(&self, txn_id: u64, key_hashes: &[u64]) {
        for key_hash in key_hashes {
            self.release_key_lock(txn_id, *key_hash);
        }
    }

    /// Mode held by a transaction on a key, if any.
    pub fn held_mode(&self, txn_id: u64, key_hash: u64) -> Option<LockMode> {
        let keys = self.keys.lock();
        keys.get(&key_hash)
            .and_then(|entry| entry.holders.iter().find(|(holder, _)| *holder == txn_id))
            .map(|(_, mode)| *mode)
    }

    /// Number of keys with at least one holder or waiter.
    pub fn locked_key_count(&self) -> usize {
        self.keys.lock().len()
    }

    /// Reject all future acquisitions and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let keys = self.keys.lock();
        for entry in keys.values() {
            entry.notify.notify_waiters();
        }
        tracing::debug!(store = %self.store, locked_keys = keys.len(), "lock manager closed");
    }

    /// Drop all key lock state and accept acquisitions again.
    ///
    /// Used when the store discards its state for a copy. The prime lock is
    /// untouched: its holders release it through their guards.
    pub fn reopen(&self) {
        let mut keys = self.keys.lock();
        for entry in keys.values() {
            entry.notify.notify_waiters();
        }
        keys.clear();
        self.closed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short() -> Deadline {
        Deadline::after(Duration::from_millis(50))
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(Shared.is_compatible_with(Shared));
        assert!(Shared.is_compatible_with(Update));
        assert!(Update.is_compatible_with(Shared));
        assert!(!Update.is_compatible_with(Update));
        assert!(!Shared.is_compatible_with(Exclusive));
        assert!(!Exclusive.is_compatible_with(Shared));
        assert!(!Exclusive.is_compatible_with(Exclusive));
    }

    #[test]
    fn test_deadline_infinite_never_expires() {
        let deadline = Deadline::infinite();
        assert!(deadline.is_infinite());
        assert!(!deadline.expired());
        assert_eq!(deadline.remaining(), INFINITE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_exclusive_key_lock_times_out_for_second_transaction() {
        let locks = LockManager::new("test");
        let cancel = CancellationToken::new();
        locks.acquire_key_lock(1, 42, LockMode::Exclusive, short(), &cancel).await.unwrap();

        let err = locks.acquire_key_lock(2, 42, LockMode::Exclusive, short(), &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { duration_ms: 50 }));

        // Other keys are unaffected.
        locks.acquire_key_lock(2, 43, LockMode::Exclusive, short(), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_locks_coexist_and_reentry_upgrades() {
        let locks = LockManager::new("test");
        let cancel = CancellationToken::new();
        locks.acquire_key_lock(1, 7, LockMode::Shared, short(), &cancel).await.unwrap();
        locks.acquire_key_lock(2, 7, LockMode::Shared, short(), &cancel).await.unwrap();

        // Upgrade blocked by the other shared holder.
        assert!(locks.acquire_key_lock(1, 7, LockMode::Exclusive, short(), &cancel).await.is_err());

        locks.release_key_lock(2, 7);
        locks.acquire_key_lock(1, 7, LockMode::Exclusive, short(), &cancel).await.unwrap();
        assert_eq!(locks.held_mode(1, 7), Some(LockMode::Exclusive));

        // Re-entry at a weaker mode keeps the stronger one.
        locks.acquire_key_lock(1, 7, LockMode::Shared, short(), &cancel).await.unwrap();
        assert_eq!(locks.held_mode(1, 7), Some(LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_waiter_is_granted_after_release() {
        let locks = Arc::new(LockManager::new("test"));
        let cancel = CancellationToken::new();
        locks.acquire_key_lock(1, 9, LockMode::Exclusive, short(), &cancel).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                locks
                    .acquire_key_lock(2, 9, LockMode::Exclusive, Deadline::after(Duration::from_secs(5)), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.release_key_lock(1, 9);
        waiter.await.unwrap().unwrap();
        assert_eq!(locks.held_mode(2, 9), Some(LockMode::Exclusive));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_wait() {
        let locks = LockManager::new("test");
        let cancel = CancellationToken::new();
        locks.acquire_key_lock(1, 5, LockMode::Exclusive, short(), &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let err = locks
            .acquire_key_lock(2, 5, LockMode::Shared, Deadline::infinite(), &waiter_cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_and_wakes_waiters() {
        let locks = Arc::new(LockManager::new("test"));
        let cancel = CancellationToken::new();
        locks.acquire_key_lock(1, 3, LockMode::Exclusive, short(), &cancel).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.acquire_key_lock(2, 3, LockMode::Exclusive, Deadline::infinite(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.close();

        assert!(matches!(waiter.await.unwrap(), Err(StoreError::ObjectClosed { .. })));
        assert!(matches!(
            locks.acquire_prime_lock(PrimeLockMode::Shared, short(), &cancel).await,
            Err(StoreError::ObjectClosed { .. })
        ));

        locks.reopen();
        assert_eq!(locks.locked_key_count(), 0);
        locks.acquire_key_lock(2, 3, LockMode::Exclusive, short(), &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_prime_waits_for_shared_holders() {
        let locks = LockManager::new("test");
        let cancel = CancellationToken::new();
        let shared = locks.acquire_prime_lock(PrimeLockMode::Shared, short(), &cancel).await.unwrap();
        assert_eq!(shared.mode(), PrimeLockMode::Shared);

        let err = locks.acquire_prime_lock(PrimeLockMode::Exclusive, short(), &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { .. }));

        drop(shared);
        let exclusive = locks.acquire_prime_lock(PrimeLockMode::Exclusive, short(), &cancel).await.unwrap();
        assert_eq!(exclusive.mode(), PrimeLockMode::Exclusive);
    }
}
