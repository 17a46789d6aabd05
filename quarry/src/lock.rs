use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::delegate::Delegate;
use crate::error::{Result, StoreError};

/// The two named mutual-exclusion primitives the store uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockName {
    /// Serializes every trigger-state mutation.
    TriggerAccess,
    /// Serializes cluster membership scans and recovery hand-off.
    StateAccess,
}

impl LockName {
    /// Row key used by store-backed lock implementations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TriggerAccess => "TRIGGER_ACCESS",
            Self::StateAccess => "STATE_ACCESS",
        }
    }
}

impl Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one transaction-runner invocation as a lock holder, so
/// re-entrant obtains within the same invocation are no-ops.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RequestorId(Uuid);

impl RequestorId {
    /// Fresh id for a new runner invocation.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RequestorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Named mutual exclusion across the operations of one store.
///
/// `obtain` blocks on contention and returns `true` when the lock was newly
/// taken, `false` when the requestor already held it. `release` is safe to
/// call for locks the requestor does not hold. Failing with
/// [`StoreError::LockUnavailable`] is reserved for back-end errors;
/// contention never errors.
#[async_trait]
pub trait LockManager<Tx: Send>: Send + Sync {
    async fn obtain(
        &self,
        tx: &mut Tx,
        lock: LockName,
        requestor: RequestorId,
        cancel: &CancelToken,
    ) -> Result<bool>;

    async fn release(&self, lock: LockName, requestor: RequestorId) -> Result<()>;
}

/// Process-local lock manager: one monitor per lock name.
///
/// Only valid when clustering is disabled; peers in other processes do not
/// observe these monitors.
pub struct MonitorLockManager {
    monitors: HashMap<LockName, Arc<Mutex<()>>>,
    held: Mutex<HashMap<(LockName, RequestorId), OwnedMutexGuard<()>>>,
}

impl MonitorLockManager {
    pub fn new() -> Self {
        let mut monitors = HashMap::new();
        monitors.insert(LockName::TriggerAccess, Arc::new(Mutex::new(())));
        monitors.insert(LockName::StateAccess, Arc::new(Mutex::new(())));
        Self {
            monitors,
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MonitorLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Tx: Send> LockManager<Tx> for MonitorLockManager {
    async fn obtain(
        &self,
        _tx: &mut Tx,
        lock: LockName,
        requestor: RequestorId,
        cancel: &CancelToken,
    ) -> Result<bool> {
        {
            let held = self.held.lock().await;
            if held.contains_key(&(lock, requestor)) {
                return Ok(false);
            }
        }

        let monitor = Arc::clone(
            self.monitors
                .get(&lock)
                .expect("monitor exists for every lock name"),
        );

        let guard = tokio::select! {
            guard = monitor.lock_owned() => guard,
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };

        self.held.lock().await.insert((lock, requestor), guard);
        tracing::trace!(lock = %lock, "obtained in-process lock");
        Ok(true)
    }

    async fn release(&self, lock: LockName, requestor: RequestorId) -> Result<()> {
        let removed = self.held.lock().await.remove(&(lock, requestor));
        if removed.is_none() {
            tracing::trace!(lock = %lock, "release of lock not held; ignoring");
        }
        Ok(())
    }
}

/// Store-backed lock manager: a lock row per `(scheduler_name, lock_name)`,
/// taken with a row-level write lock inside the caller's transaction.
///
/// Mandatory when clustering is enabled. The row lock is dropped by the
/// back-end when the transaction ends, so `release` only clears the
/// re-entrancy bookkeeping.
pub struct SessionLockManager<D: Delegate> {
    delegate: Arc<D>,
    held: Mutex<HashSet<(LockName, RequestorId)>>,
}

impl<D: Delegate> SessionLockManager<D> {
    pub fn new(delegate: Arc<D>) -> Self {
        Self {
            delegate,
            held: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl<D: Delegate> LockManager<D::Tx> for SessionLockManager<D> {
    async fn obtain(
        &self,
        tx: &mut D::Tx,
        lock: LockName,
        requestor: RequestorId,
        cancel: &CancelToken,
    ) -> Result<bool> {
        cancel.check()?;
        {
            let held = self.held.lock().await;
            if held.contains(&(lock, requestor)) {
                return Ok(false);
            }
        }

        self.delegate
            .lock_row(tx, lock)
            .await
            .map_err(|err| match err {
                StoreError::Cancelled => StoreError::Cancelled,
                other => StoreError::LockUnavailable {
                    lock: lock.as_str().to_string(),
                    source: anyhow::Error::new(other),
                },
            })?;

        self.held.lock().await.insert((lock, requestor));
        tracing::trace!(lock = %lock, "obtained store-backed lock");
        Ok(true)
    }

    async fn release(&self, lock: LockName, requestor: RequestorId) -> Result<()> {
        self.held.lock().await.remove(&(lock, requestor));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    type UnitTx = ();

    #[tokio::test]
    async fn monitor_lock_is_reentrant_per_requestor() {
        let locks = MonitorLockManager::new();
        let requestor = RequestorId::new();
        let cancel = CancelToken::new();
        let mut tx: UnitTx = ();

        let first = locks
            .obtain(&mut tx, LockName::TriggerAccess, requestor, &cancel)
            .await
            .unwrap();
        let second = locks
            .obtain(&mut tx, LockName::TriggerAccess, requestor, &cancel)
            .await
            .unwrap();

        assert!(first);
        assert!(!second, "re-entrant obtain reports already-held");

        LockManager::<UnitTx>::release(&locks, LockName::TriggerAccess, requestor)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn monitor_lock_blocks_second_requestor() {
        let locks = Arc::new(MonitorLockManager::new());
        let cancel = CancelToken::new();
        let holder = RequestorId::new();
        let waiter = RequestorId::new();
        let mut tx: UnitTx = ();

        locks
            .obtain(&mut tx, LockName::TriggerAccess, holder, &cancel)
            .await
            .unwrap();

        let contender = Arc::clone(&locks);
        let contender_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tx: UnitTx = ();
            contender
                .obtain(&mut tx, LockName::TriggerAccess, waiter, &contender_cancel)
                .await
        });

        // contender must still be parked while the holder keeps the lock
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        LockManager::<UnitTx>::release(locks.as_ref(), LockName::TriggerAccess, holder)
            .await
            .unwrap();

        let obtained = timeout(Duration::from_secs(1), handle)
            .await
            .expect("contender did not get the lock after release")
            .unwrap()
            .unwrap();
        assert!(obtained);

        LockManager::<UnitTx>::release(locks.as_ref(), LockName::TriggerAccess, waiter)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_obtain_fails_with_cancelled() {
        let locks = MonitorLockManager::new();
        let cancel = CancelToken::new();
        let holder = RequestorId::new();
        let waiter = RequestorId::new();
        let mut tx: UnitTx = ();

        locks
            .obtain(&mut tx, LockName::TriggerAccess, holder, &cancel)
            .await
            .unwrap();

        cancel.cancel();
        let result = locks
            .obtain(&mut tx, LockName::TriggerAccess, waiter, &cancel)
            .await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn distinct_lock_names_do_not_contend() {
        let locks = MonitorLockManager::new();
        let cancel = CancelToken::new();
        let a = RequestorId::new();
        let b = RequestorId::new();
        let mut tx: UnitTx = ();

        assert!(locks
            .obtain(&mut tx, LockName::StateAccess, a, &cancel)
            .await
            .unwrap());
        assert!(locks
            .obtain(&mut tx, LockName::TriggerAccess, b, &cancel)
            .await
            .unwrap());
    }
}
