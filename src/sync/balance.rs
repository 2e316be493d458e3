//! Balance synchronizer.
//!
//! The remote balance path is the single source of truth. The engine's view
//! of it is a `watch` cache that is strictly a read replica: it is refreshed
//! from the subscription or from the value a committed transaction returned,
//! and never written in response to a local event alone. A device that lost
//! all local state calls [`BalanceSynchronizer::resync`] and recovers the
//! exact remote value. The cache starts as `None` ("unknown"), so nothing
//! can ever observe, or persist, a fabricated zero.
//!
//! Listener discipline: one subscription per balance path per process.
//! [`BalanceSynchronizer::start`] hands out `watch::Receiver` clones for
//! fan-out; a second `start` returns the existing receiver instead of
//! opening another store listener. Multiple independent listeners were the
//! documented root cause of duplicate-apply bugs in the ancestor of this
//! engine, so there is deliberately no API that creates one.

use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sync::domain::identity::{balance_path, ledger_path, CoupleKey};
use crate::sync::domain::model::RewardLedgerEntry;
use crate::sync::error::SyncError;
use crate::sync::remote::api::{Predicate, RemoteStore, WriteOutcome};

/// Result of [`BalanceSynchronizer::apply_reward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardOutcome {
    /// Our claim won; the balance now holds the returned value.
    Applied(i64),
    /// The peer applied this reward first. Successful no-op.
    AlreadyApplied,
}

pub struct BalanceSynchronizer<S> {
    store: S,
    couple: CoupleKey,
    path: String,
    cache: watch::Sender<Option<i64>>,
    sub_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: RemoteStore + Clone + Send + Sync + 'static> BalanceSynchronizer<S> {
    pub fn new(store: S, couple: CoupleKey) -> Self {
        let path = balance_path(&couple);
        let (cache, _) = watch::channel(None);
        Self {
            store,
            couple,
            path,
            cache,
            sub_task: Mutex::new(None),
        }
    }

    /// A read-replica view of the balance. `None` until the first
    /// successful remote read.
    pub fn observe(&self) -> watch::Receiver<Option<i64>> {
        self.cache.subscribe()
    }

    pub fn cached(&self) -> Option<i64> {
        *self.cache.borrow()
    }

    /// Refreshes the cache from the remote value and returns it. An absent
    /// path means no reward was ever applied, which is authoritatively zero.
    pub async fn resync(&self) -> Result<i64, SyncError> {
        let value = self.store.get(&self.path).await?;
        let balance = value.as_ref().and_then(serde_json::Value::as_i64).unwrap_or(0);
        self.cache.send_replace(Some(balance));
        log::debug!("[BALANCE] resynced {} = {balance}", self.path);
        Ok(balance)
    }

    /// Starts the singleton subscription and primes the cache.
    ///
    /// Idempotent: if the subscription is already running, no second store
    /// listener is opened and the existing receiver is returned.
    pub async fn start(&self) -> Result<watch::Receiver<Option<i64>>, SyncError> {
        {
            let mut guard = self.sub_task.lock().unwrap();
            if guard.is_none() {
                let mut sub = self.store.subscribe(&self.path)?;
                let cache = self.cache.clone();
                *guard = Some(tokio::spawn(async move {
                    while let Some(notice) = sub.recv().await {
                        if let Some(v) = notice.value.as_ref().and_then(serde_json::Value::as_i64) {
                            cache.send_replace(Some(v));
                        }
                    }
                }));
                log::info!("[BALANCE] subscription started for {}", self.path);
            }
        }
        // Prime after subscribing so no committed increment can fall in the
        // gap between the read and the first notification.
        self.resync().await?;
        Ok(self.observe())
    }

    /// Stops the subscription (app going to background). The cache keeps
    /// its last value; it is re-primed on the next `start`.
    pub fn stop(&self) {
        if let Some(task) = self.sub_task.lock().unwrap().take() {
            task.abort();
            log::info!("[BALANCE] subscription stopped for {}", self.path);
        }
    }

    /// Conditionally creates the ledger entry for `entry.idempotency_key`.
    /// Returns whether our write committed (we "won" the reward claim).
    pub async fn claim(&self, entry: &RewardLedgerEntry) -> Result<bool, SyncError> {
        let path = ledger_path(&self.couple, &entry.idempotency_key);
        let value = serde_json::to_value(entry)
            .map_err(|e| SyncError::ValidationFailed(e.to_string()))?;
        let outcome = self.store.conditional_set(&path, value, Predicate::Absent).await?;
        Ok(outcome == WriteOutcome::Committed)
    }

    /// Atomically credits the balance and refreshes the cache from the
    /// value the transaction committed (not from any local guess).
    pub async fn credit(&self, amount: i64) -> Result<i64, SyncError> {
        let new_balance = self.store.transaction_increment(&self.path, amount).await?;
        self.cache.send_replace(Some(new_balance));
        log::info!("[BALANCE] credited {amount}, balance now {new_balance}");
        Ok(new_balance)
    }

    /// `increment(coupleKey, amount, idempotencyKey)` from the public
    /// contract: claim-then-credit, exactly once per idempotency key no
    /// matter how many devices call it concurrently.
    pub async fn apply_reward(&self, entry: &RewardLedgerEntry) -> Result<RewardOutcome, SyncError> {
        if self.claim(entry).await? {
            Ok(RewardOutcome::Applied(self.credit(entry.amount).await?))
        } else {
            Ok(RewardOutcome::AlreadyApplied)
        }
    }
}

impl<S> Drop for BalanceSynchronizer<S> {
    fn drop(&mut self) {
        if let Some(task) = self.sub_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::domain::identity::ParticipantId;
    use crate::sync::domain::model::ItemId;
    use crate::sync::remote::MemoryStore;
    use chrono::Utc;

    fn couple() -> CoupleKey {
        CoupleKey::derive(
            &ParticipantId::new("alice").unwrap(),
            &ParticipantId::new("bob").unwrap(),
        )
        .unwrap()
    }

    fn entry(item: &str) -> RewardLedgerEntry {
        RewardLedgerEntry::for_item(couple(), &ItemId::new(item), 10, Utc::now())
    }

    #[tokio::test]
    async fn cache_is_unknown_until_first_remote_read() {
        let sync = BalanceSynchronizer::new(MemoryStore::new(), couple());
        assert_eq!(sync.cached(), None);
        assert_eq!(sync.resync().await.unwrap(), 0);
        assert_eq!(sync.cached(), Some(0));
    }

    #[tokio::test]
    async fn wiped_device_recovers_exact_remote_balance() {
        let store = MemoryStore::new();
        {
            let sync = BalanceSynchronizer::new(store.clone(), couple());
            sync.credit(500).await.unwrap();
        }
        // Fresh process, no local state.
        let sync = BalanceSynchronizer::new(store.clone(), couple());
        assert_eq!(sync.resync().await.unwrap(), 500);
        // At no point was a zero written remotely.
        assert_eq!(
            store.get(&balance_path(&couple())).await.unwrap().unwrap(),
            serde_json::json!(500)
        );
    }

    #[tokio::test]
    async fn concurrent_apply_reward_is_exactly_once() {
        let store = MemoryStore::new();
        let a = BalanceSynchronizer::new(store.clone(), couple());
        let b = BalanceSynchronizer::new(store.clone(), couple());

        let ea = entry("q1");
        let eb = entry("q1");
        let (ra, rb) = tokio::join!(a.apply_reward(&ea), b.apply_reward(&eb));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        let applied = [ra, rb]
            .iter()
            .filter(|o| matches!(o, RewardOutcome::Applied(_)))
            .count();
        assert_eq!(applied, 1, "exactly one device credits: {ra:?} / {rb:?}");
        assert_eq!(a.resync().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn second_start_reuses_the_singleton_subscription() {
        let store = MemoryStore::new();
        let sync = BalanceSynchronizer::new(store.clone(), couple());
        let mut rx1 = sync.start().await.unwrap();
        let _rx2 = sync.start().await.unwrap();

        // A peer device increments; our single subscription updates the cache.
        store
            .transaction_increment(&balance_path(&couple()), 25)
            .await
            .unwrap();
        rx1.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), Some(25));
    }

    #[tokio::test]
    async fn permission_denied_surfaces_not_retries() {
        let store = MemoryStore::new();
        store.deny_prefix("balance/");
        let sync = BalanceSynchronizer::new(store, couple());
        assert!(matches!(
            sync.credit(10).await,
            Err(SyncError::PermissionDenied { .. })
        ));
    }
}
