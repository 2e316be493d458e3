//! Retention sweep.
//!
//! Periodically removes content sets past the retention horizon together
//! with their completion records and superseded ledger entries. One
//! invariant is absolute: an item that is fully completed but whose reward
//! ledger entry does not exist yet is **never** deleted; hitting that
//! combination aborts the deletion of its whole set and logs an error,
//! because it means a reward is still owed.

use std::time::Duration;

use chrono::NaiveDate;

use crate::sync::domain::identity::{
    completion_prefix, ledger_path, quest_prefix, ContentSetKey, CoupleKey,
};
use crate::sync::domain::model::{ItemId, RewardLedgerEntry};
use crate::sync::error::SyncError;
use crate::sync::remote::api::RemoteStore;

/// Days a daily set stays around after its calendar date.
pub const DEFAULT_HORIZON_DAYS: i64 = 14;

/// How often the periodic sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_sets: usize,
    /// Sets past the horizon that were kept because a reward is still owed.
    pub retained_sets: usize,
    pub removed_ledger_entries: usize,
}

pub struct RetentionSweep<S> {
    store: S,
    couple: CoupleKey,
    horizon_days: i64,
}

impl<S: RemoteStore + Clone + Send + Sync + 'static> RetentionSweep<S> {
    pub fn new(store: S, couple: CoupleKey) -> Self {
        Self {
            store,
            couple,
            horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }

    pub fn with_horizon_days(mut self, days: i64) -> Self {
        self.horizon_days = days;
        self
    }

    /// One pass over the couple's sets as of `today`.
    pub async fn run_once(&self, today: NaiveDate) -> Result<SweepReport, SyncError> {
        let mut report = SweepReport::default();

        for path in self.store.list(&quest_prefix(&self.couple)).await? {
            let Some(date) = parse_set_date(&path) else {
                log::warn!("[SWEEP] unparseable set path {path}, skipping");
                continue;
            };
            if (today - date).num_days() <= self.horizon_days {
                continue;
            }

            let key = ContentSetKey::new(self.couple.clone(), date);
            if self.reward_still_owed(&key).await? {
                log::error!(
                    "[SWEEP] {key} is past the horizon but a reward is unapplied; refusing to delete"
                );
                report.retained_sets += 1;
                continue;
            }

            report.removed_ledger_entries += self.remove_day(&key, &path).await?;
            report.removed_sets += 1;
            log::info!("[SWEEP] removed expired set {key}");
        }

        Ok(report)
    }

    /// True if any item of the set is fully completed without a ledger
    /// entry. Deleting it would erase the only evidence a reward is due.
    async fn reward_still_owed(&self, key: &ContentSetKey) -> Result<bool, SyncError> {
        let slots = self.store.list(&completion_prefix(key)).await?;
        for item_id in item_ids_of(&completion_prefix(key), &slots) {
            let both_done = slots
                .iter()
                .filter(|p| p.starts_with(&format!("{}/{}/", completion_prefix(key), item_id)))
                .count()
                >= 2;
            if !both_done {
                continue;
            }
            let ledger = ledger_path(
                &self.couple,
                &RewardLedgerEntry::idempotency_key_for(&ItemId::new(item_id)),
            );
            if self.store.get(&ledger).await?.is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes the set document, its completion slots, and the ledger
    /// entries its items left behind. Returns ledger entries removed.
    async fn remove_day(&self, key: &ContentSetKey, set_path: &str) -> Result<usize, SyncError> {
        let mut removed_ledger = 0;

        let slots = self.store.list(&completion_prefix(key)).await?;
        for item_id in item_ids_of(&completion_prefix(key), &slots) {
            let ledger = ledger_path(
                &self.couple,
                &RewardLedgerEntry::idempotency_key_for(&ItemId::new(item_id)),
            );
            if self.store.get(&ledger).await?.is_some() {
                self.store.remove(&ledger).await?;
                removed_ledger += 1;
            }
        }
        for slot in slots {
            self.store.remove(&slot).await?;
        }
        self.store.remove(set_path).await?;
        Ok(removed_ledger)
    }

    /// Runs the sweep on an interval until `shutdown` flips true. Never
    /// inline with reads; failures are logged and the next tick retries.
    pub fn spawn_periodic(
        self,
        every: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = tick.tick() => {
                        let today = chrono::Utc::now().date_naive();
                        match self.run_once(today).await {
                            Ok(report) => log::debug!("[SWEEP] pass done: {report:?}"),
                            Err(e) => log::warn!("[SWEEP] pass failed: {e}"),
                        }
                    }
                }
            }
        })
    }
}

/// `quests/{couple}/{date}` → date.
fn parse_set_date(path: &str) -> Option<NaiveDate> {
    path.rsplit('/').next()?.parse().ok()
}

/// Distinct item ids appearing in completion slot paths under `prefix`.
fn item_ids_of(prefix: &str, slot_paths: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = slot_paths
        .iter()
        .filter_map(|p| p.strip_prefix(prefix)?.strip_prefix('/'))
        .filter_map(|rest| rest.split('/').next())
        .map(String::from)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::balance::BalanceSynchronizer;
    use crate::sync::domain::generate::{generate_set, StaticCatalog};
    use crate::sync::domain::identity::{completion_slot_path, quest_path, ParticipantId};
    use crate::sync::domain::model::ItemId;
    use crate::sync::remote::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn couple() -> CoupleKey {
        CoupleKey::derive(&pid("alice"), &pid("bob")).unwrap()
    }

    /// Publishes a set for `date` and completes its first item by both
    /// participants. Returns the first item's id.
    async fn seed_day(store: &MemoryStore, date: &str) -> ItemId {
        let key = ContentSetKey::new(couple(), date.parse().unwrap());
        let set = generate_set(&key, &pid("alice"), &StaticCatalog, Utc::now());
        let item = set.items[0].id.clone();
        store
            .set(&quest_path(&key), serde_json::to_value(&set).unwrap())
            .await
            .unwrap();
        for who in ["alice", "bob"] {
            store
                .set(
                    &completion_slot_path(&key, item.as_str(), &pid(who)),
                    json!(Utc::now().to_rfc3339()),
                )
                .await
                .unwrap();
        }
        item
    }

    #[tokio::test]
    async fn old_rewarded_sets_are_removed() {
        let store = MemoryStore::new();
        let item = seed_day(&store, "2026-07-01").await;

        // Reward was applied: ledger entry exists.
        let balance = BalanceSynchronizer::new(store.clone(), couple());
        let entry = RewardLedgerEntry::for_item(couple(), &item, 10, Utc::now());
        balance.apply_reward(&entry).await.unwrap();

        let sweep = RetentionSweep::new(store.clone(), couple());
        let report = sweep.run_once("2026-08-08".parse().unwrap()).await.unwrap();

        assert_eq!(report.removed_sets, 1);
        assert_eq!(report.removed_ledger_entries, 1);
        let key = ContentSetKey::new(couple(), "2026-07-01".parse().unwrap());
        assert!(store.get(&quest_path(&key)).await.unwrap().is_none());
        assert!(store.list(&completion_prefix(&key)).await.unwrap().is_empty());
        // The balance itself is untouched by the sweep.
        assert_eq!(balance.resync().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn never_deletes_completed_but_unrewarded_items() {
        let store = MemoryStore::new();
        // Fully completed, but no ledger entry was ever written.
        seed_day(&store, "2026-07-01").await;

        let sweep = RetentionSweep::new(store.clone(), couple());
        let report = sweep.run_once("2026-08-08".parse().unwrap()).await.unwrap();

        assert_eq!(report.removed_sets, 0);
        assert_eq!(report.retained_sets, 1);
        let key = ContentSetKey::new(couple(), "2026-07-01".parse().unwrap());
        assert!(
            store.get(&quest_path(&key)).await.unwrap().is_some(),
            "a set owing a reward must survive the sweep"
        );
    }

    #[tokio::test]
    async fn recent_sets_are_left_alone() {
        let store = MemoryStore::new();
        seed_day(&store, "2026-08-07").await;

        let sweep = RetentionSweep::new(store.clone(), couple());
        let report = sweep.run_once("2026-08-08".parse().unwrap()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
