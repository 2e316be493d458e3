//! Engine messages: events in, commands out, notifications to the caller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::sync::domain::identity::{ContentSetKey, ParticipantId};
use crate::sync::domain::model::{ContentSet, ItemId, ItemState, RewardLedgerEntry};
use crate::sync::error::SyncError;

/// Signals from the outside world, fed to the engine by the driver.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The caller asked for the daily set for this key.
    DayStarted { key: ContentSetKey },

    /// Result of a `FetchSet` command. `None` means the path is absent.
    RemoteSetFetched {
        key: ContentSetKey,
        payload: Option<Value>,
    },

    /// A `FetchSet` command failed at the store.
    FetchFailed { key: ContentSetKey, error: SyncError },

    /// Result of a `PublishSet` conditional write.
    PublishOutcome { key: ContentSetKey, committed: bool },

    /// A scheduled re-read timer fired.
    RetryElapsed { key: ContentSetKey },

    /// One completion slot was observed (live notification or initial
    /// resync). Delivered redundantly; the engine must stay correct when
    /// the same slot is seen any number of times, in any order.
    CompletionSlotSeen {
        key: ContentSetKey,
        item_id: ItemId,
        participant: ParticipantId,
        at: DateTime<Utc>,
    },

    /// Result of a `ClaimReward` conditional write. `won == false` means
    /// the peer's claim committed first, which is a successful no-op.
    LedgerClaimOutcome { item_id: ItemId, won: bool },

    /// Result of a `CreditBalance` atomic increment.
    RewardCredited { item_id: ItemId, new_balance: i64 },
}

/// Side effects for the driver to execute.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Read the remote content set document.
    FetchSet { key: ContentSetKey },

    /// Publish a freshly generated set. Conditional either way: absent-only
    /// normally, or replace-if-unchanged when a rejected payload is being
    /// regenerated over (`replacing` holds the exact document we rejected).
    PublishSet {
        key: ContentSetKey,
        set: ContentSet,
        replacing: Option<Value>,
    },

    /// Re-read the set after `delay`. Cancellable: the driver drops the
    /// timer when the day's context is torn down.
    ScheduleRetry { key: ContentSetKey, delay: Duration },

    /// Subscribe to the day's completion subtree and replay any slots
    /// already present remotely.
    WatchCompletion { key: ContentSetKey },

    /// Conditionally create the reward ledger entry for this item.
    ClaimReward {
        item_id: ItemId,
        entry: RewardLedgerEntry,
    },

    /// Atomically credit the balance. Issued only after winning the claim.
    CreditBalance { item_id: ItemId, amount: i64 },

    /// Deliver a notification to the caller.
    Notify(SyncNotification),
}

/// Engine → caller events.
#[derive(Debug, Clone)]
pub enum SyncNotification {
    /// The daily set is adopted locally. `fallback` marks the documented
    /// divergence edge case (peer never published, we generated last-resort).
    ContentSetReady { set: ContentSet, fallback: bool },

    /// An item moved forward in its lifecycle.
    CompletionChanged { item_id: ItemId, state: ItemState },

    /// The authoritative balance changed.
    BalanceChanged(i64),

    /// A fatal condition the caller must surface (upgrade required,
    /// permissions). Never emitted for conditions the engine resolves
    /// internally.
    Fault { error: SyncError, context: String },
}
