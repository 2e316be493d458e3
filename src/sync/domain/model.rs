//! Shared data model.
//!
//! Everything here crosses the wire as JSON and must deserialize identically
//! on both devices. Shared ids are always derived from the generation seed,
//! never from per-device randomness.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::domain::identity::{ContentSetKey, CoupleKey, ParticipantId};

/// Current schema version stamped on every root document.
///
/// v1 predates the `is_optional` flag on items; the v1→v2 migration defaults
/// it to `false`.
pub const SCHEMA_VERSION: u32 = 2;

/// Upper bound on items per daily set accepted from the remote store.
pub const MAX_ITEMS: usize = 16;

/// Closed set of quest kinds. An unknown kind in a remote payload fails
/// validation for the whole set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestKind {
    WordChain,
    MemoryMatch,
    Trivia,
    Checkin,
}

impl QuestKind {
    pub const ALL: [QuestKind; 4] = [
        QuestKind::WordChain,
        QuestKind::MemoryMatch,
        QuestKind::Trivia,
        QuestKind::Checkin,
    ];
}

/// Identifier of one content item. Identical on both devices for the same
/// logical item: derived from the set's generation seed plus the item index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One interactive item of the daily set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: ItemId,
    pub kind: QuestKind,
    /// Reference into the external content catalog. The engine only stores
    /// and compares it.
    pub payload_ref: String,
    pub is_optional: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// The daily content set shared by the couple.
///
/// Immutable once both devices have adopted it: a corrupt or divergent set
/// is replaced wholesale, never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSet {
    pub schema_version: u32,
    pub couple_key: CoupleKey,
    pub date: NaiveDate,
    pub generated_by: ParticipantId,
    pub created_at: DateTime<Utc>,
    pub items: Vec<ContentItem>,
}

impl ContentSet {
    pub fn key(&self) -> ContentSetKey {
        ContentSetKey::new(self.couple_key.clone(), self.date)
    }

    /// Ordered item ids, the list two devices must agree on.
    pub fn item_ids(&self) -> Vec<&ItemId> {
        self.items.iter().map(|i| &i.id).collect()
    }

    pub fn item(&self, id: &ItemId) -> Option<&ContentItem> {
        self.items.iter().find(|i| &i.id == id)
    }
}

/// Per-item completion slots, one per participant.
///
/// Stored slot-per-path remotely; each device writes only its own slot, so
/// the merged record is conflict-free by construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub slots: BTreeMap<ParticipantId, DateTime<Utc>>,
}

impl CompletionRecord {
    pub fn mark(&mut self, participant: ParticipantId, at: DateTime<Utc>) {
        // First stamp wins; a replayed notification never moves the time.
        self.slots.entry(participant).or_insert(at);
    }

    pub fn completed_by(&self, participant: &ParticipantId) -> bool {
        self.slots.contains_key(participant)
    }

    /// Both slots present. Safe to evaluate redundantly on every change
    /// notification from either device.
    pub fn fully_completed(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        self.completed_by(a) && self.completed_by(b)
    }
}

/// Lifecycle of one item. Transitions are monotone; see [`ItemState::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemState {
    Created,
    PartiallyCompleted,
    FullyCompleted,
    RewardApplied,
    Archived,
}

impl ItemState {
    /// Moves forward only. Re-observing an earlier state (duplicate event,
    /// replayed notification) is a no-op; returns whether anything changed.
    pub fn advance(&mut self, next: ItemState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// Append-only proof that a reward was applied exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardLedgerEntry {
    pub idempotency_key: String,
    pub couple_key: CoupleKey,
    pub amount: i64,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
}

impl RewardLedgerEntry {
    /// Deterministic key: both devices computing it independently for the
    /// same item produce the same string. Never derived from a timestamp or
    /// a random value.
    pub fn idempotency_key_for(item: &ItemId) -> String {
        format!("reward-{item}")
    }

    pub fn for_item(
        couple_key: CoupleKey,
        item: &ItemId,
        amount: i64,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key: Self::idempotency_key_for(item),
            couple_key,
            amount,
            reason: format!("quest {item} fully completed"),
            applied_at,
        }
    }
}
