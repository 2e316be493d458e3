//! Engine state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::sync::domain::identity::{ContentSetKey, CoupleKey, ParticipantId};
use crate::sync::domain::model::{CompletionRecord, ContentSet, ItemId, ItemState};
use crate::sync::domain::schema::SchemaGate;
use crate::sync::runtime::retry::RetryPolicy;

/// Tunables. Defaults match the production configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Amount credited per fully completed item.
    pub reward_amount: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reward_amount: 10,
        }
    }
}

/// Generate-or-adopt progress for one `ContentSetKey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdoptState {
    /// Nothing known yet; first fetch in flight.
    Absent,
    /// Waiting for the peer to publish; `attempt` re-reads done so far.
    AwaitingRemote { attempt: u32 },
    /// We generated and the conditional publish is in flight. `fallback`
    /// marks the last-resort path after exhausted retries.
    Generating { fallback: bool },
    /// Our publish committed; the set is the canonical one.
    Published { fallback: bool },
    /// Terminal success: local cache holds the canonical set.
    Adopted,
    /// Terminal fault (schema/permissions); surfaced, nothing retried.
    Faulted,
}

/// Per-item progress assembled from completion slots.
#[derive(Debug, Clone)]
pub struct ItemProgress {
    pub key: ContentSetKey,
    pub state: ItemState,
    pub record: CompletionRecord,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct EngineState<C> {
    pub me: ParticipantId,
    pub peer: ParticipantId,
    pub couple: CoupleKey,
    pub config: EngineConfig,
    pub gate: SchemaGate,
    /// External catalog used when generating.
    pub catalog: C,

    pub sets: HashMap<ContentSetKey, AdoptState>,
    /// Local cache of adopted sets. Read replica only: replaced wholesale
    /// on divergence, never patched.
    pub adopted: HashMap<ContentSetKey, ContentSet>,
    /// Sets we generated, parked until the publish outcome arrives.
    pub pending_publish: HashMap<ContentSetKey, ContentSet>,
    /// Raw payloads we rejected; a regeneration replaces them conditionally
    /// (only while the store still holds the identical rejected document).
    pub rejected: HashMap<ContentSetKey, serde_json::Value>,
    pub items: HashMap<ItemId, ItemProgress>,
    /// Completion subtrees a watch was already requested for.
    pub watching: HashSet<ContentSetKey>,
}
