//! Deterministic daily quest generation.
//!
//! Generation is seeded from `(CoupleKey, CalendarDate)` only, so any two
//! devices generating for the same couple and day produce identical item
//! ids and kinds, even on the fallback path where both ended up generating
//! independently.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::sync::domain::identity::{ContentSetKey, ParticipantId};
use crate::sync::domain::model::{ContentItem, ContentSet, ItemId, QuestKind, SCHEMA_VERSION};

/// Items every daily set carries: three required, one optional bonus.
pub const REQUIRED_ITEMS: usize = 3;
pub const OPTIONAL_ITEMS: usize = 1;

/// Resolves a `(kind, slot)` pair to a stable catalog reference.
///
/// External collaborator: the engine only stores and compares the returned
/// ref. Implementations must be deterministic: the same `(kind, slot)`
/// resolves to the same ref on both devices.
pub trait ContentCatalog {
    fn resolve(&self, kind: QuestKind, slot: u32) -> String;
}

/// Default catalog used by the demo binary and tests: refs are synthesized
/// from the kind and slot, which is trivially stable.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog;

impl ContentCatalog for StaticCatalog {
    fn resolve(&self, kind: QuestKind, slot: u32) -> String {
        let kind = match kind {
            QuestKind::WordChain => "word_chain",
            QuestKind::MemoryMatch => "memory_match",
            QuestKind::Trivia => "trivia",
            QuestKind::Checkin => "checkin",
        };
        format!("catalog://{kind}/{slot}")
    }
}

/// Seed for one `(CoupleKey, CalendarDate)` pair.
pub fn daily_seed(key: &ContentSetKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.couple.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(key.date.to_string().as_bytes());
    hasher.finalize().into()
}

/// Generates the daily set for `key`.
///
/// Item ids, kinds and catalog slots are all functions of the seed. Only
/// `created_at`/`expires_at`/`generated_by` differ between two independent
/// generations, and those fields never participate in convergence checks.
pub fn generate_set<C: ContentCatalog>(
    key: &ContentSetKey,
    generated_by: &ParticipantId,
    catalog: &C,
    now: DateTime<Utc>,
) -> ContentSet {
    let seed = daily_seed(key);
    let expires_at = key
        .date
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc());

    let items = (0..REQUIRED_ITEMS + OPTIONAL_ITEMS)
        .map(|index| {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update((index as u32).to_le_bytes());
            let digest = hasher.finalize();

            let id = ItemId::new(hex::encode(&digest[..8]));
            let kind = QuestKind::ALL[digest[8] as usize % QuestKind::ALL.len()];
            let slot = u32::from_le_bytes([digest[9], digest[10], digest[11], digest[12]]) % 1000;

            ContentItem {
                id,
                kind,
                payload_ref: catalog.resolve(kind, slot),
                is_optional: index >= REQUIRED_ITEMS,
                created_at: now,
                expires_at,
            }
        })
        .collect();

    ContentSet {
        schema_version: SCHEMA_VERSION,
        couple_key: key.couple.clone(),
        date: key.date,
        generated_by: generated_by.clone(),
        created_at: now,
        items,
    }
}
