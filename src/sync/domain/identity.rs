//! Couple identity and remote path derivation.
//!
//! Every shared key in the remote store is derived here and nowhere else.
//! The central invariant: both devices must derive identical keys without
//! ever talking to each other, so derivation only accepts identifiers that
//! are stable across reinstalls and devices for the same participant.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::sync::error::SyncError;

/// Separator used when joining the two participant ids into a couple key.
pub const COUPLE_KEY_SEPARATOR: char = '_';

const MAX_PARTICIPANT_ID_LEN: usize = 64;

/// Stable identifier for one participant.
///
/// The constructor enforces the stability contract: push-delivery tokens,
/// session tokens and other per-installation values are rejected. Accepted
/// ids are short, `[A-Za-z0-9_-]` only, and equal across all devices the
/// participant signs into.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(raw: impl Into<String>) -> Result<Self, SyncError> {
        let raw = raw.into();
        let stable = !raw.is_empty()
            && raw.len() <= MAX_PARTICIPANT_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !stable {
            return Err(SyncError::UnstableIdentifier(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order-independent key identifying the pair.
///
/// `CoupleKey::derive(a, b) == CoupleKey::derive(b, a)` always holds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoupleKey(String);

impl CoupleKey {
    pub fn derive(a: &ParticipantId, b: &ParticipantId) -> Result<Self, SyncError> {
        if a == b {
            return Err(SyncError::UnstableIdentifier(format!(
                "both participants are {a}"
            )));
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Ok(Self(format!("{lo}{COUPLE_KEY_SEPARATOR}{hi}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Breaks the generation tie: the participant with the smaller id generates
/// first, the other waits and adopts.
pub fn priority<'a>(a: &'a ParticipantId, b: &'a ParticipantId) -> &'a ParticipantId {
    if a <= b {
        a
    } else {
        b
    }
}

/// Key of one daily content set: `(CoupleKey, CalendarDate)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentSetKey {
    pub couple: CoupleKey,
    pub date: NaiveDate,
}

impl ContentSetKey {
    pub fn new(couple: CoupleKey, date: NaiveDate) -> Self {
        Self { couple, date }
    }
}

impl fmt::Display for ContentSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.couple, self.date)
    }
}

// ================================
// Remote path layout
// ================================

/// Path of the daily content set document.
pub fn quest_path(key: &ContentSetKey) -> String {
    format!("quests/{}/{}", key.couple, key.date)
}

/// Prefix under which all completion slots for one day live.
pub fn completion_prefix(key: &ContentSetKey) -> String {
    format!("completion/{}/{}", key.couple, key.date)
}

/// Path of one participant's completion slot for one item. Each device only
/// ever writes its own slot.
pub fn completion_slot_path(
    key: &ContentSetKey,
    item_id: &str,
    participant: &ParticipantId,
) -> String {
    format!("{}/{}/{}", completion_prefix(key), item_id, participant)
}

/// Path of a reward ledger entry, keyed by its idempotency key.
pub fn ledger_path(couple: &CoupleKey, idempotency_key: &str) -> String {
    format!("ledger/{couple}/{idempotency_key}")
}

/// Prefix of all ledger entries for the couple.
pub fn ledger_prefix(couple: &CoupleKey) -> String {
    format!("ledger/{couple}")
}

/// Path of the single balance counter.
pub fn balance_path(couple: &CoupleKey) -> String {
    format!("balance/{couple}")
}

/// Prefix of all content sets for the couple (retention sweep scan root).
pub fn quest_prefix(couple: &CoupleKey) -> String {
    format!("quests/{couple}")
}
