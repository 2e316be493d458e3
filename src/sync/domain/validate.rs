//! Structural validation of remote payloads.
//!
//! Nothing read from the remote store is trusted until it has passed here.
//! Rejection is atomic: one malformed item rejects the entire set. Partial
//! acceptance would leave the two devices with different item counts, which
//! is strictly worse than a unanimous regeneration, so the caller treats
//! `ValidationFailed` exactly like "no content set exists yet".

use std::collections::HashSet;

use serde_json::Value;

use crate::sync::domain::identity::ContentSetKey;
use crate::sync::domain::model::{ContentSet, MAX_ITEMS};
use crate::sync::error::SyncError;

fn reject(reason: impl Into<String>) -> SyncError {
    SyncError::ValidationFailed(reason.into())
}

/// Validates a raw payload read from `quests/{couple}/{date}` and decodes it.
///
/// `expected` is the key the payload was read from; a document whose own
/// couple/date fields disagree with its path is rejected (it was written by
/// a buggy or hostile client and cannot be reasoned about).
pub fn validate_content_set(raw: &Value, expected: &ContentSetKey) -> Result<ContentSet, SyncError> {
    let obj = raw.as_object().ok_or_else(|| reject("root is not an object"))?;

    let items = obj
        .get("items")
        .ok_or_else(|| reject("missing field `items`"))?
        .as_array()
        .ok_or_else(|| reject("`items` is not an array"))?;
    if items.is_empty() {
        return Err(reject("empty item list"));
    }
    if items.len() > MAX_ITEMS {
        return Err(reject(format!("{} items exceeds bound {MAX_ITEMS}", items.len())));
    }

    let mut seen_ids = HashSet::new();
    for (index, item) in items.iter().enumerate() {
        check_item(index, item, &mut seen_ids)?;
    }

    // Typed decode after the structural pass: catches remaining field-level
    // type errors (timestamps, enum values) in one place.
    let set: ContentSet = serde_json::from_value(raw.clone())
        .map_err(|e| reject(format!("decode: {e}")))?;

    if set.couple_key != expected.couple || set.date != expected.date {
        return Err(reject(format!(
            "document claims {}/{} but was read from {expected}",
            set.couple_key, set.date
        )));
    }

    Ok(set)
}

fn check_item(index: usize, item: &Value, seen_ids: &mut HashSet<String>) -> Result<(), SyncError> {
    let obj = item
        .as_object()
        .ok_or_else(|| reject(format!("item {index} is not an object")))?;

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| reject(format!("item {index}: missing or non-string `id`")))?;
    if id.is_empty() {
        return Err(reject(format!("item {index}: empty `id`")));
    }
    if !seen_ids.insert(id.to_string()) {
        return Err(reject(format!("item {index}: duplicate id {id}")));
    }

    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| reject(format!("item {index}: missing or non-string `kind`")))?;
    if !matches!(kind, "word_chain" | "memory_match" | "trivia" | "checkin") {
        return Err(reject(format!("item {index}: kind {kind:?} out of range")));
    }

    if obj.get("payload_ref").and_then(Value::as_str).is_none() {
        return Err(reject(format!("item {index}: missing or non-string `payload_ref`")));
    }
    if obj.get("is_optional").and_then(Value::as_bool).is_none() {
        return Err(reject(format!("item {index}: missing or non-bool `is_optional`")));
    }

    let created_at = obj
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok())
        .ok_or_else(|| reject(format!("item {index}: bad `created_at`")))?;

    match obj.get("expires_at") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            let expires_at = s
                .parse::<chrono::DateTime<chrono::Utc>>()
                .map_err(|_| reject(format!("item {index}: bad `expires_at`")))?;
            if expires_at <= created_at {
                return Err(reject(format!("item {index}: expires before creation")));
            }
        }
        Some(_) => return Err(reject(format!("item {index}: bad `expires_at`"))),
    }

    Ok(())
}
