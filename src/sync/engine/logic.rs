//! Event handlers.
//!
//! Free functions over [`EngineState`], one per event, in the order the
//! protocol flows: generate-or-adopt first, then completion and reward.
//! Wall-clock reads here only feed metadata fields (`created_at`, ledger
//! stamps); everything convergence depends on is derived from the seed or
//! from event payloads.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::sync::domain::generate::{generate_set, ContentCatalog};
use crate::sync::domain::identity::{priority, ContentSetKey, ParticipantId};
use crate::sync::domain::model::{ContentSet, ItemId, ItemState, RewardLedgerEntry};
use crate::sync::domain::validate::validate_content_set;
use crate::sync::engine::state::{AdoptState, EngineState, ItemProgress};
use crate::sync::engine::types::{EngineCommand, SyncNotification};
use crate::sync::error::SyncError;

pub fn on_day_started<C>(state: &mut EngineState<C>, key: ContentSetKey) -> Vec<EngineCommand> {
    if matches!(state.sets.get(&key), Some(AdoptState::Adopted)) {
        // Re-entering a day that already converged: just replay readiness.
        let set = state.adopted[&key].clone();
        return vec![EngineCommand::Notify(SyncNotification::ContentSetReady {
            set,
            fallback: false,
        })];
    }

    log::info!("[ENGINE] day started for {key}");
    state.sets.insert(key.clone(), AdoptState::Absent);
    vec![EngineCommand::FetchSet { key }]
}

pub fn on_remote_set_fetched<C: ContentCatalog>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
    payload: Option<Value>,
) -> Vec<EngineCommand> {
    match payload {
        None => on_absent(state, key),
        Some(raw) => match state.gate.pass(raw.clone()).and_then(|v| validate_content_set(&v, &key)) {
            Ok(set) => {
                state.rejected.remove(&key);
                adopt(state, key, set, false)
            }
            Err(error) if error.is_fatal() => fault(state, key, error),
            Err(error) => {
                // Entire set rejected. Same as "nothing exists yet": re-enter
                // generate-or-adopt. Unrelated completion state is untouched.
                // Remember the exact document so the regeneration replaces
                // it conditionally instead of racing a peer's fix.
                log::warn!("[ENGINE] rejecting remote set for {key}: {error}");
                state.rejected.insert(key.clone(), raw);
                on_absent(state, key)
            }
        },
    }
}

pub fn on_fetch_failed<C: ContentCatalog>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
    error: SyncError,
) -> Vec<EngineCommand> {
    if error.is_fatal() {
        return fault(state, key, error);
    }

    let attempt = match state.sets.get(&key) {
        Some(AdoptState::Absent) => 0,
        Some(AdoptState::AwaitingRemote { attempt }) => *attempt,
        _ => return vec![],
    };

    if state.config.retry.exhausted(attempt + 1) {
        // The store never answered. Generate and let the conditional
        // publish arbitrate; for the non-priority device this is the
        // documented divergence edge case.
        let fallback = !is_priority(state);
        return generate_and_publish(state, key, fallback);
    }

    log::debug!("[ENGINE] fetch failed for {key} (attempt {}): {error}", attempt + 1);
    state
        .sets
        .insert(key.clone(), AdoptState::AwaitingRemote { attempt: attempt + 1 });
    let delay = state.config.retry.delay(attempt + 1);
    vec![EngineCommand::ScheduleRetry { key, delay }]
}

pub fn on_publish_outcome<C>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
    committed: bool,
) -> Vec<EngineCommand> {
    let Some(set) = state.pending_publish.remove(&key) else {
        return vec![];
    };
    let fallback = matches!(
        state.sets.get(&key),
        Some(AdoptState::Generating { fallback: true })
    );

    if committed {
        state.sets.insert(key.clone(), AdoptState::Published { fallback });
        if fallback {
            log::warn!("[DIVERGED] fallback-generated set for {key} won the publish");
        } else {
            log::info!("[ENGINE] published set for {key}");
        }
        return adopt(state, key, set, fallback);
    }

    // Lost the publish race: someone else's set is canonical. Re-read and
    // adopt it; our generated set is dropped on the floor.
    log::info!("[ENGINE] publish for {key} lost the race, re-reading");
    state.sets.insert(key.clone(), AdoptState::Absent);
    vec![EngineCommand::FetchSet { key }]
}

pub fn on_retry_elapsed<C>(state: &mut EngineState<C>, key: ContentSetKey) -> Vec<EngineCommand> {
    match state.sets.get(&key) {
        Some(AdoptState::AwaitingRemote { .. }) => vec![EngineCommand::FetchSet { key }],
        // Timer outlived the state it was scheduled for (adopted meanwhile,
        // or torn down): nothing to do.
        _ => vec![],
    }
}

pub fn on_completion_slot_seen<C>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
    item_id: ItemId,
    participant: ParticipantId,
    at: DateTime<Utc>,
) -> Vec<EngineCommand> {
    if participant != state.me && participant != state.peer {
        log::warn!("[ENGINE] ignoring completion slot by stranger {participant}");
        return vec![];
    }
    let Some(progress) = state.items.get_mut(&item_id) else {
        // Slot for an item we do not hold, typically the remnant of a
        // replaced divergent set. Harmless; the record stays remote.
        log::debug!("[ENGINE] completion slot for unknown item {item_id}");
        return vec![];
    };
    if progress.key != key {
        return vec![];
    }

    progress.record.mark(participant, at);
    let observed = if progress.record.fully_completed(&state.me, &state.peer) {
        ItemState::FullyCompleted
    } else {
        ItemState::PartiallyCompleted
    };

    // Monotone: replayed or out-of-order notifications cannot move an item
    // backwards, so evaluating this redundantly on both devices is safe.
    if !progress.state.advance(observed) {
        return vec![];
    }
    let reached = progress.state;

    let mut cmds = vec![EngineCommand::Notify(SyncNotification::CompletionChanged {
        item_id: item_id.clone(),
        state: reached,
    })];

    if reached == ItemState::FullyCompleted {
        // Deterministic stamp: the later of the two slots, identical on
        // both devices regardless of which one evaluates first.
        let applied_at = latest_slot(progress).unwrap_or(at);
        let entry = RewardLedgerEntry::for_item(
            state.couple.clone(),
            &item_id,
            state.config.reward_amount,
            applied_at,
        );
        log::info!("[ENGINE] {item_id} fully completed, claiming reward");
        cmds.push(EngineCommand::ClaimReward { item_id, entry });
    }

    cmds
}

pub fn on_ledger_claim_outcome<C>(
    state: &mut EngineState<C>,
    item_id: ItemId,
    won: bool,
) -> Vec<EngineCommand> {
    let Some(progress) = state.items.get_mut(&item_id) else {
        return vec![];
    };

    if won {
        log::info!("[ENGINE] claim won for {item_id}, crediting balance");
        return vec![EngineCommand::CreditBalance {
            item_id,
            amount: state.config.reward_amount,
        }];
    }

    // The peer's claim committed first. Expected, not an error: the reward
    // is applied, just not by us.
    log::debug!("[ENGINE] claim for {item_id} already taken, no-op");
    if progress.state.advance(ItemState::RewardApplied) {
        return vec![EngineCommand::Notify(SyncNotification::CompletionChanged {
            item_id,
            state: ItemState::RewardApplied,
        })];
    }
    vec![]
}

pub fn on_reward_credited<C>(
    state: &mut EngineState<C>,
    item_id: ItemId,
    new_balance: i64,
) -> Vec<EngineCommand> {
    let mut cmds = vec![EngineCommand::Notify(SyncNotification::BalanceChanged(new_balance))];
    if let Some(progress) = state.items.get_mut(&item_id) {
        if progress.state.advance(ItemState::RewardApplied) {
            cmds.push(EngineCommand::Notify(SyncNotification::CompletionChanged {
                item_id,
                state: ItemState::RewardApplied,
            }));
        }
    }
    cmds
}

// ================================
// Helpers
// ================================

fn is_priority<C>(state: &EngineState<C>) -> bool {
    priority(&state.me, &state.peer) == &state.me
}

/// Absent (or rejected) remote set: priority generates now, the other side
/// waits with capped backoff and only generates as a last resort.
fn on_absent<C: ContentCatalog>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
) -> Vec<EngineCommand> {
    if is_priority(state) {
        return generate_and_publish(state, key, false);
    }

    let attempt = match state.sets.get(&key) {
        Some(AdoptState::AwaitingRemote { attempt }) => *attempt,
        _ => 0,
    };

    if state.config.retry.exhausted(attempt + 1) {
        log::warn!(
            "[DIVERGED] peer never published {key} after {attempt} re-reads, generating locally"
        );
        return generate_and_publish(state, key, true);
    }

    state
        .sets
        .insert(key.clone(), AdoptState::AwaitingRemote { attempt: attempt + 1 });
    let delay = state.config.retry.delay(attempt + 1);
    log::debug!("[ENGINE] {key} absent, re-reading in {delay:?}");
    vec![EngineCommand::ScheduleRetry { key, delay }]
}

fn generate_and_publish<C: ContentCatalog>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
    fallback: bool,
) -> Vec<EngineCommand> {
    state.sets.insert(key.clone(), AdoptState::Generating { fallback });
    let set = generate_set(&key, &state.me, &state.catalog, Utc::now());
    state.pending_publish.insert(key.clone(), set.clone());
    let replacing = state.rejected.remove(&key);
    vec![EngineCommand::PublishSet { key, set, replacing }]
}

/// Copies the canonical set into the local cache. Terminal success state.
fn adopt<C>(
    state: &mut EngineState<C>,
    key: ContentSetKey,
    set: ContentSet,
    fallback: bool,
) -> Vec<EngineCommand> {
    if let Some(prev) = state.adopted.get(&key) {
        if prev.item_ids() == set.item_ids() {
            state.sets.insert(key, AdoptState::Adopted);
            return vec![];
        }
        // A remote set contradicting the one we hold: our local copy was a
        // fallback the peer's publish superseded. Discard wholesale.
        log::warn!("[DIVERGED] replacing local set for {key} with the remote one");
        let stale: Vec<ItemId> = state
            .items
            .iter()
            .filter(|(id, p)| p.key == key && set.item(id).is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            state.items.remove(&id);
        }
    }

    for item in &set.items {
        state.items.entry(item.id.clone()).or_insert_with(|| ItemProgress {
            key: key.clone(),
            state: ItemState::Created,
            record: Default::default(),
            expires_at: item.expires_at,
        });
    }

    state.adopted.insert(key.clone(), set.clone());
    state.sets.insert(key.clone(), AdoptState::Adopted);
    log::info!("[ENGINE] adopted set for {key} ({} items)", set.items.len());

    let mut cmds = Vec::new();
    if state.watching.insert(key.clone()) {
        cmds.push(EngineCommand::WatchCompletion { key });
    }
    cmds.push(EngineCommand::Notify(SyncNotification::ContentSetReady { set, fallback }));
    cmds
}

fn fault<C>(state: &mut EngineState<C>, key: ContentSetKey, error: SyncError) -> Vec<EngineCommand> {
    log::error!("[ENGINE] fatal for {key}: {error}");
    state.sets.insert(key.clone(), AdoptState::Faulted);
    vec![EngineCommand::Notify(SyncNotification::Fault {
        error,
        context: format!("reading daily set {key}"),
    })]
}

fn latest_slot(progress: &ItemProgress) -> Option<DateTime<Utc>> {
    progress.record.slots.values().max().copied()
}
