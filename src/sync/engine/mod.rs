//! Quest & reward decision engine.
//!
//! This module is the **functional core** of the synchronization logic. It
//! acts as a pure state machine:
//! - **Input**: [`EngineEvent`] (signals from the store and the caller).
//! - **Output**: `Vec<EngineCommand>` (side effects executed by the driver).
//!
//! # Architecture guarantees
//! * **No network**: never opens a connection or touches the store.
//! * **No async**: all handlers are synchronous and fast.
//! * **Convergence-deterministic**: item ids, idempotency keys and adoption
//!   decisions are functions of `(CoupleKey, CalendarDate)` and the event
//!   stream; wall-clock reads only stamp metadata fields.

pub mod state;
mod logic;
pub mod types;


pub use state::{AdoptState, EngineConfig};
pub use types::{EngineCommand, EngineEvent, SyncNotification};

use std::collections::HashMap;

use crate::sync::domain::generate::ContentCatalog;
use crate::sync::domain::identity::{ContentSetKey, CoupleKey, ParticipantId};
use crate::sync::domain::model::{ContentItem, ContentSet, ItemId, ItemState};
use crate::sync::domain::schema::SchemaGate;
use crate::sync::engine::state::EngineState;
use crate::sync::error::SyncError;

/// The synchronization brain for one device of the couple.
pub struct SyncEngine<C> {
    state: EngineState<C>,
}

impl<C: ContentCatalog> SyncEngine<C> {
    /// Creates the engine for the local participant `me` paired with `peer`.
    ///
    /// Fails if either identifier violates the stability contract or if the
    /// two are the same participant.
    pub fn new(
        me: ParticipantId,
        peer: ParticipantId,
        catalog: C,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let couple = CoupleKey::derive(&me, &peer)?;
        Ok(Self {
            state: EngineState {
                me,
                peer,
                couple,
                config,
                gate: SchemaGate::new(),
                catalog,
                sets: HashMap::new(),
                adopted: HashMap::new(),
                pending_publish: HashMap::new(),
                rejected: HashMap::new(),
                items: HashMap::new(),
                watching: Default::default(),
            },
        })
    }

    /// The main entry point: feed one event, get the commands to execute.
    pub fn handle_event(&mut self, event: EngineEvent) -> Vec<EngineCommand> {
        match event {
            EngineEvent::DayStarted { key } => logic::on_day_started(&mut self.state, key),
            EngineEvent::RemoteSetFetched { key, payload } => {
                logic::on_remote_set_fetched(&mut self.state, key, payload)
            }
            EngineEvent::FetchFailed { key, error } => {
                logic::on_fetch_failed(&mut self.state, key, error)
            }
            EngineEvent::PublishOutcome { key, committed } => {
                logic::on_publish_outcome(&mut self.state, key, committed)
            }
            EngineEvent::RetryElapsed { key } => logic::on_retry_elapsed(&mut self.state, key),
            EngineEvent::CompletionSlotSeen {
                key,
                item_id,
                participant,
                at,
            } => logic::on_completion_slot_seen(&mut self.state, key, item_id, participant, at),
            EngineEvent::LedgerClaimOutcome { item_id, won } => {
                logic::on_ledger_claim_outcome(&mut self.state, item_id, won)
            }
            EngineEvent::RewardCredited {
                item_id,
                new_balance,
            } => logic::on_reward_credited(&mut self.state, item_id, new_balance),
        }
    }

    pub fn me(&self) -> &ParticipantId {
        &self.state.me
    }

    pub fn couple_key(&self) -> &CoupleKey {
        &self.state.couple
    }

    /// The locally adopted set for `key`, if the protocol has converged.
    pub fn adopted_set(&self, key: &ContentSetKey) -> Option<&ContentSet> {
        self.state.adopted.get(key)
    }

    pub fn adopt_state(&self, key: &ContentSetKey) -> Option<&AdoptState> {
        self.state.sets.get(key)
    }

    pub fn item_state(&self, id: &ItemId) -> Option<ItemState> {
        self.state.items.get(id).map(|p| p.state)
    }

    /// When the local participant completed the item, if it did.
    pub fn own_slot(&self, id: &ItemId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.state
            .items
            .get(id)
            .and_then(|p| p.record.slots.get(&self.state.me))
            .copied()
    }

    /// Resolves an item id back to its day key and definition. Used by the
    /// driver to build the own-slot completion path.
    pub fn item(&self, id: &ItemId) -> Option<(&ContentSetKey, &ContentItem)> {
        let progress = self.state.items.get(id)?;
        let item = self.state.adopted.get(&progress.key)?.item(id)?;
        Some((&progress.key, item))
    }
}
