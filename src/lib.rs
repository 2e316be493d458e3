//! Shared daily quests and a single reward balance for a paired couple,
//! synchronized through a weakly-consistent remote store.
//!
//! Two devices that never talk to each other directly must end every day
//! holding the identical quest list and having credited each reward exactly
//! once. The engine gets there with three primitives the store offers:
//! publish-if-absent (one canonical daily set), conditional ledger creation
//! (exactly-once rewards), and an atomic increment (lost-update-free
//! balance).
//!
//! Entry points:
//! - [`SyncDriver`] — per-device driver: start a day, complete items,
//!   receive [`SyncNotification`]s.
//! - [`BalanceSynchronizer`] — the balance read replica and the
//!   `claim`/`credit` path.
//! - [`RetentionSweep`] — background cleanup of expired state.
//! - [`RemoteStore`] — the seam to implement against a real backend;
//!   [`MemoryStore`] is the in-process implementation used in tests and
//!   the demo binary.

pub mod sync;

pub use sync::balance::{BalanceSynchronizer, RewardOutcome};
pub use sync::domain::generate::{ContentCatalog, StaticCatalog};
pub use sync::domain::identity::{ContentSetKey, CoupleKey, ParticipantId};
pub use sync::domain::model::{
    CompletionRecord, ContentItem, ContentSet, ItemId, ItemState, QuestKind, RewardLedgerEntry,
};
pub use sync::engine::{EngineConfig, SyncEngine, SyncNotification};
pub use sync::error::{RemoteError, SyncError};
pub use sync::remote::{MemoryStore, RemoteStore};
pub use sync::replica::Replica;
pub use sync::runtime::{RetentionSweep, RetryPolicy, SyncDriver};
