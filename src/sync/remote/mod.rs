//! Remote store seam: the trait the engine drives, plus the in-memory
//! implementation used by tests and the demo binary.

pub mod api;
pub mod memory;

pub use api::{ChangeNotice, Predicate, RemoteStore, Subscription, WriteOutcome};
pub use memory::MemoryStore;
