//! Remote store contract.
//!
//! The weakly-consistent store is the only coordination medium between the
//! two devices. Everything the engine needs from it is behind this trait:
//! last-write-wins `set`, conditional writes for race-free publication,
//! an atomic increment for the balance, and subtree change subscriptions.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::sync::error::RemoteError;

/// Guard on a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Commit only if no value exists at the path. This is the primitive
    /// behind publish-if-absent and the reward ledger claim.
    Absent,
    /// Commit only if the current value equals the given one.
    Equals(Value),
}

/// Result of a conditional write. `PredicateFailed` is not an error: for
/// every use in this engine it means "someone else got there first".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    PredicateFailed,
}

/// One change delivered by a subscription.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    /// Exact path that was written or removed.
    pub path: String,
    /// New value, or `None` for a removal.
    pub value: Option<Value>,
}

/// Live subscription to a path and everything under it.
///
/// Dropping the subscription unsubscribes; the store prunes closed
/// receivers. There is deliberately no way to duplicate one; components
/// that need fan-out hand observers a local channel instead of starting a
/// second store listener.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<ChangeNotice>,
}

impl Subscription {
    pub fn new(path: String, rx: mpsc::UnboundedReceiver<ChangeNotice>) -> Self {
        Self { path, rx }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the next change. `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<ChangeNotice> {
        self.rx.recv().await
    }

    /// Non-blocking variant for drain loops.
    pub fn try_recv(&mut self) -> Option<ChangeNotice> {
        self.rx.try_recv().ok()
    }
}

/// The remote store seam.
///
/// Per-path guarantees the engine relies on (matching what the backing
/// service offers): `conditional_set` is linearizable per path, and
/// `transaction_increment` never loses an update under concurrent callers.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError>;

    /// Last-write-wins put.
    async fn set(&self, path: &str, value: Value) -> Result<(), RemoteError>;

    async fn conditional_set(
        &self,
        path: &str,
        value: Value,
        predicate: Predicate,
    ) -> Result<WriteOutcome, RemoteError>;

    /// Atomic read-add-write against the current remote value. An absent
    /// path counts from zero. Returns the committed new value.
    async fn transaction_increment(&self, path: &str, delta: i64) -> Result<i64, RemoteError>;

    async fn remove(&self, path: &str) -> Result<(), RemoteError>;

    /// All populated paths strictly under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    /// Subscribes to changes at or under `path`.
    fn subscribe(&self, path: &str) -> Result<Subscription, RemoteError>;
}
