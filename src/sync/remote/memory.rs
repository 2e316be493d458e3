//! In-memory remote store.
//!
//! Models the backend for tests and the demo binary: a shared key-value
//! tree with per-path conditional writes, an atomic increment, and subtree
//! change notification. Cloning the store clones the *handle*: all clones
//! see the same tree, which is exactly how two simulated devices share one
//! backend.
//!
//! Transient failures can be injected with [`MemoryStore::fail_next`] and
//! access-control failures with [`MemoryStore::deny_prefix`], so the retry
//! and fault-surfacing paths are testable without a network.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::sync::error::RemoteError;
use crate::sync::remote::api::{
    ChangeNotice, Predicate, RemoteStore, Subscription, WriteOutcome,
};

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<ChangeNotice>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Value>,
    watchers: Vec<Watcher>,
    /// Number of upcoming operations that fail with a transient error.
    fail_next: u32,
    denied_prefixes: Vec<String>,
}

impl Inner {
    fn check_access(&mut self, path: &str) -> Result<(), RemoteError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(RemoteError::Transient("injected fault".into()));
        }
        if self.denied_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(RemoteError::PermissionDenied { path: path.into() });
        }
        Ok(())
    }

    fn notify(&mut self, path: &str, value: Option<&Value>) {
        // Prune watchers whose receiver has been dropped.
        self.watchers.retain(|w| !w.tx.is_closed());
        for w in &self.watchers {
            let hit = path == w.prefix || path.starts_with(&format!("{}/", w.prefix));
            if hit {
                let _ = w.tx.send(ChangeNotice {
                    path: path.to_string(),
                    value: value.cloned(),
                });
            }
        }
    }
}

/// Shared in-memory store handle.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// The next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.inner.lock().unwrap().fail_next = n;
    }

    /// All operations under `prefix` fail with `PermissionDenied`.
    pub fn deny_prefix(&self, prefix: impl Into<String>) {
        self.inner.lock().unwrap().denied_prefixes.push(prefix.into());
    }

    /// Number of stored documents (test introspection).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_access(path)?;
        Ok(inner.docs.get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_access(path)?;
        inner.docs.insert(path.to_string(), value.clone());
        inner.notify(path, Some(&value));
        Ok(())
    }

    async fn conditional_set(
        &self,
        path: &str,
        value: Value,
        predicate: Predicate,
    ) -> Result<WriteOutcome, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_access(path)?;
        let holds = match &predicate {
            Predicate::Absent => !inner.docs.contains_key(path),
            Predicate::Equals(expected) => inner.docs.get(path) == Some(expected),
        };
        if !holds {
            return Ok(WriteOutcome::PredicateFailed);
        }
        inner.docs.insert(path.to_string(), value.clone());
        inner.notify(path, Some(&value));
        Ok(WriteOutcome::Committed)
    }

    async fn transaction_increment(&self, path: &str, delta: i64) -> Result<i64, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_access(path)?;
        let current = inner.docs.get(path).and_then(Value::as_i64).unwrap_or(0);
        let next = current + delta;
        let value = Value::from(next);
        inner.docs.insert(path.to_string(), value.clone());
        inner.notify(path, Some(&value));
        Ok(next)
    }

    async fn remove(&self, path: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_access(path)?;
        if inner.docs.remove(path).is_some() {
            inner.notify(path, None);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_access(prefix)?;
        let under = format!("{prefix}/");
        Ok(inner
            .docs
            .keys()
            .filter(|k| k.starts_with(&under))
            .cloned()
            .collect())
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.denied_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return Err(RemoteError::PermissionDenied { path: path.into() });
        }
        inner.watchers.push(Watcher {
            prefix: path.to_string(),
            tx,
        });
        Ok(Subscription::new(path.to_string(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn conditional_set_publish_race_has_one_winner() {
        let store = MemoryStore::new();
        let a = store
            .conditional_set("quests/c/d", json!({"by": "a"}), Predicate::Absent)
            .await
            .unwrap();
        let b = store
            .conditional_set("quests/c/d", json!({"by": "b"}), Predicate::Absent)
            .await
            .unwrap();
        assert_eq!(a, WriteOutcome::Committed);
        assert_eq!(b, WriteOutcome::PredicateFailed);
        assert_eq!(store.get("quests/c/d").await.unwrap().unwrap()["by"], "a");
    }

    #[tokio::test]
    async fn increment_counts_from_zero_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.transaction_increment("balance/c", 10).await.unwrap(), 10);
        assert_eq!(store.transaction_increment("balance/c", 5).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn concurrent_increments_never_lose_an_update() {
        let store = MemoryStore::new();
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let s = store.clone();
            tasks.push(tokio::spawn(async move {
                s.transaction_increment("balance/c", 1).await.unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.get("balance/c").await.unwrap().unwrap(), json!(50));
    }

    #[tokio::test]
    async fn subscription_sees_subtree_writes() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("completion/c/d").unwrap();
        store.set("completion/c/d/item1/alice", json!("t")).await.unwrap();
        store.set("elsewhere/x", json!(1)).await.unwrap();

        let notice = sub.recv().await.unwrap();
        assert_eq!(notice.path, "completion/c/d/item1/alice");
        // The unrelated write was filtered out.
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn injected_faults_and_denials() {
        let store = MemoryStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.get("x").await,
            Err(RemoteError::Transient(_))
        ));
        // Fault budget consumed: next call succeeds.
        assert!(store.get("x").await.unwrap().is_none());

        store.deny_prefix("balance/");
        assert!(matches!(
            store.transaction_increment("balance/c", 1).await,
            Err(RemoteError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn list_returns_only_paths_under_prefix() {
        let store = MemoryStore::new();
        store.set("quests/c/2026-08-08", json!(1)).await.unwrap();
        store.set("quests/c/2026-08-09", json!(2)).await.unwrap();
        store.set("quests/cc/2026-08-08", json!(3)).await.unwrap();
        let got = store.list("quests/c").await.unwrap();
        assert_eq!(got, vec!["quests/c/2026-08-08", "quests/c/2026-08-09"]);
    }
}
