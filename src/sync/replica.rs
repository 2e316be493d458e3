//! Local read-replica cache file.
//!
//! Holds the last adopted set and the last observed balance so the UI has
//! something to paint immediately on relaunch. Strictly write-through from
//! engine notifications; nothing here is ever consulted to author a remote
//! write, and deleting the file simply means the next launch resyncs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::domain::identity::ContentSetKey;
use crate::sync::domain::model::ContentSet;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReplicaState {
    sets: BTreeMap<String, ContentSet>,
    balance: Option<i64>,
}

pub struct Replica {
    path: PathBuf,
    state: ReplicaState,
}

impl Replica {
    /// Opens the replica file, or starts empty if it does not exist yet.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt replica file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReplicaState::default(),
            Err(e) => return Err(e).context("reading replica file"),
        };
        Ok(Self { path, state })
    }

    pub fn record_set(&mut self, set: &ContentSet) -> Result<()> {
        self.state.sets.insert(set.key().to_string(), set.clone());
        self.save()
    }

    pub fn record_balance(&mut self, balance: i64) -> Result<()> {
        self.state.balance = Some(balance);
        self.save()
    }

    pub fn last_set(&self, key: &ContentSetKey) -> Option<&ContentSet> {
        self.state.sets.get(&key.to_string())
    }

    pub fn last_balance(&self) -> Option<i64> {
        self.state.balance
    }

    fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| *d != Path::new("")) {
            fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        fs::write(&self.path, bytes).context("writing replica file")
    }
}
