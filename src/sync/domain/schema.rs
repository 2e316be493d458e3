//! Schema version gate.
//!
//! Every root document carries a `schema_version`. Reads pass through the
//! gate before any other field is looked at: newer-than-supported fails with
//! `SchemaIncompatible` (surfaced as "upgrade required"), older versions are
//! migrated in memory before use.
//!
//! Migration functions are pure, total (missing optional fields get explicit
//! defaults, never a panic) and idempotent (applying one twice is a no-op).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::sync::domain::model::SCHEMA_VERSION;
use crate::sync::error::SyncError;

pub type Migration = fn(Value) -> Value;

pub struct SchemaGate {
    /// from-version -> migration producing from-version + 1.
    migrations: BTreeMap<u32, Migration>,
}

impl Default for SchemaGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaGate {
    /// Gate with the built-in migration chain registered.
    pub fn new() -> Self {
        let mut migrations: BTreeMap<u32, Migration> = BTreeMap::new();
        migrations.insert(1, migrate_v1_default_optional_flag);
        Self { migrations }
    }

    #[cfg(test)]
    pub fn with_migration(mut self, from: u32, m: Migration) -> Self {
        self.migrations.insert(from, m);
        self
    }

    /// Checks the version and migrates the payload up to [`SCHEMA_VERSION`].
    ///
    /// On `SchemaIncompatible` no field of the payload has been interpreted.
    pub fn pass(&self, mut raw: Value) -> Result<Value, SyncError> {
        let found = raw
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::ValidationFailed("missing `schema_version`".into()))?
            as u32;

        if found > SCHEMA_VERSION {
            return Err(SyncError::SchemaIncompatible {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        let mut version = found;
        while version < SCHEMA_VERSION {
            // A gap in the chain means this build cannot read the document.
            let migrate = self.migrations.get(&version).ok_or(SyncError::SchemaIncompatible {
                found: version,
                supported: SCHEMA_VERSION,
            })?;
            log::debug!("[SCHEMA] migrating document v{} -> v{}", version, version + 1);
            raw = migrate(raw);
            version += 1;
            raw["schema_version"] = Value::from(version);
        }

        Ok(raw)
    }

    /// Stamps the current version on an outgoing root document.
    pub fn stamp(raw: &mut Value) {
        raw["schema_version"] = Value::from(SCHEMA_VERSION);
    }
}

/// v1 items predate `is_optional`; default it to required.
fn migrate_v1_default_optional_flag(mut raw: Value) -> Value {
    if let Some(items) = raw.get_mut("items").and_then(Value::as_array_mut) {
        for item in items {
            if let Some(obj) = item.as_object_mut() {
                obj.entry("is_optional").or_insert(Value::Bool(false));
            }
        }
    }
    raw
}
