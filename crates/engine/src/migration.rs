//! Schema versioning for persisted stores.
//!
//! A [`Schema`] describes the logical stores and their secondary indexes.
//! Each [`Migration`] moves a store from `version - 1` to `version` by
//! editing the schema and, where needed, backfilling rows through a
//! [`MigrationTx`]. Upgrades run against a copy of the store image, which is
//! only swapped in (and persisted in one atomic write) once every step has
//! succeeded, so an interrupted upgrade simply runs again on the next open.

use crate::error::MigrationError;
use crate::storage::{now_ms, StoreState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A secondary index over one field of a logical store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub key_path: String,
    pub unique: bool,
}

/// A logical store: its primary key path and secondary indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDef {
    pub key_path: String,
    pub indexes: BTreeMap<String, IndexDef>,
}

/// Persisted layout description. Version 0 means the store was never created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub stores: BTreeMap<String, StoreDef>,
}

impl Schema {
    /// The layout produced by the built-in migrations, declared directly so a
    /// fresh store is created at the current version in one step.
    pub fn latest() -> Self {
        let mut stores = BTreeMap::new();
        stores.insert(
            "documents".to_string(),
            store(
                "id",
                &[
                    ("collectionId", "collectionId", false),
                    ("updatedAt", "updatedAt", false),
                ],
            ),
        );
        stores.insert(
            "vectors".to_string(),
            store("id", &[("collectionId", "collectionId", false)]),
        );
        stores.insert("indexes".to_string(), store("collectionId", &[]));
        stores.insert(
            "collections".to_string(),
            store("id", &[("name", "name", true)]),
        );
        stores.insert(
            "wal".to_string(),
            store(
                "id",
                &[
                    ("sequence", "sequence", true),
                    ("status", "status", false),
                    ("transactionId", "transactionId", false),
                ],
            ),
        );
        stores.insert("meta".to_string(), store("key", &[]));
        Self {
            version: BUILTIN_VERSION,
            stores,
        }
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }
}

fn store(key_path: &str, indexes: &[(&str, &str, bool)]) -> StoreDef {
    StoreDef {
        key_path: key_path.to_string(),
        indexes: indexes
            .iter()
            .map(|(name, key_path, unique)| {
                (
                    name.to_string(),
                    IndexDef {
                        key_path: key_path.to_string(),
                        unique: *unique,
                    },
                )
            })
            .collect(),
    }
}

/// The upgrade transaction handed to each migration step.
///
/// Store and index creation are idempotent so a step can be re-run after an
/// interrupted upgrade.
#[derive(Debug)]
pub struct MigrationTx {
    pub schema: Schema,
    pub state: StoreState,
}

impl MigrationTx {
    pub fn create_store(&mut self, name: &str, key_path: &str) {
        self.schema
            .stores
            .entry(name.to_string())
            .or_insert_with(|| StoreDef {
                key_path: key_path.to_string(),
                indexes: BTreeMap::new(),
            });
    }

    pub fn create_index(
        &mut self,
        store_name: &str,
        index_name: &str,
        key_path: &str,
        unique: bool,
    ) -> Result<(), String> {
        let store = self
            .schema
            .stores
            .get_mut(store_name)
            .ok_or_else(|| format!("store '{store_name}' does not exist"))?;
        store
            .indexes
            .entry(index_name.to_string())
            .or_insert_with(|| IndexDef {
                key_path: key_path.to_string(),
                unique,
            });
        Ok(())
    }
}

/// A migration body. Receives the schema as it was before the step ran.
pub type MigrateFn = fn(&Schema, &mut MigrationTx) -> Result<(), String>;

#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    pub migrate: MigrateFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

impl Migration {
    pub fn new(version: u32, description: impl Into<String>, migrate: MigrateFn) -> Self {
        Self {
            version,
            description: description.into(),
            migrate,
        }
    }
}

const BUILTIN_VERSION: u32 = 4;

fn initial_stores(_old: &Schema, tx: &mut MigrationTx) -> Result<(), String> {
    tx.create_store("documents", "id");
    tx.create_store("vectors", "id");
    tx.create_store("indexes", "collectionId");
    tx.create_store("collections", "id");
    tx.create_index("collections", "name", "name", true)
}

fn wal_store(_old: &Schema, tx: &mut MigrationTx) -> Result<(), String> {
    tx.create_store("wal", "id");
    tx.create_index("wal", "sequence", "sequence", true)?;
    tx.create_index("wal", "status", "status", false)?;
    tx.create_index("wal", "transactionId", "transactionId", false)
}

fn meta_and_collection_indexes(_old: &Schema, tx: &mut MigrationTx) -> Result<(), String> {
    tx.create_store("meta", "key");
    tx.create_index("documents", "collectionId", "collectionId", false)?;
    tx.create_index("vectors", "collectionId", "collectionId", false)
}

fn backfill_updated_at(_old: &Schema, tx: &mut MigrationTx) -> Result<(), String> {
    tx.create_index("documents", "updatedAt", "updatedAt", false)?;
    let now = now_ms();
    for docs in tx.state.documents.values_mut() {
        for doc in docs.values_mut() {
            if doc.updated_at == 0 {
                doc.updated_at = doc.created_at;
            }
        }
    }
    for record in tx.state.indexes.values_mut() {
        if record.updated_at == 0 {
            record.updated_at = now;
        }
    }
    Ok(())
}

fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "create documents, vectors, indexes and collections stores", initial_stores),
        Migration::new(2, "add write-ahead log store", wal_store),
        Migration::new(3, "add meta store and collection indexes", meta_and_collection_indexes),
        Migration::new(4, "backfill updated_at timestamps", backfill_updated_at),
    ]
}

/// Ordered set of migrations plus the schema a fresh store starts at.
#[derive(Debug, Clone)]
pub struct MigrationManager {
    migrations: Vec<Migration>,
    baseline: Option<Schema>,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self {
            migrations: builtin_migrations(),
            baseline: Some(Schema::latest()),
        }
    }
}

impl MigrationManager {
    /// Custom migration list. Versions must be strictly ascending and start above 0.
    /// Without a baseline, fresh stores are built by running every step.
    pub fn new(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut previous = 0;
        for m in &migrations {
            if m.version <= previous {
                return Err(MigrationError::NotAscending {
                    previous,
                    next: m.version,
                });
            }
            previous = m.version;
        }
        Ok(Self {
            migrations,
            baseline: None,
        })
    }

    /// Schema a fresh store is created at. Its version must equal [`Self::current_version`].
    pub fn with_baseline(mut self, schema: Schema) -> Self {
        self.baseline = Some(schema);
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest declared version, or 0 with no migrations.
    pub fn current_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Steps with `from < version <= to`, in ascending order.
    pub fn migrations_to_run(&self, from: u32, to: u32) -> &[Migration] {
        if to <= from {
            return &[];
        }
        let start = self.migrations.partition_point(|m| m.version <= from);
        let end = self.migrations.partition_point(|m| m.version <= to);
        &self.migrations[start..end]
    }

    /// Run every step in `(from, to]` against `tx`, stamping the schema
    /// version after each. Stops at the first failure.
    pub fn run(&self, tx: &mut MigrationTx, from: u32, to: u32) -> Result<u32, MigrationError> {
        let mut version = from;
        for m in self.migrations_to_run(from, to) {
            let old = tx.schema.clone();
            (m.migrate)(&old, tx).map_err(|reason| MigrationError::StepFailed {
                version: m.version,
                description: m.description.clone(),
                reason,
            })?;
            tx.schema.version = m.version;
            version = m.version;
            tracing::info!(version = m.version, description = %m.description, "migration applied");
        }
        Ok(version)
    }

    /// Compute the upgraded image for `state`, or `None` when it is already current.
    pub fn upgrade(&self, state: &StoreState) -> Result<Option<StoreState>, MigrationError> {
        let from = state.schema.version;
        let to = self.current_version();
        if from > to {
            return Err(MigrationError::UnsupportedVersion {
                found: from,
                supported: to,
            });
        }
        if from == to {
            return Ok(None);
        }

        let mut tx = MigrationTx {
            schema: state.schema.clone(),
            state: state.clone(),
        };
        match (&self.baseline, from) {
            (Some(baseline), 0) => {
                tracing::info!(version = to, "creating store at current schema version");
                tx.schema = baseline.clone();
                tx.schema.version = to;
            }
            _ => {
                tracing::info!(from, to, "upgrading store schema");
                self.run(&mut tx, from, to)?;
            }
        }
        tx.state.meta.insert("schema_version".to_string(), to.to_string());
        tx.state.schema = tx.schema;
        Ok(Some(tx.state))
    }
}
