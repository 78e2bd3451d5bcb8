/// Storage connectors
///
/// A connector owns the physical engine handle of one database, reconciles
/// its structure with a desired schema on connect, and lends transactions to
/// callers. Everything above this module is engine-agnostic.

pub mod memory;
pub mod sqlite;

use crate::config::{ConflictPolicy, ConnectorConfig};
use crate::schema::{DatabaseSchema, StoreSchema};
use crate::{Error, Key, KeyRange, Result, Value};
use std::cmp::Ordering;
use tracing::{info, warn};

pub use memory::{MemoryConnector, MemoryEngine};
pub use sqlite::SqliteConnector;

/// Physical engine behind a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Structural changes; runs exclusively
    VersionChange,
}

impl TransactionMode {
    pub fn is_writable(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

/// Outcome of a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// Version found on disk, `None` when the database was created
    pub previous_version: Option<u32>,
    pub version: u32,
}

/// One (effective key, primary key, value) triple from a store or index
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Key,
    pub primary_key: Key,
    /// Present when the fetch asked for values
    pub value: Option<Value>,
}

/// Position to resume a fetch from, relative to the iteration direction
#[derive(Debug, Clone, PartialEq)]
pub enum Seek {
    /// First entry whose effective key is at (or past) `key`
    Key { key: Key, inclusive: bool },
    /// First entry at (or past) `(key, primary_key)`
    Entry {
        key: Key,
        primary_key: Key,
        inclusive: bool,
    },
}

impl Seek {
    /// True if the entry lies at or beyond this seek point when iterating
    /// in the given direction.
    pub fn admits(&self, key: &Key, primary_key: &Key, reverse: bool) -> bool {
        let (ordering, inclusive) = match self {
            Seek::Key { key: target, inclusive } => (key.cmp(target), *inclusive),
            Seek::Entry {
                key: target,
                primary_key: target_pk,
                inclusive,
            } => (
                key.cmp(target).then_with(|| primary_key.cmp(target_pk)),
                *inclusive,
            ),
        };
        let ordering = if reverse { ordering.reverse() } else { ordering };
        match ordering {
            Ordering::Greater => true,
            Ordering::Equal => inclusive,
            Ordering::Less => false,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            Seek::Key { key, .. } | Seek::Entry { key, .. } => key,
        }
    }
}

/// A bounded, ordered read request against a store or index
#[derive(Debug, Clone, Copy)]
pub struct Fetch<'a> {
    pub store: &'a str,
    pub index: Option<&'a str>,
    pub range: Option<&'a KeyRange>,
    pub reverse: bool,
    pub seek: Option<&'a Seek>,
    pub limit: usize,
    pub with_values: bool,
}

/// Transaction handle lent by a connector for the duration of one callback
///
/// Reads take `&self` so several cursors can share one transaction.
pub trait Transaction {
    fn mode(&self) -> TransactionMode;

    fn get(&self, store: &str, key: &Key) -> Result<Option<Value>>;

    /// Writes a record, replacing any record under the same key. Returns
    /// the primary key (derived, explicit or generated).
    fn put(&mut self, store: &str, value: Value, key: Option<Key>) -> Result<Key>;

    /// Writes a record only if no record holds its key yet; otherwise
    /// fails with `Constraint` and leaves the store untouched.
    fn add(&mut self, store: &str, value: Value, key: Option<Key>) -> Result<Key>;

    /// Deletes every record whose primary key lies in `range`.
    fn delete(&mut self, store: &str, range: &KeyRange) -> Result<usize>;

    fn clear(&mut self, store: &str) -> Result<()>;

    /// Exact number of entries in the store or index within `range`;
    /// with `unique`, the number of distinct effective keys.
    fn count(
        &self,
        store: &str,
        index: Option<&str>,
        range: Option<&KeyRange>,
        unique: bool,
    ) -> Result<usize>;

    /// Up to `limit` entries in (key, primary key) order, honoring the
    /// range, the direction and the seek point.
    fn fetch(&self, request: &Fetch<'_>) -> Result<Vec<Entry>>;
}

/// Callback run inside a transaction
pub type TransactionFn<'f> = dyn FnMut(&mut dyn Transaction) -> Result<()> + 'f;

/// Engine-specific database connection
pub trait StorageConnector: Send + Sync {
    fn engine(&self) -> EngineKind;

    fn config(&self) -> &ConnectorConfig;

    /// Opens (creating if absent) the named database and reconciles it with
    /// `schema`. On failure the connector is left closed.
    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<Connected>;

    /// Rebuilds the schema from the live engine structures.
    fn get_schema(&self) -> Result<DatabaseSchema>;

    /// Runs `f` in a transaction scoped to `stores`. Commits if `f` returns
    /// `Ok`, rolls back every write otherwise.
    fn do_transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
        f: &mut TransactionFn<'_>,
    ) -> Result<()>;

    /// Releases the engine handle. Idempotent.
    fn close(&self);

    fn is_ready(&self) -> bool;

    /// Version established by the last successful connect.
    fn version(&self) -> Option<u32>;

    /// Removes the named database and all its data, closing it first if it
    /// is the connected one. Returns false if nothing existed.
    fn delete_database(&self, name: &str) -> Result<bool>;
}

/// One structural change applied during connect
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MigrationStep {
    Create(StoreSchema),
    /// Only indexes changed; records are kept and re-indexed
    Reindex { store: StoreSchema, reason: String },
    Recreate { store: StoreSchema, reason: String },
    Drop(String),
}

/// Reconciliation plan shared by the connectors
#[derive(Debug, Clone)]
pub(crate) struct MigrationPlan {
    pub steps: Vec<MigrationStep>,
    /// Desired stores plus adopted ones, at the resulting version
    pub schema: DatabaseSchema,
    pub connected: Connected,
}

/// Diffs the desired schema against the physical one.
pub(crate) fn plan_migration(
    name: &str,
    desired: &DatabaseSchema,
    existing: &DatabaseSchema,
    previous_version: Option<u32>,
    config: &ConnectorConfig,
) -> Result<MigrationPlan> {
    if let (Some(requested), Some(previous)) = (desired.version, previous_version) {
        if requested < previous {
            return Err(Error::InvalidValue(format!(
                "database '{}' is at version {}, cannot open at lower version {}",
                name, previous, requested
            )));
        }
    }

    let mut steps = Vec::new();
    let mut schema = DatabaseSchema {
        version: None,
        stores: desired.stores.clone(),
    };

    for store in &desired.stores {
        match existing.store(&store.name) {
            None => steps.push(MigrationStep::Create(store.clone())),
            Some(physical) => {
                if let Some(reason) = store.difference(physical) {
                    if config.on_schema_conflict == ConflictPolicy::Reject {
                        return Err(Error::SchemaConflict(format!(
                            "store '{}': {}",
                            store.name, reason
                        )));
                    }
                    if store.same_primary_key(physical) {
                        info!(
                            database = name,
                            store = %store.name,
                            %reason,
                            "store indexes changed, rebuilding them"
                        );
                        steps.push(MigrationStep::Reindex {
                            store: store.clone(),
                            reason,
                        });
                        continue;
                    }
                    warn!(
                        database = name,
                        store = %store.name,
                        %reason,
                        "store structure changed, dropping and recreating it"
                    );
                    steps.push(MigrationStep::Recreate {
                        store: store.clone(),
                        reason,
                    });
                }
            }
        }
    }

    for physical in &existing.stores {
        if desired.store(&physical.name).is_some() {
            continue;
        }
        if config.strict_schema {
            warn!(database = name, store = %physical.name, "dropping store absent from schema");
            steps.push(MigrationStep::Drop(physical.name.clone()));
        } else {
            info!(database = name, store = %physical.name, "adopting store absent from schema");
            schema.stores.push(physical.clone());
        }
    }

    let version = match (previous_version, desired.version) {
        (None, requested) => requested.unwrap_or(1),
        (Some(_), Some(requested)) => requested,
        (Some(previous), None) if !steps.is_empty() => previous + 1,
        (Some(previous), None) => previous,
    };
    schema.version = Some(version);

    Ok(MigrationPlan {
        steps,
        schema,
        connected: Connected {
            previous_version,
            version,
        },
    })
}

/// Fails with `NotFound` unless `store` is part of the transaction scope.
pub(crate) fn check_scope(scope: &[String], store: &str) -> Result<()> {
    if scope.iter().any(|s| s == store) {
        Ok(())
    } else {
        Err(Error::NotFound(format!(
            "store '{}' is not in the transaction scope",
            store
        )))
    }
}

pub(crate) fn check_writable(mode: TransactionMode) -> Result<()> {
    if mode.is_writable() {
        Ok(())
    } else {
        Err(Error::InvalidState(
            "write attempted in a read-only transaction".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IndexSchema;

    fn animals() -> StoreSchema {
        StoreSchema::new("animals")
            .with_key_path("id")
            .with_index(IndexSchema::new("color", "color"))
    }

    #[test]
    fn test_seek_admits() {
        let seek = Seek::Key {
            key: Key::from(5),
            inclusive: false,
        };
        assert!(!seek.admits(&Key::from(5), &Key::from(1), false));
        assert!(seek.admits(&Key::from(6), &Key::from(1), false));
        assert!(seek.admits(&Key::from(4), &Key::from(1), true));

        let entry = Seek::Entry {
            key: Key::from("spots"),
            primary_key: Key::from(4),
            inclusive: true,
        };
        assert!(entry.admits(&Key::from("spots"), &Key::from(4), false));
        assert!(!entry.admits(&Key::from("spots"), &Key::from(2), false));
        assert!(entry.admits(&Key::from("spots"), &Key::from(2), true));
    }

    #[test]
    fn test_plan_new_database() {
        let desired = DatabaseSchema::new().with_store(animals());
        let plan =
            plan_migration("zoo", &desired, &DatabaseSchema::new(), None, &ConnectorConfig::default())
                .unwrap();
        assert_eq!(plan.steps, vec![MigrationStep::Create(animals())]);
        assert_eq!(plan.connected, Connected { previous_version: None, version: 1 });
    }

    #[test]
    fn test_plan_unchanged_keeps_version() {
        let desired = DatabaseSchema::new().with_store(animals());
        let plan = plan_migration("zoo", &desired, &desired, Some(3), &ConnectorConfig::default())
            .unwrap();
        assert!(plan.steps.is_empty());
        assert_eq!(plan.connected.version, 3);
    }

    #[test]
    fn test_plan_recreate_bumps_version() {
        let existing = DatabaseSchema::new().with_store(animals());
        let desired = DatabaseSchema::new().with_store(animals().with_key_path("name"));
        let plan = plan_migration("zoo", &desired, &existing, Some(1), &ConnectorConfig::default())
            .unwrap();
        assert!(matches!(plan.steps[0], MigrationStep::Recreate { .. }));
        assert_eq!(plan.connected.version, 2);

        let reject = ConnectorConfig::new().with_conflict_policy(ConflictPolicy::Reject);
        assert!(matches!(
            plan_migration("zoo", &desired, &existing, Some(1), &reject),
            Err(Error::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_plan_index_change_reindexes() {
        let existing = DatabaseSchema::new().with_store(animals());
        let desired = DatabaseSchema::new()
            .with_store(animals().with_index(IndexSchema::new("legs", "legs")));
        let plan = plan_migration("zoo", &desired, &existing, Some(1), &ConnectorConfig::default())
            .unwrap();
        assert!(matches!(&plan.steps[..], [MigrationStep::Reindex { .. }]));
        assert_eq!(plan.connected.version, 2);

        let reject = ConnectorConfig::new().with_conflict_policy(ConflictPolicy::Reject);
        assert!(matches!(
            plan_migration("zoo", &desired, &existing, Some(1), &reject),
            Err(Error::SchemaConflict(_))
        ));
    }

    #[test]
    fn test_plan_unknown_store_strict_or_adopted() {
        let existing = DatabaseSchema::new()
            .with_store(animals())
            .with_store(StoreSchema::new("legacy"));
        let desired = DatabaseSchema::new().with_store(animals());

        let strict = plan_migration("zoo", &desired, &existing, Some(1), &ConnectorConfig::default())
            .unwrap();
        assert_eq!(strict.steps, vec![MigrationStep::Drop("legacy".to_string())]);

        let editable = ConnectorConfig::new().editable();
        let adopted = plan_migration("zoo", &desired, &existing, Some(1), &editable).unwrap();
        assert!(adopted.steps.is_empty());
        assert!(adopted.schema.store("legacy").is_some());
        assert_eq!(adopted.connected.version, 1);
    }

    #[test]
    fn test_plan_rejects_downgrade() {
        let desired = DatabaseSchema::new().with_version(2);
        assert!(matches!(
            plan_migration("zoo", &desired, &DatabaseSchema::new(), Some(5), &ConnectorConfig::default()),
            Err(Error::InvalidValue(_))
        ));
    }
}
