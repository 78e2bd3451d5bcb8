/// In-memory key-range engine
///
/// Records live in ordered maps and every index is an ordered set of
/// (index key, primary key) pairs, so range scans in either direction are
/// native. Databases are held by a [`MemoryEngine`] registry the caller
/// owns; cloning the engine shares the registry.

use super::{
    check_scope, check_writable, plan_migration, Connected, EngineKind, Entry, Fetch,
    MigrationStep, Seek, StorageConnector, Transaction, TransactionFn, TransactionMode,
};
use crate::config::ConnectorConfig;
use crate::schema::{DatabaseSchema, IndexSchema, StoreSchema};
use crate::{Error, Key, KeyRange, Result, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;
use tracing::{debug, info};

type Pairs<'a> = Box<dyn Iterator<Item = (&'a Key, &'a Key)> + 'a>;

#[derive(Debug, Default)]
struct MemoryStore {
    records: BTreeMap<Key, Value>,
    /// index name -> (index key, primary key)
    indexes: HashMap<String, BTreeSet<(Key, Key)>>,
    /// Last generated key
    sequence: i64,
}

impl MemoryStore {
    fn new(schema: &StoreSchema) -> Self {
        Self {
            records: BTreeMap::new(),
            indexes: schema
                .indexes
                .iter()
                .map(|i| (i.name.clone(), BTreeSet::new()))
                .collect(),
            sequence: 0,
        }
    }

    /// Copy of this store under a new index set. Records and the key
    /// generator are kept; unique indexes are checked as entries are rebuilt.
    fn reindexed(&self, schema: &StoreSchema) -> Result<Self> {
        let mut store = Self {
            sequence: self.sequence,
            ..Self::new(schema)
        };
        for (primary_key, value) in &self.records {
            store.insert(schema, primary_key.clone(), value.clone())?;
        }
        Ok(store)
    }

    /// Stores and indexes a record, returning the one it replaced. Fails
    /// before changing anything if a unique index already holds one of its
    /// keys for another record.
    fn insert(&mut self, schema: &StoreSchema, primary_key: Key, value: Value) -> Result<Option<Value>> {
        for index in schema.indexes.iter().filter(|i| i.unique) {
            self.check_unique(index, &index.index_keys(&value), &primary_key)?;
        }
        let previous = self.remove(schema, &primary_key);
        self.store_record(schema, primary_key, value);
        Ok(previous)
    }

    fn store_record(&mut self, schema: &StoreSchema, primary_key: Key, value: Value) {
        for index in &schema.indexes {
            if let Some(set) = self.indexes.get_mut(&index.name) {
                set.extend(
                    index
                        .index_keys(&value)
                        .into_iter()
                        .map(|k| (k, primary_key.clone())),
                );
            }
        }
        self.records.insert(primary_key, value);
    }

    fn remove(&mut self, schema: &StoreSchema, primary_key: &Key) -> Option<Value> {
        let old = self.records.remove(primary_key)?;
        self.unindex(schema, primary_key, &old);
        Some(old)
    }

    fn index_set(&self, name: &str) -> Result<&BTreeSet<(Key, Key)>> {
        self.indexes
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("index '{}'", name)))
    }

    fn unindex(&mut self, schema: &StoreSchema, primary_key: &Key, value: &Value) {
        for index in &schema.indexes {
            if let Some(set) = self.indexes.get_mut(&index.name) {
                for key in index.index_keys(value) {
                    set.remove(&(key, primary_key.clone()));
                }
            }
        }
    }

    fn check_unique(&self, index: &IndexSchema, keys: &[Key], primary_key: &Key) -> Result<()> {
        let set = self.index_set(&index.name)?;
        for key in keys {
            let taken = set
                .range((Included((key.clone(), Key::MIN)), Unbounded))
                .take_while(|(k, _)| k == key)
                .any(|(_, pk)| pk != primary_key);
            if taken {
                return Err(Error::Constraint(format!(
                    "unique index '{}' already holds key {}",
                    index.name, key
                )));
            }
        }
        Ok(())
    }

    /// Ordered (key, primary key) pairs starting near `start`.
    fn pairs<'a>(&'a self, index: Option<&str>, start: Option<Key>, reverse: bool) -> Result<Pairs<'a>> {
        let pairs: Pairs<'a> = match index {
            None => {
                let records = &self.records;
                match (start, reverse) {
                    (None, false) => Box::new(records.keys().map(|k| (k, k))),
                    (None, true) => Box::new(records.keys().rev().map(|k| (k, k))),
                    (Some(start), false) => {
                        Box::new(records.range((Included(start), Unbounded)).map(|(k, _)| (k, k)))
                    }
                    (Some(start), true) => Box::new(
                        records
                            .range((Unbounded, Included(start)))
                            .rev()
                            .map(|(k, _)| (k, k)),
                    ),
                }
            }
            Some(name) => {
                let set = self.index_set(name)?;
                match (start, reverse) {
                    (None, false) => Box::new(set.iter().map(|(k, pk)| (k, pk))),
                    (None, true) => Box::new(set.iter().rev().map(|(k, pk)| (k, pk))),
                    (Some(start), false) => Box::new(
                        set.range((Included((start, Key::MIN)), Unbounded))
                            .map(|(k, pk)| (k, pk)),
                    ),
                    (Some(start), true) => Box::new(
                        set.range((Unbounded, Excluded((start.successor(), Key::MIN))))
                            .rev()
                            .map(|(k, pk)| (k, pk)),
                    ),
                }
            }
        };
        Ok(pairs)
    }

    /// Pairs inside `range` and past `seek`, in iteration order.
    fn select<'a>(
        &'a self,
        index: Option<&str>,
        range: Option<&'a KeyRange>,
        reverse: bool,
        seek: Option<&'a Seek>,
    ) -> Result<Pairs<'a>> {
        let pairs = self.pairs(index, start_key(range, seek, reverse), reverse)?;
        Ok(Box::new(
            pairs
                .take_while(move |(k, _)| match range {
                    Some(r) if reverse => !r.is_below(k),
                    Some(r) => !r.is_above(k),
                    None => true,
                })
                .filter(move |(k, pk)| {
                    range.map_or(true, |r| r.contains(k))
                        && seek.map_or(true, |s| s.admits(k, pk, reverse))
                }),
        ))
    }
}

/// Nearest key to begin scanning from: the tighter of the range bound and
/// the seek point on the starting side.
fn start_key(range: Option<&KeyRange>, seek: Option<&Seek>, reverse: bool) -> Option<Key> {
    let bound = range.and_then(|r| if reverse { r.upper() } else { r.lower() });
    let seek_key = seek.map(Seek::key);
    match (bound, seek_key) {
        (Some(b), Some(s)) if reverse => Some(b.min(s).clone()),
        (Some(b), Some(s)) => Some(b.max(s).clone()),
        (b, s) => b.or(s).cloned(),
    }
}

/// Undo record of one change made by a write transaction
#[derive(Debug)]
enum Undo {
    /// Record under `key` before the change, `None` if there was none
    Record {
        store: String,
        key: Key,
        previous: Option<Value>,
    },
    Sequence { store: String, previous: i64 },
    /// Contents of a store before it was cleared
    Cleared { store: String, data: MemoryStore },
}

#[derive(Debug, Default)]
struct MemoryDatabase {
    /// 0 until the first successful connect
    version: u32,
    schema: DatabaseSchema,
    stores: HashMap<String, MemoryStore>,
}

impl MemoryDatabase {
    fn store(&self, name: &str) -> Result<(&StoreSchema, &MemoryStore)> {
        let schema = self.schema.require_store(name)?;
        let store = self
            .stores
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("store '{}'", name)))?;
        Ok((schema, store))
    }

    fn store_mut(&mut self, name: &str) -> Result<(StoreSchema, &mut MemoryStore)> {
        let schema = self.schema.require_store(name)?.clone();
        let store = self
            .stores
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("store '{}'", name)))?;
        Ok((schema, store))
    }

    /// Replays a transaction journal backwards.
    fn roll_back(&mut self, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Record {
                    store,
                    key,
                    previous,
                } => {
                    if let Ok((schema, data)) = self.store_mut(&store) {
                        data.remove(&schema, &key);
                        if let Some(value) = previous {
                            data.store_record(&schema, key, value);
                        }
                    }
                }
                Undo::Sequence { store, previous } => {
                    if let Some(data) = self.stores.get_mut(&store) {
                        data.sequence = previous;
                    }
                }
                Undo::Cleared { store, data } => {
                    self.stores.insert(store, data);
                }
            }
        }
    }
}

/// Registry of in-memory databases, shared by cloning
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    databases: Arc<Mutex<HashMap<String, Arc<RwLock<MemoryDatabase>>>>>,
    read_only: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that refuses to create databases, as a storage prompt the
    /// user declined would.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes a database. Connectors still holding it keep their copy
    /// until they close. Returns whether the database existed.
    pub fn delete_database(&self, name: &str) -> bool {
        let removed = self.databases.lock().remove(name).is_some();
        if removed {
            info!(database = name, "deleted in-memory database");
        }
        removed
    }

    fn open(&self, name: &str) -> Result<Arc<RwLock<MemoryDatabase>>> {
        let mut databases = self.databases.lock();
        if let Some(database) = databases.get(name) {
            return Ok(Arc::clone(database));
        }
        if self.read_only {
            return Err(Error::Permission(format!(
                "engine refused to create database '{}'",
                name
            )));
        }
        let database = Arc::new(RwLock::new(MemoryDatabase::default()));
        databases.insert(name.to_string(), Arc::clone(&database));
        Ok(database)
    }
}

struct Session {
    name: String,
    database: Arc<RwLock<MemoryDatabase>>,
    version: u32,
}

/// Connector over a [`MemoryEngine`]
pub struct MemoryConnector {
    engine: MemoryEngine,
    config: ConnectorConfig,
    session: RwLock<Option<Session>>,
}

impl MemoryConnector {
    pub fn new(engine: MemoryEngine) -> Self {
        Self::with_config(engine, ConnectorConfig::default())
    }

    pub fn with_config(engine: MemoryEngine, config: ConnectorConfig) -> Self {
        Self {
            engine,
            config,
            session: RwLock::new(None),
        }
    }

    fn database(&self) -> Result<Arc<RwLock<MemoryDatabase>>> {
        self.session
            .read()
            .as_ref()
            .map(|s| Arc::clone(&s.database))
            .ok_or(Error::Closed)
    }
}

impl StorageConnector for MemoryConnector {
    fn engine(&self) -> EngineKind {
        EngineKind::Memory
    }

    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<Connected> {
        schema.validate()?;
        self.config.validate().map_err(Error::InvalidValue)?;

        let mut session = self.session.write();
        *session = None;

        let database = self.engine.open(name)?;
        let connected = {
            let mut db = database.write();
            let previous = if db.version == 0 { None } else { Some(db.version) };
            let plan = plan_migration(name, schema, &db.schema, previous, &self.config)?;

            // Rebuilds can fail on a unique index, so nothing changes until
            // every step is staged.
            let mut staged = Vec::with_capacity(plan.steps.len());
            for step in &plan.steps {
                match step {
                    MigrationStep::Create(store) | MigrationStep::Recreate { store, .. } => {
                        debug!(database = name, store = %store.name, "creating store");
                        staged.push((store.name.clone(), Some(MemoryStore::new(store))));
                    }
                    MigrationStep::Reindex { store, .. } => {
                        let rebuilt = match db.stores.get(&store.name) {
                            Some(old) => old.reindexed(store)?,
                            None => MemoryStore::new(store),
                        };
                        debug!(database = name, store = %store.name, records = rebuilt.records.len(), "reindexed store");
                        staged.push((store.name.clone(), Some(rebuilt)));
                    }
                    MigrationStep::Drop(store) => staged.push((store.clone(), None)),
                }
            }
            for (store, data) in staged {
                match data {
                    Some(data) => db.stores.insert(store, data),
                    None => db.stores.remove(&store),
                };
            }
            db.schema = plan.schema;
            db.version = plan.connected.version;
            plan.connected
        };

        info!(
            database = name,
            version = connected.version,
            previous = ?connected.previous_version,
            "connected in-memory database"
        );
        *session = Some(Session {
            name: name.to_string(),
            database,
            version: connected.version,
        });
        Ok(connected)
    }

    fn get_schema(&self) -> Result<DatabaseSchema> {
        let database = self.database()?;
        let db = database.read();
        Ok(db.schema.clone())
    }

    fn do_transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
        f: &mut TransactionFn<'_>,
    ) -> Result<()> {
        let database = self.database()?;
        let scope: Vec<String> = stores.iter().map(|s| s.to_string()).collect();

        if mode == TransactionMode::ReadOnly {
            let db = database.read();
            for store in &scope {
                db.store(store)?;
            }
            let mut tx = MemoryTransaction {
                access: Access::Shared(&*db),
                scope,
                mode,
                journal: Vec::new(),
            };
            return f(&mut tx);
        }

        let mut db = database.write();
        for store in &scope {
            db.store(store)?;
        }

        let (result, journal) = {
            let mut tx = MemoryTransaction {
                access: Access::Exclusive(&mut *db),
                scope,
                mode,
                journal: Vec::new(),
            };
            let result = f(&mut tx);
            (result, tx.journal)
        };

        if result.is_err() {
            debug!(changes = journal.len(), "rolling back in-memory transaction");
            db.roll_back(journal);
        }
        result
    }

    fn close(&self) {
        if let Some(session) = self.session.write().take() {
            debug!(database = %session.name, "closed in-memory database");
        }
    }

    fn is_ready(&self) -> bool {
        self.session.read().is_some()
    }

    fn version(&self) -> Option<u32> {
        self.session.read().as_ref().map(|s| s.version)
    }

    fn delete_database(&self, name: &str) -> Result<bool> {
        let mut session = self.session.write();
        if session.as_ref().map_or(false, |s| s.name == name) {
            *session = None;
        }
        Ok(self.engine.delete_database(name))
    }
}

enum Access<'a> {
    Shared(&'a MemoryDatabase),
    Exclusive(&'a mut MemoryDatabase),
}

struct MemoryTransaction<'a> {
    access: Access<'a>,
    scope: Vec<String>,
    mode: TransactionMode,
    /// Changes to undo if the transaction fails
    journal: Vec<Undo>,
}

impl MemoryTransaction<'_> {
    fn db(&self) -> &MemoryDatabase {
        match &self.access {
            Access::Shared(db) => db,
            Access::Exclusive(db) => &**db,
        }
    }

    fn db_mut(&mut self) -> Result<&mut MemoryDatabase> {
        check_writable(self.mode)?;
        match &mut self.access {
            Access::Exclusive(db) => Ok(&mut **db),
            Access::Shared(_) => Err(Error::InvalidState(
                "write attempted in a read-only transaction".to_string(),
            )),
        }
    }

    fn store(&self, name: &str) -> Result<(&StoreSchema, &MemoryStore)> {
        check_scope(&self.scope, name)?;
        self.db().store(name)
    }

    fn store_mut(&mut self, name: &str) -> Result<(StoreSchema, &mut MemoryStore)> {
        check_scope(&self.scope, name)?;
        self.db_mut()?.store_mut(name)
    }

    fn write(&mut self, store: &str, mut value: Value, key: Option<Key>, overwrite: bool) -> Result<Key> {
        let (schema, data) = self.store_mut(store)?;
        let (primary_key, sequence) = schema.resolve_key(&mut value, key, data.sequence)?;
        if !overwrite && data.records.contains_key(&primary_key) {
            return Err(Error::Constraint(format!(
                "store '{}' already holds key {}",
                store, primary_key
            )));
        }

        let previous = data.insert(&schema, primary_key.clone(), value)?;
        let previous_sequence = std::mem::replace(&mut data.sequence, sequence);

        self.journal.push(Undo::Record {
            store: store.to_string(),
            key: primary_key.clone(),
            previous,
        });
        if previous_sequence != sequence {
            self.journal.push(Undo::Sequence {
                store: store.to_string(),
                previous: previous_sequence,
            });
        }
        Ok(primary_key)
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        let (_, data) = self.store(store)?;
        Ok(data.records.get(key).cloned())
    }

    fn put(&mut self, store: &str, value: Value, key: Option<Key>) -> Result<Key> {
        self.write(store, value, key, true)
    }

    fn add(&mut self, store: &str, value: Value, key: Option<Key>) -> Result<Key> {
        self.write(store, value, key, false)
    }

    fn delete(&mut self, store: &str, range: &KeyRange) -> Result<usize> {
        let (schema, data) = self.store_mut(store)?;
        let doomed: Vec<Key> = data
            .select(None, Some(range), false, None)?
            .map(|(k, _)| k.clone())
            .collect();
        let mut undo = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(old) = data.remove(&schema, &key) {
                undo.push(Undo::Record {
                    store: store.to_string(),
                    key,
                    previous: Some(old),
                });
            }
        }
        let removed = undo.len();
        self.journal.extend(undo);
        Ok(removed)
    }

    fn clear(&mut self, store: &str) -> Result<()> {
        let (schema, data) = self.store_mut(store)?;
        let emptied = MemoryStore {
            sequence: data.sequence,
            ..MemoryStore::new(&schema)
        };
        let old = std::mem::replace(data, emptied);
        self.journal.push(Undo::Cleared {
            store: store.to_string(),
            data: old,
        });
        Ok(())
    }

    fn count(
        &self,
        store: &str,
        index: Option<&str>,
        range: Option<&KeyRange>,
        unique: bool,
    ) -> Result<usize> {
        let (_, data) = self.store(store)?;
        let pairs = data.select(index, range, false, None)?;
        if !unique {
            return Ok(pairs.count());
        }
        let mut last: Option<&Key> = None;
        let mut distinct = 0;
        for (key, _) in pairs {
            if last != Some(key) {
                distinct += 1;
                last = Some(key);
            }
        }
        Ok(distinct)
    }

    fn fetch(&self, request: &Fetch<'_>) -> Result<Vec<Entry>> {
        let (_, data) = self.store(request.store)?;
        let pairs = data.select(request.index, request.range, request.reverse, request.seek)?;
        let mut entries = Vec::with_capacity(request.limit.min(64));
        for (key, primary_key) in pairs.take(request.limit) {
            let value = if request.with_values {
                data.records.get(primary_key).cloned()
            } else {
                None
            };
            entries.push(Entry {
                key: key.clone(),
                primary_key: primary_key.clone(),
                value,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DatabaseSchema {
        DatabaseSchema::new().with_store(
            StoreSchema::new("st")
                .with_key_path("id")
                .with_index(IndexSchema::new("value", "value"))
                .with_index(IndexSchema::new("tags", "tags").multi_entry())
                .with_index(IndexSchema::new("code", "code").unique()),
        )
    }

    fn record(id: i32, value: i32, tags: &[&str]) -> Value {
        Value::from_json(serde_json::json!({ "id": id, "value": value, "tags": tags }))
    }

    fn connected() -> MemoryConnector {
        let connector = MemoryConnector::new(MemoryEngine::new());
        connector.connect("test", &schema()).unwrap();
        connector
    }

    fn write(connector: &MemoryConnector, f: impl FnOnce(&mut dyn Transaction) -> Result<()>) -> Result<()> {
        let mut f = Some(f);
        connector.do_transaction(&["st"], TransactionMode::ReadWrite, &mut |tx| match f.take() {
            Some(f) => f(tx),
            None => Ok(()),
        })
    }

    fn fetch_all(connector: &MemoryConnector, index: Option<&str>, reverse: bool) -> Vec<(Key, Key)> {
        let mut out = Vec::new();
        connector
            .do_transaction(&["st"], TransactionMode::ReadOnly, &mut |tx| {
                let entries = tx.fetch(&Fetch {
                    store: "st",
                    index,
                    range: None,
                    reverse,
                    seek: None,
                    limit: usize::MAX,
                    with_values: false,
                })?;
                out = entries.into_iter().map(|e| (e.key, e.primary_key)).collect();
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn test_connect_reports_versions() {
        let engine = MemoryEngine::new();
        let connector = MemoryConnector::new(engine.clone());
        let first = connector.connect("db", &schema()).unwrap();
        assert_eq!(first, Connected { previous_version: None, version: 1 });

        let again = MemoryConnector::new(engine);
        let second = again.connect("db", &schema()).unwrap();
        assert_eq!(second, Connected { previous_version: Some(1), version: 1 });
    }

    #[test]
    fn test_read_only_engine_denies_creation() {
        let connector = MemoryConnector::new(MemoryEngine::read_only());
        let err = connector.connect("db", &schema()).unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert!(!connector.is_ready());
    }

    #[test]
    fn test_multi_entry_index_entries() {
        let connector = connected();
        write(&connector, |tx| {
            tx.put("st", record(1, 3, &["a", "b"]), None)?;
            tx.put("st", record(2, 2, &["b"]), None)?;
            Ok(())
        })
        .unwrap();

        let tags = fetch_all(&connector, Some("tags"), false);
        assert_eq!(
            tags,
            vec![
                (Key::from("a"), Key::from(1)),
                (Key::from("b"), Key::from(1)),
                (Key::from("b"), Key::from(2)),
            ]
        );
    }

    #[test]
    fn test_put_replaces_index_entries() {
        let connector = connected();
        write(&connector, |tx| {
            tx.put("st", record(1, 3, &["a"]), None)?;
            tx.put("st", record(1, 5, &["z"]), None)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fetch_all(&connector, Some("value"), false), vec![(Key::from(5), Key::from(1))]);
        assert_eq!(fetch_all(&connector, Some("tags"), false), vec![(Key::from("z"), Key::from(1))]);
    }

    #[test]
    fn test_unique_violation_rolls_back() {
        let connector = connected();
        let code = |id: i32| Value::from_json(serde_json::json!({ "id": id, "code": "X" }));
        write(&connector, |tx| tx.put("st", code(1), None).map(|_| ())).unwrap();

        let err = write(&connector, |tx| {
            tx.put("st", record(7, 1, &[]), None)?;
            tx.put("st", code(2), None)?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
        assert_eq!(fetch_all(&connector, None, false), vec![(Key::from(1), Key::from(1))]);
    }

    #[test]
    fn test_reverse_fetch_with_seek() {
        let connector = connected();
        write(&connector, |tx| {
            for id in 0..6 {
                tx.put("st", record(id, id % 2, &[]), None)?;
            }
            Ok(())
        })
        .unwrap();

        let mut keys = Vec::new();
        connector
            .do_transaction(&["st"], TransactionMode::ReadOnly, &mut |tx| {
                let seek = Seek::Entry {
                    key: Key::from(1),
                    primary_key: Key::from(3),
                    inclusive: false,
                };
                let entries = tx.fetch(&Fetch {
                    store: "st",
                    index: Some("value"),
                    range: None,
                    reverse: true,
                    seek: Some(&seek),
                    limit: 3,
                    with_values: false,
                })?;
                keys = entries.into_iter().map(|e| e.primary_key).collect();
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec![Key::from(1), Key::from(4), Key::from(2)]);
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let connector = connected();
        let err = connector
            .do_transaction(&["st"], TransactionMode::ReadOnly, &mut |tx| {
                tx.put("st", record(1, 1, &[]), None).map(|_| ())
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_scope_enforced() {
        let connector = connected();
        let err = connector
            .do_transaction(&["missing"], TransactionMode::ReadOnly, &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_count_unique() {
        let connector = connected();
        write(&connector, |tx| {
            tx.put("st", record(1, 3, &["a", "b"]), None)?;
            tx.put("st", record(2, 3, &["b", "c"]), None)?;
            Ok(())
        })
        .unwrap();
        connector
            .do_transaction(&["st"], TransactionMode::ReadOnly, &mut |tx| {
                assert_eq!(tx.count("st", Some("tags"), None, false)?, 4);
                assert_eq!(tx.count("st", Some("tags"), None, true)?, 3);
                assert_eq!(tx.count("st", Some("value"), None, true)?, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_journal_undoes_every_kind_of_write() {
        let connector = connected();
        write(&connector, |tx| {
            tx.put("st", record(1, 3, &["a"]), None)?;
            tx.put("st", record(2, 2, &["b"]), None)?;
            Ok(())
        })
        .unwrap();

        let err = write(&connector, |tx| {
            tx.put("st", record(1, 9, &["z"]), None)?;
            tx.delete("st", &KeyRange::only(2)?)?;
            tx.put("st", record(5, 5, &["q"]), None)?;
            tx.clear("st")?;
            tx.put("st", record(6, 6, &[]), None)?;
            Err(Error::InvalidState("abort".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        assert_eq!(
            fetch_all(&connector, None, false),
            vec![(Key::from(1), Key::from(1)), (Key::from(2), Key::from(2))]
        );
        assert_eq!(
            fetch_all(&connector, Some("value"), false),
            vec![(Key::from(2), Key::from(2)), (Key::from(3), Key::from(1))]
        );
        assert_eq!(
            fetch_all(&connector, Some("tags"), false),
            vec![(Key::from("a"), Key::from(1)), (Key::from("b"), Key::from(2))]
        );
    }

    #[test]
    fn test_rolled_back_key_generator() {
        let connector = MemoryConnector::new(MemoryEngine::new());
        let schema = DatabaseSchema::new().with_store(StoreSchema::new("notes").with_auto_increment());
        connector.connect("db", &schema).unwrap();
        let put = |fail: bool| {
            connector.do_transaction(&["notes"], TransactionMode::ReadWrite, &mut |tx| {
                let key = tx.put("notes", Value::from("n"), None)?;
                if fail {
                    return Err(Error::InvalidState(format!("abort after {}", key)));
                }
                Ok(())
            })
        };
        put(false).unwrap();
        put(true).unwrap_err();
        put(false).unwrap();

        let mut keys = Vec::new();
        connector
            .do_transaction(&["notes"], TransactionMode::ReadOnly, &mut |tx| {
                let request = Fetch {
                    store: "notes",
                    index: None,
                    range: None,
                    reverse: false,
                    seek: None,
                    limit: usize::MAX,
                    with_values: false,
                };
                keys = tx.fetch(&request)?.into_iter().map(|e| e.primary_key).collect();
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec![Key::from(1), Key::from(2)]);
    }

    #[test]
    fn test_add_refuses_existing_key() {
        let connector = connected();
        write(&connector, |tx| tx.add("st", record(1, 3, &["a"]), None).map(|_| ())).unwrap();
        let err = write(&connector, |tx| tx.add("st", record(1, 4, &["b"]), None).map(|_| ())).unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
        assert_eq!(fetch_all(&connector, Some("value"), false), vec![(Key::from(3), Key::from(1))]);
    }

    #[test]
    fn test_index_change_keeps_records() {
        let engine = MemoryEngine::new();
        let connector = MemoryConnector::new(engine.clone());
        connector.connect("db", &schema()).unwrap();
        write(&connector, |tx| {
            tx.put("st", record(1, 3, &["a"]), None)?;
            tx.put("st", record(2, 3, &["b"]), None)?;
            Ok(())
        })
        .unwrap();
        connector.close();

        let mut changed = schema();
        changed.stores[0].indexes.retain(|i| i.name != "tags");
        changed.stores[0].indexes.push(IndexSchema::new("by_tags", "tags").multi_entry());
        let connected = connector.connect("db", &changed).unwrap();
        assert_eq!(connected.version, 2);
        assert_eq!(fetch_all(&connector, None, false).len(), 2);
        assert_eq!(
            fetch_all(&connector, Some("by_tags"), false),
            vec![(Key::from("a"), Key::from(1)), (Key::from("b"), Key::from(2))]
        );
        connector.close();

        // Two records share value 3, so a unique index cannot be built
        let mut unique = changed.clone();
        unique.stores[0].indexes.retain(|i| i.name != "value");
        unique.stores[0].indexes.push(IndexSchema::new("value", "value").unique());
        assert!(matches!(connector.connect("db", &unique), Err(Error::Constraint(_))));
        assert!(!connector.is_ready());

        let again = MemoryConnector::new(engine);
        assert_eq!(again.connect("db", &changed).unwrap().version, 2);
        assert_eq!(fetch_all(&again, Some("value"), false).len(), 2);
    }

    #[test]
    fn test_closed_connector() {
        let connector = connected();
        connector.close();
        connector.close();
        assert!(!connector.is_ready());
        assert!(matches!(connector.get_schema(), Err(Error::Closed)));
    }
}
