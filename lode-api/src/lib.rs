use lode_core::connector::sqlite::delete_database_file;
use lode_core::connector::TransactionFn;
use lode_core::{algo, cursor, Connected, EngineKind, Entry, Error, Key, KeyRange, Result, Value};
use lode_core::{
    DatabaseSchema, MemoryConnector, MemoryEngine, SqliteConnector, StorageConnector, Transaction,
    TransactionMode,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

pub use lode_core::{
    Completion, ConflictPolicy, ConnectorConfig, Flow, IndexSchema, KeyPath, NestedLoop, Query,
    ScanStats, Sink, Solver, SortedMerge, StoreSchema, ZigzagMerge,
};
pub use lode_core::{Error as LodeError, Key as LodeKey, Value as LodeValue};

pub mod streamer;
pub use streamer::Streamer;

/// Lode database handle
pub struct Database {
    name: String,
    connector: Box<dyn StorageConnector>,
    connected: Connected,
}

impl Database {
    /// Open (creating if absent) a SQLite database stored in `dir`
    pub fn open_sqlite(dir: impl AsRef<Path>, name: &str, schema: &DatabaseSchema) -> Result<Self> {
        Self::open_sqlite_with_config(dir, name, schema, ConnectorConfig::default())
    }

    pub fn open_sqlite_with_config(
        dir: impl AsRef<Path>,
        name: &str,
        schema: &DatabaseSchema,
        config: ConnectorConfig,
    ) -> Result<Self> {
        let connector = SqliteConnector::with_config(dir.as_ref(), config);
        Self::with_connector(Box::new(connector), name, schema)
    }

    /// Open a database held by an in-memory engine
    pub fn open_in_memory(engine: &MemoryEngine, name: &str, schema: &DatabaseSchema) -> Result<Self> {
        Self::with_connector(Box::new(MemoryConnector::new(engine.clone())), name, schema)
    }

    /// Connect through any connector
    pub fn with_connector(
        connector: Box<dyn StorageConnector>,
        name: &str,
        schema: &DatabaseSchema,
    ) -> Result<Self> {
        let connected = connector.connect(name, schema)?;
        info!(
            database = name,
            engine = ?connector.engine(),
            version = connected.version,
            "database opened"
        );
        Ok(Self {
            name: name.to_string(),
            connector,
            connected,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> EngineKind {
        self.connector.engine()
    }

    /// Versions reported by the connect that opened this handle
    pub fn connected(&self) -> Connected {
        self.connected
    }

    pub fn version(&self) -> Option<u32> {
        self.connector.version()
    }

    pub fn is_ready(&self) -> bool {
        self.connector.is_ready()
    }

    /// Schema rebuilt from the live storage
    pub fn schema(&self) -> Result<DatabaseSchema> {
        self.connector.get_schema()
    }

    /// Close the connection. Later calls fail with `Closed`.
    pub fn close(&self) {
        self.connector.close();
    }

    /// Close and delete this database with all its data
    pub fn delete_database(self) -> Result<bool> {
        let deleted = self.connector.delete_database(&self.name)?;
        info!(database = %self.name, deleted, "database deleted");
        Ok(deleted)
    }

    fn prefetch(&self) -> usize {
        self.connector.config().cursor_prefetch
    }

    fn transact<T>(
        &self,
        stores: &[&str],
        mode: TransactionMode,
        f: impl FnOnce(&mut dyn Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut f = Some(f);
        let mut out = None;
        let callback: &mut TransactionFn<'_> = &mut |tx| {
            let f = f
                .take()
                .ok_or_else(|| Error::Internal("transaction callback ran twice".to_string()))?;
            out = Some(f(tx)?);
            Ok(())
        };
        self.connector.do_transaction(stores, mode, callback)?;
        out.ok_or_else(|| Error::Internal("transaction callback did not run".to_string()))
    }

    /// Run `f` in a read-only transaction over `stores`
    pub fn read<T>(&self, stores: &[&str], f: impl FnOnce(&dyn Transaction) -> Result<T>) -> Result<T> {
        self.transact(stores, TransactionMode::ReadOnly, |tx| f(&*tx))
    }

    /// Run `f` in a read-write transaction over `stores`. Every write is
    /// rolled back if `f` fails.
    pub fn write<T>(&self, stores: &[&str], f: impl FnOnce(&mut dyn Transaction) -> Result<T>) -> Result<T> {
        self.transact(stores, TransactionMode::ReadWrite, f)
    }

    /// Put a record, deriving or generating its key
    pub fn put(&self, store: &str, value: Value) -> Result<Key> {
        self.write(&[store], |tx| tx.put(store, value, None))
    }

    /// Put a record under an out-of-line key
    pub fn put_with_key(&self, store: &str, value: Value, key: impl Into<Key>) -> Result<Key> {
        let key = key.into();
        self.write(&[store], |tx| tx.put(store, value, Some(key)))
    }

    /// Put several records in one transaction
    pub fn put_all(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        let count = values.len();
        let keys = self.write(&[store], |tx| {
            values
                .into_iter()
                .map(|value| tx.put(store, value, None))
                .collect::<Result<Vec<_>>>()
        })?;
        debug!(store, count, "put batch");
        Ok(keys)
    }

    /// Add a record that must not exist yet. Fails with `Constraint`
    /// when its key is already taken.
    pub fn add(&self, store: &str, value: Value) -> Result<Key> {
        self.write(&[store], |tx| tx.add(store, value, None))
    }

    /// Add several records in one transaction. One taken key rolls back
    /// the whole batch.
    pub fn add_all(&self, store: &str, values: Vec<Value>) -> Result<Vec<Key>> {
        let count = values.len();
        let keys = self.write(&[store], |tx| {
            values
                .into_iter()
                .map(|value| tx.add(store, value, None))
                .collect::<Result<Vec<_>>>()
        })?;
        debug!(store, count, "add batch");
        Ok(keys)
    }

    /// Get a record by primary key
    pub fn get(&self, store: &str, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        self.read(&[store], |tx| tx.get(store, &key))
    }

    /// Get several records in one transaction, `None` where absent
    pub fn get_all(&self, store: &str, keys: &[Key]) -> Result<Vec<Option<Value>>> {
        self.read(&[store], |tx| keys.iter().map(|k| tx.get(store, k)).collect())
    }

    /// Delete a record by primary key
    pub fn delete(&self, store: &str, key: impl Into<Key>) -> Result<usize> {
        let range = KeyRange::only(key)?;
        self.delete_range(store, &range)
    }

    /// Delete every record whose primary key lies in `range`
    pub fn delete_range(&self, store: &str, range: &KeyRange) -> Result<usize> {
        self.write(&[store], |tx| tx.delete(store, range))
    }

    pub fn clear(&self, store: &str) -> Result<()> {
        self.write(&[store], |tx| tx.clear(store))
    }

    /// Exact number of entries a query visits
    pub fn count(&self, query: &Query) -> Result<usize> {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::count(tx, query, prefetch))
    }

    /// First entry of a query with its value
    pub fn first(&self, query: &Query) -> Result<Option<Entry>> {
        self.read(&[query.store.as_str()], |tx| cursor::first(tx, query))
    }

    /// Effective keys of a query, at most `limit`
    pub fn keys(&self, query: &Query, limit: Option<usize>) -> Result<Vec<Key>> {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::keys(tx, query, prefetch, limit, 0))
    }

    /// Primary keys of a query, at most `limit`
    pub fn primary_keys(&self, query: &Query, limit: Option<usize>) -> Result<Vec<Key>> {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::primary_keys(tx, query, prefetch, limit, 0))
    }

    /// Record values of a query, at most `limit`
    pub fn values(&self, query: &Query, limit: Option<usize>) -> Result<Vec<Value>> {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::values(tx, query, prefetch, limit, 0))
    }

    /// Apply `f` to each entry of a query, values loaded
    pub fn map<T>(&self, query: &Query, f: impl FnMut(&Entry) -> T) -> Result<Vec<T>> {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::map(tx, query, prefetch, f))
    }

    /// Fold the entries of a query into `init`
    pub fn reduce<A>(&self, query: &Query, init: A, f: impl FnMut(A, &Entry) -> A) -> Result<A> {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::reduce(tx, query, prefetch, init, f))
    }

    /// Call `f` for each entry of a query until it returns [`Flow::Stop`]
    ///
    /// `f` runs inside the read transaction and must not call back into
    /// this database.
    pub fn open<F>(&self, query: &Query, f: F) -> Result<Completion>
    where
        F: FnMut(&Entry) -> Flow,
    {
        let prefetch = self.prefetch();
        self.read(&[query.store.as_str()], |tx| cursor::open(tx, query, prefetch, f))
    }

    /// Run a join solver over one cursor per query
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use lode_api::*;
    /// # fn example(db: &Database) -> Result<(), LodeError> {
    /// let queries = [
    ///     Query::index("animals", "color").only("spots")?,
    ///     Query::index("animals", "horn").only(2)?,
    /// ];
    /// let mut solver = SortedMerge::new(Vec::new());
    /// db.scan(&mut solver, &queries)?;
    /// let matched = solver.into_output();
    /// # Ok(())
    /// # }
    /// ```
    pub fn scan(&self, solver: &mut dyn Solver, queries: &[Query]) -> Result<ScanStats> {
        let mut stores: Vec<&str> = queries.iter().map(|q| q.store.as_str()).collect();
        stores.sort_unstable();
        stores.dedup();
        let prefetch = self.prefetch();
        self.read(&stores, |tx| algo::run(tx, solver, queries, prefetch))
    }
}

/// Delete a SQLite database file that no handle has open
pub fn delete_sqlite_database(dir: impl AsRef<Path>, name: &str) -> Result<bool> {
    delete_database_file(dir, name)
}

/// Helper to build records
pub struct RecordBuilder {
    fields: BTreeMap<String, Value>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    pub fn string(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), Value::string(value));
        self
    }

    pub fn number(mut self, field: impl Into<String>, value: impl Into<f64>) -> Self {
        self.fields.insert(field.into(), Value::number(value));
        self
    }

    pub fn bool(mut self, field: impl Into<String>, value: bool) -> Self {
        self.fields.insert(field.into(), Value::Bool(value));
        self
    }

    /// Milliseconds since the epoch
    pub fn date(mut self, field: impl Into<String>, millis: i64) -> Self {
        self.fields.insert(field.into(), Value::date(millis));
        self
    }

    pub fn list(mut self, field: impl Into<String>, items: Vec<Value>) -> Self {
        self.fields.insert(field.into(), Value::List(items));
        self
    }

    pub fn value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Map(self.fields)
    }
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}
