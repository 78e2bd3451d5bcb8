/// SQLite connector
///
/// Every store is a table keyed by its primary key column, with the record
/// in a reserved `__value__` column and one column per indexed key path.
/// Multi-entry indexes cannot live in the store table, so each gets a
/// two-column join table named `lode.me:{store}:{index}`. All key columns
/// hold [`Key::encode`] blobs, which makes SQL blob order equal key order.
///
/// SQLite cannot alter a table's key or index structure in place. A store
/// whose indexes changed is rebuilt with its rows copied across; one whose
/// primary key changed is dropped and recreated on connect.

use super::{
    check_scope, check_writable, plan_migration, Connected, EngineKind, Entry, Fetch,
    MigrationPlan, MigrationStep, Seek, StorageConnector, Transaction, TransactionFn,
    TransactionMode,
};
use crate::config::ConnectorConfig;
use crate::schema::{DatabaseSchema, IndexSchema, KeyPath, StoreSchema};
use crate::{Error, Key, KeyRange, Result, Value};
use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reserved record column
pub const VALUE_COLUMN: &str = "__value__";
/// Primary key column of stores with out-of-line keys
pub const KEY_COLUMN: &str = "__key__";
/// Primary key column of multi-entry join tables
pub const PK_COLUMN: &str = "__pk__";
/// Table name prefix of multi-entry join tables
pub const MULTI_ENTRY_PREFIX: &str = "lode.me:";
/// Table of auto-increment key generators
pub const SEQUENCE_TABLE: &str = "__lode_sequence__";

const FILE_EXTENSION: &str = "db";

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn primary_column(store: &StoreSchema) -> String {
    store
        .key_path
        .as_ref()
        .map(KeyPath::column_name)
        .unwrap_or_else(|| KEY_COLUMN.to_string())
}

fn multi_entry_table(store: &str, index: &str) -> String {
    format!("{}{}:{}", MULTI_ENTRY_PREFIX, store, index)
}

fn index_name(table: &str, index: &str) -> String {
    format!("{}-{}", table, index)
}

/// Distinct store-table columns for non-multi-entry indexes, excluding the
/// primary key column.
fn index_columns(store: &StoreSchema) -> Vec<(String, &KeyPath)> {
    let primary = primary_column(store);
    let mut seen = HashSet::new();
    store
        .indexes
        .iter()
        .filter(|i| !i.multi_entry)
        .filter_map(|i| {
            let column = i.key_path.column_name();
            (column != primary && seen.insert(column.clone())).then_some((column, &i.key_path))
        })
        .collect()
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains(['/', '\\', '\0'])
        || name == "."
        || name == ".."
    {
        return Err(Error::InvalidValue(format!("invalid database name '{}'", name)));
    }
    Ok(())
}

fn blob(key: &Key) -> SqlValue {
    SqlValue::Blob(key.encode())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(-1)
}

fn io_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::PermissionDenied {
        Error::Permission(err.to_string())
    } else {
        Error::Io(err)
    }
}

// ---------------------------------------------------------------------------
// Structure: create, drop, introspect
// ---------------------------------------------------------------------------

fn create_store(conn: &Connection, store: &StoreSchema) -> Result<()> {
    let table = quote(&store.name);
    let primary = quote(&primary_column(store));

    let mut columns = vec![
        format!("{} BLOB PRIMARY KEY NOT NULL", primary),
        format!("{} BLOB NOT NULL", quote(VALUE_COLUMN)),
    ];
    for (column, _) in index_columns(store) {
        columns.push(format!("{} BLOB", quote(&column)));
    }
    conn.execute_batch(&format!("CREATE TABLE {} ({});", table, columns.join(", ")))?;

    for index in &store.indexes {
        let column = quote(&index.key_path.column_name());
        if index.multi_entry {
            let me = multi_entry_table(&store.name, &index.name);
            let key_index = if index.unique {
                format!("CREATE UNIQUE INDEX {} ON {} ({});", quote(&index_name(&me, "key")), quote(&me), column)
            } else {
                format!(
                    "CREATE INDEX {} ON {} ({}, {});",
                    quote(&index_name(&me, "key")),
                    quote(&me),
                    column,
                    quote(PK_COLUMN)
                )
            };
            conn.execute_batch(&format!(
                "CREATE TABLE {me_q} ({pk} BLOB NOT NULL, {column} BLOB NOT NULL); \
                 {key_index} \
                 CREATE INDEX {pk_index} ON {me_q} ({pk});",
                me_q = quote(&me),
                pk = quote(PK_COLUMN),
                column = column,
                key_index = key_index,
                pk_index = quote(&index_name(&me, PK_COLUMN)),
            ))?;
        } else if index.unique {
            conn.execute_batch(&format!(
                "CREATE UNIQUE INDEX {} ON {} ({});",
                quote(&index_name(&store.name, &index.name)),
                table,
                column
            ))?;
        } else {
            conn.execute_batch(&format!(
                "CREATE INDEX {} ON {} ({}, {});",
                quote(&index_name(&store.name, &index.name)),
                table,
                column,
                primary
            ))?;
        }
    }

    if store.auto_increment {
        conn.execute(
            &format!("INSERT OR REPLACE INTO {} (store, seq) VALUES (?1, 0)", quote(SEQUENCE_TABLE)),
            params![store.name],
        )?;
    }
    debug!(store = %store.name, indexes = store.indexes.len(), "created table");
    Ok(())
}

fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn drop_store(conn: &Connection, store: &str) -> Result<()> {
    let prefix = format!("{}{}:", MULTI_ENTRY_PREFIX, store);
    for table in table_names(conn)? {
        if table.starts_with(&prefix) {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(&table)))?;
        }
    }
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(store)))?;
    if table_names(conn)?.iter().any(|t| t == SEQUENCE_TABLE) {
        conn.execute(
            &format!("DELETE FROM {} WHERE store = ?1", quote(SEQUENCE_TABLE)),
            params![store],
        )?;
    }
    debug!(store, "dropped table");
    Ok(())
}

/// Rebuilds a store's tables for a new index layout, re-inserting every
/// record and keeping the key generator. Returns the number of records.
fn reindex_store(conn: &Connection, store: &StoreSchema) -> Result<usize> {
    let rows = {
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, {} FROM {}",
            quote(&primary_column(store)),
            quote(VALUE_COLUMN),
            quote(&store.name)
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let sequence = read_sequence(conn, &store.name)?;

    drop_store(conn, &store.name)?;
    create_store(conn, store)?;
    for (primary_key, value) in &rows {
        write_record(conn, store, &Key::decode(primary_key)?, &Value::from_bytes(value)?)?;
    }
    if store.auto_increment {
        conn.execute(
            &format!("UPDATE {} SET seq = ?2 WHERE store = ?1", quote(SEQUENCE_TABLE)),
            params![store.name, sequence],
        )?;
    }
    debug!(store = %store.name, records = rows.len(), "rebuilt indexes");
    Ok(rows.len())
}

struct SqlIndex {
    name: String,
    unique: bool,
    origin: String,
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, bool)>> {
    let mut stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map(params![table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? > 0)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn table_indexes(conn: &Connection, table: &str) -> Result<Vec<SqlIndex>> {
    let mut stmt = conn.prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1)")?;
    let indexes = stmt
        .query_map(params![table], |row| {
            Ok(SqlIndex {
                name: row.get(0)?,
                unique: row.get::<_, i64>(1)? != 0,
                origin: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(indexes)
}

fn indexed_columns(conn: &Connection, index: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let columns = stmt
        .query_map(params![index], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn read_version(conn: &Connection) -> Result<Option<u32>> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(u32::try_from(version).ok().filter(|v| *v > 0))
}

fn read_sequence(conn: &Connection, store: &str) -> Result<i64> {
    let seq = conn
        .query_row(
            &format!("SELECT seq FROM {} WHERE store = ?1", quote(SEQUENCE_TABLE)),
            params![store],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(seq.unwrap_or(0))
}

/// Rebuilds the logical schema from the tables, columns and indexes on disk.
fn introspect(conn: &Connection) -> Result<DatabaseSchema> {
    let tables = table_names(conn)?;
    let sequences: HashSet<String> = if tables.iter().any(|t| t == SEQUENCE_TABLE) {
        let mut stmt = conn.prepare(&format!("SELECT store FROM {}", quote(SEQUENCE_TABLE)))?;
        let stores = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        stores
    } else {
        HashSet::new()
    };

    let mut schema = DatabaseSchema::new();
    let mut multi_entry = Vec::new();

    for table in &tables {
        if table == SEQUENCE_TABLE {
            continue;
        }

        if let Some(rest) = table.strip_prefix(MULTI_ENTRY_PREFIX) {
            let Some((store, index)) = rest.split_once(':') else {
                warn!(table = %table, "ignoring malformed multi-entry table");
                continue;
            };
            let Some((column, _)) = table_columns(conn, table)?
                .into_iter()
                .find(|(name, _)| name != PK_COLUMN)
            else {
                warn!(table = %table, "ignoring multi-entry table without key column");
                continue;
            };
            let mut unique = false;
            for sql_index in table_indexes(conn, table)? {
                if sql_index.unique && indexed_columns(conn, &sql_index.name)? == [column.clone()] {
                    unique = true;
                }
            }
            multi_entry.push((
                store.to_string(),
                IndexSchema {
                    name: index.to_string(),
                    key_path: KeyPath::from_column_name(&column),
                    unique,
                    multi_entry: true,
                },
            ));
            continue;
        }

        let columns = table_columns(conn, table)?;
        let primary = columns
            .iter()
            .find(|(_, pk)| *pk)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| KEY_COLUMN.to_string());

        let mut store = StoreSchema::new(table.clone());
        if primary != KEY_COLUMN {
            store.key_path = Some(KeyPath::from_column_name(&primary));
        }
        store.auto_increment = sequences.contains(table);

        let prefix = format!("{}-", table);
        for sql_index in table_indexes(conn, table)? {
            if sql_index.origin != "c" {
                continue;
            }
            let Some(name) = sql_index.name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(column) = indexed_columns(conn, &sql_index.name)?.into_iter().next() else {
                continue;
            };
            store.indexes.push(IndexSchema {
                name: name.to_string(),
                key_path: KeyPath::from_column_name(&column),
                unique: sql_index.unique,
                multi_entry: false,
            });
        }
        schema.stores.push(store);
    }

    for (store_name, index) in multi_entry {
        match schema.stores.iter_mut().find(|s| s.name == store_name) {
            Some(store) => store.indexes.push(index),
            None => {
                warn!(store = %store_name, index = %index.name, "multi-entry table without owning store");
                schema.stores.push(StoreSchema::new(store_name).with_index(index));
            }
        }
    }

    schema.version = read_version(conn)?;
    Ok(schema)
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Location {
    Directory(PathBuf),
    /// Private in-memory database per connect
    Memory,
}

struct SqliteSession {
    name: String,
    conn: Connection,
    schema: DatabaseSchema,
}

/// Connector over SQLite database files in one directory
pub struct SqliteConnector {
    location: Location,
    config: ConnectorConfig,
    session: Mutex<Option<SqliteSession>>,
    /// Connected version; readable while a transaction holds the session
    status: RwLock<Option<u32>>,
}

impl SqliteConnector {
    /// Connector storing databases as `{dir}/{name}.db`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_config(dir, ConnectorConfig::default())
    }

    pub fn with_config(dir: impl Into<PathBuf>, config: ConnectorConfig) -> Self {
        Self::build(Location::Directory(dir.into()), config)
    }

    /// Connector on private in-memory SQLite databases; data does not
    /// survive a reconnect.
    pub fn in_memory() -> Self {
        Self::build(Location::Memory, ConnectorConfig::default())
    }

    pub fn in_memory_with_config(config: ConnectorConfig) -> Self {
        Self::build(Location::Memory, config)
    }

    fn build(location: Location, config: ConnectorConfig) -> Self {
        Self {
            location,
            config,
            session: Mutex::new(None),
            status: RwLock::new(None),
        }
    }

    /// File backing the named database, if file-based.
    pub fn database_path(&self, name: &str) -> Option<PathBuf> {
        match &self.location {
            Location::Directory(dir) => Some(dir.join(format!("{}.{}", name, FILE_EXTENSION))),
            Location::Memory => None,
        }
    }

    fn open_connection(&self, name: &str) -> Result<Connection> {
        let conn = match &self.location {
            Location::Memory => Connection::open_in_memory()?,
            Location::Directory(dir) => {
                let path = dir.join(format!("{}.{}", name, FILE_EXTENSION));
                let flags = if self.config.read_only {
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
                } else {
                    fs::create_dir_all(dir).map_err(io_error)?;
                    OpenFlags::default()
                };
                Connection::open_with_flags(&path, flags)?
            }
        };
        conn.busy_timeout(self.config.busy_timeout)?;
        Ok(conn)
    }

    fn migrate(&self, conn: &mut Connection, name: &str, desired: &DatabaseSchema) -> Result<MigrationPlan> {
        let behavior = if self.config.read_only {
            TransactionBehavior::Deferred
        } else {
            TransactionBehavior::Immediate
        };
        let tx = conn.transaction_with_behavior(behavior)?;
        if !self.config.read_only {
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (store TEXT PRIMARY KEY NOT NULL, seq INTEGER NOT NULL);",
                quote(SEQUENCE_TABLE)
            ))?;
        }

        let previous = read_version(&tx)?;
        let existing = introspect(&tx)?;
        let plan = plan_migration(name, desired, &existing, previous, &self.config)?;

        for step in &plan.steps {
            match step {
                MigrationStep::Create(store) => create_store(&tx, store)?,
                MigrationStep::Recreate { store, .. } => {
                    drop_store(&tx, &store.name)?;
                    create_store(&tx, store)?;
                }
                MigrationStep::Reindex { store, .. } => {
                    reindex_store(&tx, store)?;
                }
                MigrationStep::Drop(store) => drop_store(&tx, store)?,
            }
        }
        if previous != Some(plan.connected.version) {
            tx.pragma_update(None, "user_version", i64::from(plan.connected.version))?;
        }
        tx.commit()?;
        Ok(plan)
    }
}

impl StorageConnector for SqliteConnector {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn connect(&self, name: &str, schema: &DatabaseSchema) -> Result<Connected> {
        validate_name(name)?;
        schema.validate()?;
        self.config.validate().map_err(Error::InvalidValue)?;

        let mut session = self.session.lock();
        *session = None;
        *self.status.write() = None;

        let mut conn = self.open_connection(name)?;
        let plan = self.migrate(&mut conn, name, schema)?;

        info!(
            database = name,
            version = plan.connected.version,
            previous = ?plan.connected.previous_version,
            changes = plan.steps.len(),
            "connected sqlite database"
        );
        *self.status.write() = Some(plan.connected.version);
        *session = Some(SqliteSession {
            name: name.to_string(),
            conn,
            schema: plan.schema,
        });
        Ok(plan.connected)
    }

    fn get_schema(&self) -> Result<DatabaseSchema> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(Error::Closed)?;
        introspect(&session.conn)
    }

    fn do_transaction(
        &self,
        stores: &[&str],
        mode: TransactionMode,
        f: &mut TransactionFn<'_>,
    ) -> Result<()> {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(Error::Closed)?;
        for store in stores {
            session.schema.require_store(store)?;
        }

        let behavior = if mode.is_writable() {
            TransactionBehavior::Immediate
        } else {
            TransactionBehavior::Deferred
        };
        let sql_tx = session.conn.transaction_with_behavior(behavior)?;
        let result = {
            let mut tx = SqliteTransaction {
                conn: &sql_tx,
                schema: &session.schema,
                scope: stores.iter().map(|s| s.to_string()).collect(),
                mode,
            };
            f(&mut tx)
        };

        match result {
            Ok(()) => Ok(sql_tx.commit()?),
            Err(err) => {
                debug!(error = %err, "rolling back sqlite transaction");
                if let Err(rollback) = sql_tx.rollback() {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            debug!(database = %session.name, "closed sqlite database");
        }
        *self.status.write() = None;
    }

    fn is_ready(&self) -> bool {
        self.status.read().is_some()
    }

    fn version(&self) -> Option<u32> {
        *self.status.read()
    }

    fn delete_database(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let was_open = {
            let mut session = self.session.lock();
            if session.as_ref().map_or(false, |s| s.name == name) {
                *session = None;
                *self.status.write() = None;
                true
            } else {
                false
            }
        };

        let Some(path) = self.database_path(name) else {
            return Ok(was_open);
        };
        if !path.exists() {
            return Ok(false);
        }

        {
            let conn = Connection::open(&path)?;
            for table in table_names(&conn)? {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote(&table)))?;
            }
        }
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(err)),
            }
        }
        info!(database = name, path = %path.display(), "deleted sqlite database");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Column expressions for reading a store or one of its indexes
struct SqlSource {
    from: String,
    key: String,
    primary_key: String,
    value: String,
    multi_entry_tables: Vec<String>,
}

impl SqlSource {
    fn new(store: &StoreSchema, index: Option<&str>) -> Result<Self> {
        let table = quote(&store.name);
        let primary = format!("t.{}", quote(&primary_column(store)));
        let value = format!("t.{}", quote(VALUE_COLUMN));
        let multi_entry_tables = store
            .indexes
            .iter()
            .filter(|i| i.multi_entry)
            .map(|i| multi_entry_table(&store.name, &i.name))
            .collect();

        let Some(index_name) = index else {
            return Ok(Self {
                from: format!("{} AS t", table),
                key: primary.clone(),
                primary_key: primary,
                value,
                multi_entry_tables,
            });
        };

        let index = store.index(index_name).ok_or_else(|| {
            Error::NotFound(format!("index '{}' on store '{}'", index_name, store.name))
        })?;
        let column = quote(&index.key_path.column_name());
        if index.multi_entry {
            Ok(Self {
                from: format!(
                    "{} AS m JOIN {} AS t ON t.{} = m.{}",
                    quote(&multi_entry_table(&store.name, &index.name)),
                    table,
                    quote(&primary_column(store)),
                    quote(PK_COLUMN)
                ),
                key: format!("m.{}", column),
                primary_key: format!("m.{}", quote(PK_COLUMN)),
                value,
                multi_entry_tables,
            })
        } else {
            Ok(Self {
                from: format!("{} AS t", table),
                key: format!("t.{}", column),
                primary_key: primary,
                value,
                multi_entry_tables,
            })
        }
    }
}

/// Appends the SQL conditions of `range` on `column`.
fn push_range(clauses: &mut Vec<String>, params: &mut Vec<SqlValue>, column: &str, range: &KeyRange) {
    if let Some(lower) = range.lower() {
        let op = if range.lower_open() { ">" } else { ">=" };
        clauses.push(format!("{} {} ?", column, op));
        params.push(blob(lower));
    }
    if let Some(upper) = range.upper() {
        let op = if range.upper_open() { "<" } else { "<=" };
        clauses.push(format!("{} {} ?", column, op));
        params.push(blob(upper));
    }
}

fn push_seek(
    clauses: &mut Vec<String>,
    params: &mut Vec<SqlValue>,
    source: &SqlSource,
    seek: &Seek,
    reverse: bool,
) {
    let op = match (reverse, seek_inclusive(seek)) {
        (false, true) => ">=",
        (false, false) => ">",
        (true, true) => "<=",
        (true, false) => "<",
    };
    match seek {
        Seek::Key { key, .. } => {
            clauses.push(format!("{} {} ?", source.key, op));
            params.push(blob(key));
        }
        Seek::Entry { key, primary_key, .. } => {
            clauses.push(format!("({}, {}) {} (?, ?)", source.key, source.primary_key, op));
            params.push(blob(key));
            params.push(blob(primary_key));
        }
    }
}

fn seek_inclusive(seek: &Seek) -> bool {
    match seek {
        Seek::Key { inclusive, .. } | Seek::Entry { inclusive, .. } => *inclusive,
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
    schema: &'a DatabaseSchema,
    scope: Vec<String>,
    mode: TransactionMode,
}

impl SqliteTransaction<'_> {
    fn store(&self, name: &str) -> Result<&StoreSchema> {
        check_scope(&self.scope, name)?;
        self.schema.require_store(name)
    }

    fn write(&mut self, store: &str, mut value: Value, key: Option<Key>, overwrite: bool) -> Result<Key> {
        check_writable(self.mode)?;
        let schema = self.store(store)?;
        let sequence = if schema.auto_increment {
            read_sequence(self.conn, store)?
        } else {
            0
        };
        let (primary_key, next) = schema.resolve_key(&mut value, key, sequence)?;

        if !overwrite {
            let exists = self
                .conn
                .prepare_cached(&format!(
                    "SELECT 1 FROM {} WHERE {} = ?1",
                    quote(&schema.name),
                    quote(&primary_column(schema))
                ))?
                .query_row(params![blob(&primary_key)], |_| Ok(()))
                .optional()?
                .is_some();
            if exists {
                return Err(Error::Constraint(format!(
                    "store '{}' already holds key {}",
                    store, primary_key
                )));
            }
        }

        self.conn.execute_batch("SAVEPOINT lode_put")?;
        if let Err(err) = write_record(self.conn, schema, &primary_key, &value) {
            self.conn.execute_batch("ROLLBACK TO lode_put; RELEASE lode_put")?;
            return Err(err);
        }
        self.conn.execute_batch("RELEASE lode_put")?;

        if next != sequence {
            self.conn
                .prepare_cached(&format!("UPDATE {} SET seq = ?2 WHERE store = ?1", quote(SEQUENCE_TABLE)))?
                .execute(params![store, next])?;
        }
        Ok(primary_key)
    }
}

/// Deletes the records matched by `condition` along with their
/// multi-entry rows. Returns the number of records removed.
fn remove_where(conn: &Connection, store: &StoreSchema, condition: &str, params: &[SqlValue]) -> Result<usize> {
    let table = quote(&store.name);
    let primary = quote(&primary_column(store));
    for index in store.indexes.iter().filter(|i| i.multi_entry) {
        let me = quote(&multi_entry_table(&store.name, &index.name));
        conn.prepare_cached(&format!(
            "DELETE FROM {} WHERE {} IN (SELECT {} FROM {} WHERE {})",
            me,
            quote(PK_COLUMN),
            primary,
            table,
            condition
        ))?
        .execute(params_from_iter(params.iter()))?;
    }
    let removed = conn
        .prepare_cached(&format!("DELETE FROM {} WHERE {}", table, condition))?
        .execute(params_from_iter(params.iter()))?;
    Ok(removed)
}

/// Writes a record and its index entries, replacing any record under the
/// same primary key.
fn write_record(conn: &Connection, store: &StoreSchema, primary_key: &Key, value: &Value) -> Result<()> {
    let primary = quote(&primary_column(store));
    let pk = blob(primary_key);
    remove_where(conn, store, &format!("{} = ?", primary), std::slice::from_ref(&pk))?;

    let mut columns = vec![primary, quote(VALUE_COLUMN)];
    let mut params = vec![pk.clone(), SqlValue::Blob(value.to_bytes()?)];
    for (column, key_path) in index_columns(store) {
        columns.push(quote(&column));
        params.push(key_path.extract(value).map_or(SqlValue::Null, |k| blob(&k)));
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    conn.prepare_cached(&format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(&store.name),
        columns.join(", "),
        placeholders
    ))?
    .execute(params_from_iter(params.iter()))?;

    for index in store.indexes.iter().filter(|i| i.multi_entry) {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES (?1, ?2)",
            quote(&multi_entry_table(&store.name, &index.name)),
            quote(PK_COLUMN),
            quote(&index.key_path.column_name())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        for key in index.index_keys(value) {
            stmt.execute(params![pk, blob(&key)])?;
        }
    }
    Ok(())
}

impl Transaction for SqliteTransaction<'_> {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn get(&self, store: &str, key: &Key) -> Result<Option<Value>> {
        let schema = self.store(store)?;
        let bytes: Option<Vec<u8>> = self
            .conn
            .prepare_cached(&format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                quote(VALUE_COLUMN),
                quote(&schema.name),
                quote(&primary_column(schema))
            ))?
            .query_row(params![blob(key)], |row| row.get(0))
            .optional()?;
        bytes.map(|b| Value::from_bytes(&b)).transpose()
    }

    fn put(&mut self, store: &str, value: Value, key: Option<Key>) -> Result<Key> {
        self.write(store, value, key, true)
    }

    fn add(&mut self, store: &str, value: Value, key: Option<Key>) -> Result<Key> {
        self.write(store, value, key, false)
    }

    fn delete(&mut self, store: &str, range: &KeyRange) -> Result<usize> {
        check_writable(self.mode)?;
        let schema = self.store(store)?;
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        push_range(&mut clauses, &mut params, &quote(&primary_column(schema)), range);
        let condition = if clauses.is_empty() {
            "1".to_string()
        } else {
            clauses.join(" AND ")
        };
        remove_where(self.conn, schema, &condition, &params)
    }

    fn clear(&mut self, store: &str) -> Result<()> {
        check_writable(self.mode)?;
        let schema = self.store(store)?;
        let source = SqlSource::new(schema, None)?;
        for table in &source.multi_entry_tables {
            self.conn.execute_batch(&format!("DELETE FROM {};", quote(table)))?;
        }
        self.conn
            .execute_batch(&format!("DELETE FROM {};", quote(&schema.name)))?;
        Ok(())
    }

    fn count(
        &self,
        store: &str,
        index: Option<&str>,
        range: Option<&KeyRange>,
        unique: bool,
    ) -> Result<usize> {
        let schema = self.store(store)?;
        let source = SqlSource::new(schema, index)?;
        let mut clauses = vec![format!("{} IS NOT NULL", source.key)];
        let mut params = Vec::new();
        if let Some(range) = range {
            push_range(&mut clauses, &mut params, &source.key, range);
        }
        let what = if unique {
            format!("COUNT(DISTINCT {})", source.key)
        } else {
            "COUNT(*)".to_string()
        };
        let count: i64 = self
            .conn
            .prepare_cached(&format!(
                "SELECT {} FROM {} WHERE {}",
                what,
                source.from,
                clauses.join(" AND ")
            ))?
            .query_row(params_from_iter(params.iter()), |row| row.get(0))?;
        usize::try_from(count).map_err(|e| Error::Internal(e.to_string()))
    }

    fn fetch(&self, request: &Fetch<'_>) -> Result<Vec<Entry>> {
        let schema = self.store(request.store)?;
        let source = SqlSource::new(schema, request.index)?;

        let mut clauses = vec![format!("{} IS NOT NULL", source.key)];
        let mut params = Vec::new();
        if let Some(range) = request.range {
            push_range(&mut clauses, &mut params, &source.key, range);
        }
        if let Some(seek) = request.seek {
            push_seek(&mut clauses, &mut params, &source, seek, request.reverse);
        }
        params.push(SqlValue::Integer(limit_param(request.limit)));

        let direction = if request.reverse { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {key}, {pk}, {value} FROM {from} WHERE {cond} ORDER BY {key} {dir}, {pk} {dir} LIMIT ?",
            key = source.key,
            pk = source.primary_key,
            value = if request.with_values { source.value.as_str() } else { "NULL" },
            from = source.from,
            cond = clauses.join(" AND "),
            dir = direction,
        );

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let primary_key: Vec<u8> = row.get(1)?;
            let value: Option<Vec<u8>> = row.get(2)?;
            entries.push(Entry {
                key: Key::decode(&key)?,
                primary_key: Key::decode(&primary_key)?,
                value: value.map(|v| Value::from_bytes(&v)).transpose()?,
            });
        }
        debug!(store = request.store, index = ?request.index, rows = entries.len(), "fetched");
        Ok(entries)
    }
}

/// Removes a database file without constructing a connector.
pub fn delete_database_file(dir: impl AsRef<Path>, name: &str) -> Result<bool> {
    SqliteConnector::new(dir.as_ref()).delete_database(name)
}
