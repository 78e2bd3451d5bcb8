/// Test utilities and fixtures for Lode testing
///
/// Every helper can run against either engine so behavior can be compared
/// between SQLite and the in-memory connector.

use lode_api::{ConnectorConfig, Database, IndexSchema, KeyPath, LodeKey, LodeValue, StoreSchema};
use lode_core::{DatabaseSchema, MemoryConnector, MemoryEngine};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Engine behind a test database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Memory,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Sqlite, Backend::Memory];
}

/// Test database wrapper that manages temporary directory lifecycle
pub struct TestDatabase {
    pub db: Database,
    pub backend: Backend,
    pub name: String,
    dir: PathBuf,
    engine: MemoryEngine,
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Create a database on `backend` in a fresh temporary directory
    pub fn new(backend: Backend, schema: &DatabaseSchema) -> Self {
        Self::with_config(backend, schema, ConnectorConfig::default())
    }

    pub fn with_config(backend: Backend, schema: &DatabaseSchema, config: ConnectorConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        let engine = MemoryEngine::new();
        let db = connect(backend, &dir, &engine, "test", schema, config)
            .expect("Failed to create database");

        Self {
            db,
            backend,
            name: "test".to_string(),
            dir,
            engine,
            _temp_dir: Some(temp_dir),
        }
    }

    pub fn sqlite(schema: &DatabaseSchema) -> Self {
        Self::new(Backend::Sqlite, schema)
    }

    pub fn in_memory(schema: &DatabaseSchema) -> Self {
        Self::new(Backend::Memory, schema)
    }

    /// One database per backend, same schema
    pub fn each(schema: &DatabaseSchema) -> Vec<Self> {
        Backend::ALL.iter().map(|b| Self::new(*b, schema)).collect()
    }

    /// Directory holding SQLite files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Close and connect again with `schema` (for testing persistence and
    /// migrations)
    pub fn reopen(self, schema: &DatabaseSchema) -> Self {
        self.reopen_with_config(schema, ConnectorConfig::default())
            .expect("Failed to reopen database")
    }

    pub fn reopen_with_config(
        self,
        schema: &DatabaseSchema,
        config: ConnectorConfig,
    ) -> lode_core::Result<Self> {
        self.db.close();
        let db = connect(self.backend, &self.dir, &self.engine, &self.name, schema, config)?;
        Ok(Self { db, ..self })
    }

    /// Delete the database through its own handle
    pub fn delete_database(self) -> lode_core::Result<bool> {
        let Self { db, _temp_dir, .. } = self;
        db.delete_database()
    }

    /// Second handle on the same physical database
    pub fn connect_again(&self, schema: &DatabaseSchema, config: ConnectorConfig) -> lode_core::Result<Database> {
        connect(self.backend, &self.dir, &self.engine, &self.name, schema, config)
    }
}

fn connect(
    backend: Backend,
    dir: &Path,
    engine: &MemoryEngine,
    name: &str,
    schema: &DatabaseSchema,
    config: ConnectorConfig,
) -> lode_core::Result<Database> {
    match backend {
        Backend::Sqlite => Database::open_sqlite_with_config(dir, name, schema, config),
        Backend::Memory => Database::with_connector(
            Box::new(MemoryConnector::with_config(engine.clone(), config)),
            name,
            schema,
        ),
    }
}

/// (id, name, color, horn, legs)
pub const ANIMALS: [(i32, &str, &str, i32, i32); 8] = [
    (1, "rat", "brown", 0, 4),
    (2, "leopard", "spots", 2, 4),
    (3, "galon", "gold", 10, 2),
    (4, "cat", "spots", 0, 4),
    (5, "snake", "spots", 0, 0),
    (6, "ox", "black", 2, 4),
    (7, "cow", "spots", 2, 4),
    (8, "chicken", "red", 0, 2),
];

pub fn animals_store() -> StoreSchema {
    StoreSchema::new("animals")
        .with_key_path("id")
        .with_index(IndexSchema::new("color", "color"))
        .with_index(IndexSchema::new("horn", "horn"))
        .with_index(IndexSchema::new("legs", "legs"))
        .with_index(IndexSchema::new("horn_name", KeyPath::composite(["horn", "name"])))
        .with_index(IndexSchema::new("legs_name", KeyPath::composite(["legs", "name"])))
}

/// Records of the tagged store, `(id, value, tags)`
pub const TAGGED: [(i32, i32, &[&str]); 8] = [
    (0, 3, &["a", "b"]),
    (1, 2, &["x"]),
    (2, 1, &["a", "x"]),
    (3, 3, &[]),
    (4, 3, &["b", "c"]),
    (5, 2, &["a"]),
    (6, 8, &["c", "c"]),
    (7, 2, &["b"]),
];

pub fn tagged_store() -> StoreSchema {
    StoreSchema::new("st")
        .with_key_path("id")
        .with_index(IndexSchema::new("value", "value"))
        .with_index(IndexSchema::new("tags", "tags").multi_entry())
}

/// Schema with both fixture stores
pub fn fixture_schema() -> DatabaseSchema {
    DatabaseSchema::new()
        .with_store(animals_store())
        .with_store(tagged_store())
}

pub fn animal(id: i32, name: &str, color: &str, horn: i32, legs: i32) -> LodeValue {
    LodeValue::from_json(serde_json::json!({
        "id": id, "name": name, "color": color, "horn": horn, "legs": legs
    }))
}

pub fn load_animals(db: &Database) {
    let records = ANIMALS
        .iter()
        .map(|(id, name, color, horn, legs)| animal(*id, name, color, *horn, *legs))
        .collect();
    db.put_all("animals", records).expect("Failed to load animals");
}

pub fn load_tagged(db: &Database) {
    let records = TAGGED
        .iter()
        .map(|(id, value, tags)| {
            LodeValue::from_json(serde_json::json!({ "id": id, "value": value, "tags": tags }))
        })
        .collect();
    db.put_all("st", records).expect("Failed to load tagged records");
}

/// Names of the animals with the given primary keys, in key order
pub fn animal_names(keys: &[LodeKey]) -> Vec<&'static str> {
    keys.iter()
        .filter_map(|k| ANIMALS.iter().find(|a| LodeKey::from(a.0) == *k).map(|a| a.1))
        .collect()
}

/// Key list from integers
pub fn int_keys(ids: &[i32]) -> Vec<LodeKey> {
    ids.iter().map(|id| LodeKey::from(*id)).collect()
}

/// Mock data generator for testing
pub struct MockDataGenerator {
    counter: u64,
}

impl MockDataGenerator {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Generate an animal-shaped record with a fresh id
    pub fn next_animal(&mut self) -> LodeValue {
        const COLORS: [&str; 5] = ["brown", "spots", "gold", "black", "red"];
        let id = self.counter;
        self.counter += 1;
        LodeValue::from_json(serde_json::json!({
            "id": id,
            "name": format!("animal{:05}", id),
            "color": COLORS[(id % 5) as usize],
            "horn": (id % 3) * 2,
            "legs": (id % 4) * 2,
        }))
    }

    /// Generate `n` animal records
    pub fn animals(&mut self, n: usize) -> Vec<LodeValue> {
        (0..n).map(|_| self.next_animal()).collect()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Default for MockDataGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_api::Query;

    #[test]
    fn test_fixtures_load_on_each_backend() {
        for t in TestDatabase::each(&fixture_schema()) {
            load_animals(&t.db);
            load_tagged(&t.db);
            assert_eq!(t.db.count(&Query::store("animals")).unwrap(), 8);
            assert_eq!(t.db.count(&Query::index("st", "tags")).unwrap(), 10);
        }
    }

    #[test]
    fn test_reopen_keeps_data() {
        for t in TestDatabase::each(&fixture_schema()) {
            load_animals(&t.db);
            let t = t.reopen(&fixture_schema());
            assert_eq!(t.db.count(&Query::store("animals")).unwrap(), 8, "{:?}", t.backend);
        }
    }

    #[test]
    fn test_mock_generator() {
        let mut generator = MockDataGenerator::new();
        let records = generator.animals(10);
        assert_eq!(records.len(), 10);
        assert_eq!(generator.counter(), 10);
        assert_ne!(records[0], records[1]);
    }

    #[test]
    fn test_animal_names() {
        assert_eq!(animal_names(&int_keys(&[7, 2, 6])), vec!["cow", "leopard", "ox"]);
    }
}
