/// Schema model: stores, key paths and indexes
///
/// A schema is plain data. Connectors translate it into engine structures
/// on connect and rebuild it from those structures on introspection, so two
/// schemas are compared with `difference` rather than `==`: index order is
/// not significant.

use crate::{Error, Key, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Column and table names the connectors reserve for themselves
pub const RESERVED_COLUMNS: &[&str] = &["__key__", "__value__", "__pk__"];
const RESERVED_STORE_PREFIXES: &[&str] = &["__lode", "sqlite_", "lode.me"];

/// Highest integer a generated key can take and still be exact as f64.
const MAX_GENERATED_KEY: i64 = 1 << 53;

/// Where a key lives inside a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// Dotted field path, e.g. `author.name`
    Single(String),
    /// Ordered field paths forming an array key
    Composite(Vec<String>),
}

impl KeyPath {
    pub fn single(path: impl Into<String>) -> Self {
        KeyPath::Single(path.into())
    }

    pub fn composite<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Composite(paths.into_iter().map(Into::into).collect())
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, KeyPath::Composite(_))
    }

    /// Extracts the key at this path, `None` if any component is missing
    /// or not a valid key.
    pub fn extract(&self, value: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => value.get_path(path)?.to_key(),
            KeyPath::Composite(paths) => paths
                .iter()
                .map(|p| value.get_path(p).and_then(Value::to_key))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// Engine column name for this path; composite paths join with `,`.
    pub fn column_name(&self) -> String {
        match self {
            KeyPath::Single(path) => path.clone(),
            KeyPath::Composite(paths) => paths.join(","),
        }
    }

    pub fn from_column_name(name: &str) -> Self {
        if name.contains(',') {
            KeyPath::Composite(name.split(',').map(str::to_string).collect())
        } else {
            KeyPath::Single(name.to_string())
        }
    }

    fn components(&self) -> Vec<&str> {
        match self {
            KeyPath::Single(path) => vec![path.as_str()],
            KeyPath::Composite(paths) => paths.iter().map(String::as_str).collect(),
        }
    }

    fn validate(&self) -> Result<()> {
        if let KeyPath::Composite(paths) = self {
            if paths.is_empty() {
                return Err(Error::InvalidValue("composite key path is empty".to_string()));
            }
        }
        for component in self.components() {
            if component.is_empty() || component.contains(',') {
                return Err(Error::InvalidValue(format!(
                    "invalid key path component '{}'",
                    component
                )));
            }
            if RESERVED_COLUMNS.contains(&component) {
                return Err(Error::InvalidValue(format!(
                    "key path '{}' is reserved",
                    component
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(path) => write!(f, "{}", path),
            KeyPath::Composite(paths) => write!(f, "[{}]", paths.join(", ")),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Single(path)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::composite(paths)
    }
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    /// Each element of a list value becomes its own index entry
    pub multi_entry: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidValue("index name is empty".to_string()));
        }
        if self.multi_entry && self.key_path.is_composite() {
            return Err(Error::InvalidValue(format!(
                "index '{}': multiEntry cannot use a composite key path",
                self.name
            )));
        }
        self.key_path.validate()
    }

    /// Index keys a record contributes. Multi-entry indexes yield one key
    /// per distinct valid list element, other indexes at most one key.
    pub fn index_keys(&self, value: &Value) -> Vec<Key> {
        let field = match &self.key_path {
            KeyPath::Composite(_) => return self.key_path.extract(value).into_iter().collect(),
            KeyPath::Single(path) => match value.get_path(path) {
                Some(field) => field,
                None => return Vec::new(),
            },
        };

        match field {
            Value::List(items) if self.multi_entry => items
                .iter()
                .filter_map(Value::to_key)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            other => other.to_key().into_iter().collect(),
        }
    }

    /// Describes how `other` differs from this index, `None` if equivalent.
    pub fn difference(&self, other: &IndexSchema) -> Option<String> {
        if self.key_path != other.key_path {
            return Some(format!("key path {} != {}", self.key_path, other.key_path));
        }
        if self.unique != other.unique {
            return Some(format!("unique {} != {}", self.unique, other.unique));
        }
        if self.multi_entry != other.multi_entry {
            return Some(format!("multiEntry {} != {}", self.multi_entry, other.multi_entry));
        }
        None
    }
}

/// Object store definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    /// In-line key path; `None` means keys are supplied out-of-line
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    pub fn with_key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(Error::InvalidValue(format!("invalid store name '{}'", self.name)));
        }
        if RESERVED_STORE_PREFIXES.iter().any(|p| self.name.starts_with(p)) {
            return Err(Error::InvalidValue(format!("store name '{}' is reserved", self.name)));
        }
        if let Some(key_path) = &self.key_path {
            key_path.validate()?;
            if self.auto_increment && key_path.is_composite() {
                return Err(Error::InvalidValue(format!(
                    "store '{}': autoIncrement requires a single key path",
                    self.name
                )));
            }
        }

        let mut names = HashSet::new();
        for index in &self.indexes {
            index.validate()?;
            if !names.insert(index.name.as_str()) {
                return Err(Error::InvalidValue(format!(
                    "store '{}' declares index '{}' twice",
                    self.name, index.name
                )));
            }
        }
        Ok(())
    }

    /// Describes how `other` differs structurally from this store, `None`
    /// if equivalent. Index order is ignored.
    pub fn difference(&self, other: &StoreSchema) -> Option<String> {
        if self.key_path != other.key_path {
            return Some(format!(
                "key path {} != {}",
                describe_key_path(&self.key_path),
                describe_key_path(&other.key_path)
            ));
        }
        if self.auto_increment != other.auto_increment {
            return Some(format!(
                "autoIncrement {} != {}",
                self.auto_increment, other.auto_increment
            ));
        }
        if self.indexes.len() != other.indexes.len() {
            return Some(format!(
                "index count {} != {}",
                self.indexes.len(),
                other.indexes.len()
            ));
        }
        for index in &self.indexes {
            match other.index(&index.name) {
                None => return Some(format!("index '{}' missing", index.name)),
                Some(theirs) => {
                    if let Some(diff) = index.difference(theirs) {
                        return Some(format!("index '{}': {}", index.name, diff));
                    }
                }
            }
        }
        None
    }

    /// True if records written under `other` keep their primary keys
    /// under this schema, so only the indexes need rebuilding.
    pub fn same_primary_key(&self, other: &StoreSchema) -> bool {
        self.key_path == other.key_path && self.auto_increment == other.auto_increment
    }

    /// Resolves the primary key for a record being written.
    ///
    /// `sequence` is the store's key generator state (last issued key).
    /// Returns the key and the new generator state. Generated keys are
    /// written into in-line records at the key path.
    pub fn resolve_key(
        &self,
        value: &mut Value,
        explicit: Option<Key>,
        sequence: i64,
    ) -> Result<(Key, i64)> {
        match &self.key_path {
            Some(key_path) => {
                if explicit.is_some() {
                    return Err(Error::InvalidValue(format!(
                        "store '{}' uses in-line keys; an explicit key is not allowed",
                        self.name
                    )));
                }
                if let Some(key) = key_path.extract(value) {
                    let next = self.observe_key(sequence, &key);
                    return Ok((key, next));
                }
                match key_path {
                    KeyPath::Single(path) if self.auto_increment && value.get_path(path).is_none() => {
                        let (key, next) = self.generate(sequence)?;
                        value.set_path(path, Value::from(key.clone()))?;
                        Ok((key, next))
                    }
                    _ => Err(Error::InvalidValue(format!(
                        "record has no valid key at {} for store '{}'",
                        key_path, self.name
                    ))),
                }
            }
            None => match explicit {
                Some(key) => {
                    key.validate()?;
                    let next = self.observe_key(sequence, &key);
                    Ok((key, next))
                }
                None if self.auto_increment => self.generate(sequence),
                None => Err(Error::InvalidValue(format!(
                    "store '{}' requires an explicit key",
                    self.name
                ))),
            },
        }
    }

    fn generate(&self, sequence: i64) -> Result<(Key, i64)> {
        let next = sequence + 1;
        if next > MAX_GENERATED_KEY {
            return Err(Error::Constraint(format!(
                "key generator for store '{}' is exhausted",
                self.name
            )));
        }
        Ok((Key::Number(next as f64), next))
    }

    fn observe_key(&self, sequence: i64, key: &Key) -> i64 {
        match key {
            Key::Number(n) if self.auto_increment && *n > sequence as f64 => {
                n.floor().min(MAX_GENERATED_KEY as f64) as i64
            }
            _ => sequence,
        }
    }
}

fn describe_key_path(key_path: &Option<KeyPath>) -> String {
    match key_path {
        Some(path) => path.to_string(),
        None => "(out-of-line)".to_string(),
    }
}

/// Database schema: a version and the stores it declares
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Requested version; `None` lets the connector infer it
    pub version: Option<u32>,
    pub stores: Vec<StoreSchema>,
}

impl DatabaseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Looks up a store, failing with `NotFound` if it is not declared.
    pub fn require_store(&self, name: &str) -> Result<&StoreSchema> {
        self.store(name)
            .ok_or_else(|| Error::NotFound(format!("store '{}'", name)))
    }

    pub fn store_names(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.version == Some(0) {
            return Err(Error::InvalidValue("schema version must be at least 1".to_string()));
        }
        let mut names = HashSet::new();
        for store in &self.stores {
            store.validate()?;
            if !names.insert(store.name.as_str()) {
                return Err(Error::InvalidValue(format!(
                    "store '{}' declared twice",
                    store.name
                )));
            }
        }
        Ok(())
    }

    /// Describes the first structural difference between the two schemas'
    /// store sets, ignoring versions and store order.
    pub fn difference(&self, other: &DatabaseSchema) -> Option<String> {
        if self.stores.len() != other.stores.len() {
            return Some(format!(
                "store count {} != {}",
                self.stores.len(),
                other.stores.len()
            ));
        }
        for store in &self.stores {
            match other.store(&store.name) {
                None => return Some(format!("store '{}' missing", store.name)),
                Some(theirs) => {
                    if let Some(diff) = store.difference(theirs) {
                        return Some(format!("store '{}': {}", store.name, diff));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animals() -> StoreSchema {
        StoreSchema::new("animals")
            .with_key_path("id")
            .with_index(IndexSchema::new("color", "color"))
            .with_index(IndexSchema::new("horn_name", vec!["horn", "name"]))
    }

    fn record(json: serde_json::Value) -> Value {
        Value::from_json(json)
    }

    #[test]
    fn test_multi_entry_composite_rejected() {
        let index = IndexSchema::new("bad", vec!["a", "b"]).multi_entry();
        assert!(matches!(index.validate(), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_store_validation() {
        assert!(animals().validate().is_ok());
        assert!(StoreSchema::new("a:b").validate().is_err());
        assert!(StoreSchema::new("__lode_sequence__").validate().is_err());
        assert!(StoreSchema::new("s").with_key_path("__value__").validate().is_err());
        assert!(StoreSchema::new("s")
            .with_key_path(vec!["a", "b"])
            .with_auto_increment()
            .validate()
            .is_err());
        assert!(animals()
            .with_index(IndexSchema::new("color", "colour"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_database_validation() {
        let dup = DatabaseSchema::new().with_store(animals()).with_store(animals());
        assert!(dup.validate().is_err());
        assert!(DatabaseSchema::new().with_version(0).validate().is_err());
    }

    #[test]
    fn test_difference_ignores_index_order() {
        let mut reordered = animals();
        reordered.indexes.reverse();
        assert_eq!(animals().difference(&reordered), None);

        let rekeyed = StoreSchema { key_path: Some("name".into()), ..animals() };
        assert!(animals().difference(&rekeyed).unwrap().contains("key path"));

        let mut unique = animals();
        unique.indexes[0].unique = true;
        assert!(animals().difference(&unique).unwrap().contains("index 'color'"));
    }

    #[test]
    fn test_index_keys_multi_entry() {
        let tags = IndexSchema::new("tags", "tags").multi_entry();
        let value = record(serde_json::json!({"tags": ["b", "a", "b", null]}));
        assert_eq!(tags.index_keys(&value), vec![Key::from("a"), Key::from("b")]);

        let scalar = record(serde_json::json!({"tags": "solo"}));
        assert_eq!(tags.index_keys(&scalar), vec![Key::from("solo")]);

        let plain = IndexSchema::new("tags", "tags");
        assert_eq!(
            plain.index_keys(&record(serde_json::json!({"tags": ["a", "b"]}))),
            vec![Key::array([Key::from("a"), Key::from("b")])]
        );
        assert!(plain.index_keys(&record(serde_json::json!({}))).is_empty());
    }

    #[test]
    fn test_resolve_in_line_key() {
        let store = animals();
        let mut value = record(serde_json::json!({"id": 3, "name": "galon"}));
        assert_eq!(store.resolve_key(&mut value, None, 0).unwrap(), (Key::from(3), 0));
        assert!(store.resolve_key(&mut value, Some(Key::from(4)), 0).is_err());

        let mut missing = record(serde_json::json!({"name": "nobody"}));
        assert!(store.resolve_key(&mut missing, None, 0).is_err());
    }

    #[test]
    fn test_resolve_generated_key() {
        let store = StoreSchema::new("notes").with_key_path("id").with_auto_increment();
        let mut value = record(serde_json::json!({"text": "hi"}));
        let (key, seq) = store.resolve_key(&mut value, None, 4).unwrap();
        assert_eq!(key, Key::from(5));
        assert_eq!(seq, 5);
        assert_eq!(value.get("id"), Some(&Value::from(5)));

        let mut explicit = record(serde_json::json!({"id": 10.5}));
        let (_, seq) = store.resolve_key(&mut explicit, None, 5).unwrap();
        assert_eq!(seq, 10);
    }

    #[test]
    fn test_resolve_out_of_line_key() {
        let store = StoreSchema::new("blobs");
        let mut value = Value::from("payload");
        assert!(store.resolve_key(&mut value, None, 0).is_err());
        assert_eq!(
            store.resolve_key(&mut value, Some(Key::from("k")), 0).unwrap(),
            (Key::from("k"), 0)
        );
        assert!(store
            .resolve_key(&mut value, Some(Key::Number(f64::NAN)), 0)
            .is_err());

        let counter = StoreSchema::new("log").with_auto_increment();
        assert_eq!(counter.resolve_key(&mut value, None, 0).unwrap().0, Key::from(1));
    }

    #[test]
    fn test_key_path_column_names() {
        let composite = KeyPath::composite(["horn", "name"]);
        assert_eq!(composite.column_name(), "horn,name");
        assert_eq!(KeyPath::from_column_name("horn,name"), composite);
        assert_eq!(KeyPath::from_column_name("id"), KeyPath::single("id"));
    }
}
