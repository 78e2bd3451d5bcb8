/// Deferred value loading for matched keys
///
/// Producers push primary keys as they find them, typically as the sink of a
/// join solver, and values are fetched afterwards in batched read
/// transactions. `push` never touches storage, so it is safe to call while
/// a scan holds the database.

use crate::Database;
use lode_core::{Key, Result, Sink, Value};
use tracing::debug;

const DEFAULT_BATCH_SIZE: usize = 64;

pub struct Streamer<'d> {
    db: &'d Database,
    store: String,
    field: Option<String>,
    batch_size: usize,
    keys: Vec<Key>,
}

impl<'d> Streamer<'d> {
    pub fn new(db: &'d Database, store: impl Into<String>) -> Self {
        Self {
            db,
            store: store.into(),
            field: None,
            batch_size: DEFAULT_BATCH_SIZE,
            keys: Vec::new(),
        }
    }

    /// Resolve only this (dotted) field of each record
    pub fn field(mut self, path: impl Into<String>) -> Self {
        self.field = Some(path.into());
        self
    }

    /// Keys resolved per read transaction
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn push(&mut self, key: Key) {
        self.keys.push(key);
    }

    /// Keys pushed and not yet collected
    pub fn pending(&self) -> &[Key] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Resolves every pending key and returns keys and values in push
    /// order. Values are `None` for keys without a record, or without the
    /// projected field. On error every key stays pending.
    pub fn collect(&mut self) -> Result<(Vec<Key>, Vec<Option<Value>>)> {
        let mut values = Vec::with_capacity(self.keys.len());
        for batch in self.keys.chunks(self.batch_size) {
            let records = self.db.get_all(&self.store, batch)?;
            values.extend(records.into_iter().map(|record| match &self.field {
                Some(path) => record.and_then(|v| v.get_path(path).cloned()),
                None => record,
            }));
        }
        let keys = std::mem::take(&mut self.keys);
        debug!(store = %self.store, keys = keys.len(), "streamer collected");
        Ok((keys, values))
    }
}

impl Sink for Streamer<'_> {
    fn push(&mut self, primary_key: Key) -> Result<()> {
        Streamer::push(self, primary_key);
        Ok(())
    }
}
