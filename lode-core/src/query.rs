/// Cursor descriptions
///
/// A [`Query`] names what a cursor walks: a store's primary keys or one of
/// its indexes, optionally restricted to a key range, in either direction.
/// Queries are plain data; the same query can open cursors in many
/// transactions.

use crate::range::{Comparison, KeyRange};
use crate::{Error, Key, Result};

/// Where a paginated query picks up
#[derive(Debug, Clone, PartialEq)]
pub struct Resume {
    /// Effective key of the last entry already seen
    pub key: Key,
    /// Its primary key; `None` skips every entry under `key`
    pub primary_key: Option<Key>,
}

/// Store or index walk
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Store name (required)
    pub store: String,
    /// Index name; `None` walks the primary keys
    pub index: Option<String>,
    /// Key range on the effective key; `None` is unbounded
    pub range: Option<KeyRange>,
    /// Descending order
    pub reverse: bool,
    /// Surface only the first primary key of each distinct effective key
    pub unique: bool,
    /// Start strictly after this position
    pub resume: Option<Resume>,
}

impl Query {
    /// Walk the primary keys of a store
    pub fn store(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            index: None,
            range: None,
            reverse: false,
            unique: false,
            resume: None,
        }
    }

    /// Walk one index of a store
    pub fn index(store: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            index: Some(index.into()),
            ..Self::store(store)
        }
    }

    /// Restrict to a key range
    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Restrict to keys satisfying one comparison, e.g. `("=", "spots")`
    pub fn where_key(self, op: Comparison, value: impl Into<Key>) -> Result<Self> {
        Ok(self.with_range(KeyRange::when(op, value)?))
    }

    /// Restrict to keys equal to `value`
    pub fn only(self, value: impl Into<Key>) -> Result<Self> {
        Ok(self.with_range(KeyRange::only(value)?))
    }

    /// Restrict to keys starting with `prefix`
    pub fn starts(self, prefix: impl Into<Key>) -> Result<Self> {
        Ok(self.with_range(KeyRange::starts(prefix)?))
    }

    /// Iterate in descending order
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Skip duplicate effective keys
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Resume strictly after a previously seen position
    pub fn resume_after(mut self, key: Key, primary_key: Option<Key>) -> Self {
        self.resume = Some(Resume { key, primary_key });
        self
    }

    /// True if the effective key is the primary key.
    pub fn is_primary(&self) -> bool {
        self.index.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.is_empty() {
            return Err(Error::InvalidValue("query needs a store name".to_string()));
        }
        if matches!(&self.index, Some(index) if index.is_empty()) {
            return Err(Error::InvalidValue(format!(
                "empty index name on store '{}'",
                self.store
            )));
        }
        if let (Some(resume), Some(range)) = (&self.resume, &self.range) {
            resume.key.validate()?;
            if !range.contains(&resume.key) {
                let outside = if self.reverse {
                    range.is_below(&resume.key)
                } else {
                    range.is_above(&resume.key)
                };
                // Resuming before the range start is harmless, past its end is a caller bug.
                if outside {
                    return Err(Error::InvalidValue(format!(
                        "resume key {} is past the end of range {}",
                        resume.key, range
                    )));
                }
            }
        }
        Ok(())
    }
}
