/// Cursors over a store or index inside one transaction
///
/// A [`Cursor`] borrows the transaction lent by a connector and pulls
/// entries from it in batches of `prefetch`, so walking a large index costs
/// one engine round trip per batch rather than per entry. Repositioning
/// (`continue_to`, `continue_primary_key`) drops what is buffered and seeks
/// in the engine instead of stepping.

use crate::connector::{Entry, Fetch, Seek, Transaction};
use crate::query::Query;
use crate::{Error, Key, Result, Value};
use std::collections::VecDeque;
use tracing::trace;

/// Engine round trips and surfaced entries of one cursor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorStats {
    pub fetches: usize,
    pub visited: usize,
}

/// Current (effective key, primary key) of a positioned cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub key: Key,
    pub primary_key: Key,
}

pub struct Cursor<'t> {
    tx: &'t dyn Transaction,
    query: Query,
    prefetch: usize,
    with_values: bool,
    buffer: VecDeque<Entry>,
    current: Option<Entry>,
    /// Where the next fetch starts
    frontier: Option<Seek>,
    /// No entries remain in the engine past the buffer
    drained: bool,
    /// Last effective key surfaced by a unique cursor
    last_key: Option<Key>,
    stats: CursorStats,
}

impl<'t> Cursor<'t> {
    /// Opens an unpositioned cursor; call [`Cursor::advance`] to move onto
    /// the first entry.
    pub fn new(tx: &'t dyn Transaction, query: Query, prefetch: usize) -> Result<Self> {
        query.validate()?;
        if prefetch == 0 {
            return Err(Error::InvalidValue("prefetch must be greater than 0".to_string()));
        }
        let frontier = initial_seek(&query);
        Ok(Self {
            tx,
            query,
            prefetch,
            with_values: false,
            buffer: VecDeque::new(),
            current: None,
            frontier,
            drained: false,
            last_key: None,
            stats: CursorStats::default(),
        })
    }

    /// Also load record values
    pub fn with_values(mut self) -> Self {
        self.with_values = true;
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    pub fn position(&self) -> Option<Position> {
        self.current.as_ref().map(|e| Position {
            key: e.key.clone(),
            primary_key: e.primary_key.clone(),
        })
    }

    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Moves to the next entry. Returns `None` once exhausted.
    pub fn advance(&mut self) -> Result<Option<&Entry>> {
        self.land()?;
        Ok(self.current.as_ref())
    }

    /// Moves to the first entry whose effective key is at or beyond `key`
    /// in iteration order. A cursor already there stays put.
    pub fn continue_to(&mut self, key: &Key) -> Result<Option<&Entry>> {
        self.seek(Seek::Key {
            key: key.clone(),
            inclusive: true,
        })
    }

    /// Moves to the first entry at or beyond `(key, primary_key)` in
    /// iteration order. A cursor already there stays put.
    pub fn continue_primary_key(&mut self, key: &Key, primary_key: &Key) -> Result<Option<&Entry>> {
        self.seek(Seek::Entry {
            key: key.clone(),
            primary_key: primary_key.clone(),
            inclusive: true,
        })
    }

    /// Rewinds to before the first entry.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.current = None;
        self.frontier = initial_seek(&self.query);
        self.drained = false;
        self.last_key = None;
    }

    fn seek(&mut self, target: Seek) -> Result<Option<&Entry>> {
        let reverse = self.query.reverse;
        if let Some(current) = &self.current {
            if target.admits(&current.key, &current.primary_key, reverse) {
                return Ok(self.current.as_ref());
            }
        }

        while let Some(entry) = self.buffer.front() {
            if target.admits(&entry.key, &entry.primary_key, reverse) {
                break;
            }
            self.buffer.pop_front();
        }

        if self.buffer.is_empty() && !self.drained {
            if self.frontier.as_ref().map_or(true, |f| is_beyond(f, &target, reverse)) {
                self.frontier = Some(target);
            }
            self.fill()?;
        }
        self.land()?;
        Ok(self.current.as_ref())
    }

    /// Pops the next entry, refilling as needed. A unique cursor never
    /// surfaces the same effective key twice in a row.
    fn land(&mut self) -> Result<()> {
        loop {
            if self.buffer.is_empty() && !self.drained {
                self.fill()?;
            }
            let Some(entry) = self.buffer.pop_front() else {
                self.current = None;
                return Ok(());
            };
            if self.query.unique {
                if self.last_key.as_ref() == Some(&entry.key) {
                    continue;
                }
                self.last_key = Some(entry.key.clone());
            }
            self.stats.visited += 1;
            self.current = Some(entry);
            return Ok(());
        }
    }

    fn fill(&mut self) -> Result<()> {
        let entries = self.tx.fetch(&Fetch {
            store: &self.query.store,
            index: self.query.index.as_deref(),
            range: self.query.range.as_ref(),
            reverse: self.query.reverse,
            seek: self.frontier.as_ref(),
            limit: self.prefetch,
            with_values: self.with_values,
        })?;
        self.stats.fetches += 1;
        trace!(
            store = %self.query.store,
            index = ?self.query.index,
            fetched = entries.len(),
            "cursor fetch"
        );

        if entries.len() < self.prefetch {
            self.drained = true;
        }
        if let Some(last) = entries.last() {
            self.frontier = Some(Seek::Entry {
                key: last.key.clone(),
                primary_key: last.primary_key.clone(),
                inclusive: false,
            });
        }
        self.buffer.extend(entries);
        Ok(())
    }
}

/// True if `target` starts strictly later than `frontier`.
fn is_beyond(frontier: &Seek, target: &Seek, reverse: bool) -> bool {
    match target {
        Seek::Entry { key, primary_key, .. } => frontier.admits(key, primary_key, reverse),
        Seek::Key { key, .. } => {
            let ordering = key.cmp(frontier.key());
            if reverse {
                ordering.is_lt()
            } else {
                ordering.is_gt()
            }
        }
    }
}

fn initial_seek(query: &Query) -> Option<Seek> {
    query.resume.as_ref().map(|resume| match &resume.primary_key {
        Some(primary_key) if !query.unique => Seek::Entry {
            key: resume.key.clone(),
            primary_key: primary_key.clone(),
            inclusive: false,
        },
        _ => Seek::Key {
            key: resume.key.clone(),
            inclusive: false,
        },
    })
}

impl Iterator for Cursor<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry.clone())),
            Ok(None) => None,
            Err(err) => {
                self.drained = true;
                self.buffer.clear();
                Some(Err(err))
            }
        }
    }
}

/// What an `open` callback asks for next
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Next,
    Stop,
    /// Skip ahead to the first entry at or beyond this effective key
    Continue(Key),
}

/// How an `open` iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exhausted,
    Stopped,
}

/// Invokes `f` once per entry in iteration order until the cursor is
/// exhausted or `f` returns [`Flow::Stop`].
pub fn open<F>(tx: &dyn Transaction, query: &Query, prefetch: usize, mut f: F) -> Result<Completion>
where
    F: FnMut(&Entry) -> Flow,
{
    let mut cursor = Cursor::new(tx, query.clone(), prefetch)?.with_values();
    let mut next = cursor.advance()?.map(&mut f);
    while let Some(flow) = next {
        next = match flow {
            Flow::Stop => return Ok(Completion::Stopped),
            Flow::Next => cursor.advance()?.map(&mut f),
            Flow::Continue(key) => {
                let current = cursor.position();
                let ahead = current.map_or(true, |p| {
                    let ordering = key.cmp(&p.key);
                    if query.reverse {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    }
                });
                if !ahead {
                    return Err(Error::InvalidValue(format!(
                        "continue key {} does not move the cursor forward",
                        key
                    )));
                }
                cursor.continue_to(&key)?.map(&mut f)
            }
        };
    }
    Ok(Completion::Exhausted)
}

/// Exact number of entries the query would visit.
pub fn count(tx: &dyn Transaction, query: &Query, prefetch: usize) -> Result<usize> {
    query.validate()?;
    if query.resume.is_none() {
        return tx.count(
            &query.store,
            query.index.as_deref(),
            query.range.as_ref(),
            query.unique,
        );
    }
    let mut cursor = Cursor::new(tx, query.clone(), prefetch)?;
    let mut n = 0;
    while cursor.advance()?.is_some() {
        n += 1;
    }
    Ok(n)
}

/// First entry of the query, with its value.
pub fn first(tx: &dyn Transaction, query: &Query) -> Result<Option<Entry>> {
    let mut cursor = Cursor::new(tx, query.clone(), 1)?.with_values();
    Ok(cursor.advance()?.cloned())
}

/// Applies `f` to every entry, value loaded, in iteration order.
pub fn map<T>(tx: &dyn Transaction, query: &Query, prefetch: usize, mut f: impl FnMut(&Entry) -> T) -> Result<Vec<T>> {
    let mut cursor = Cursor::new(tx, query.clone(), prefetch)?.with_values();
    let mut out = Vec::new();
    while let Some(entry) = cursor.advance()? {
        out.push(f(entry));
    }
    Ok(out)
}

/// Folds every entry, value loaded, into `init` in iteration order.
pub fn reduce<A>(
    tx: &dyn Transaction,
    query: &Query,
    prefetch: usize,
    init: A,
    mut f: impl FnMut(A, &Entry) -> A,
) -> Result<A> {
    let mut cursor = Cursor::new(tx, query.clone(), prefetch)?.with_values();
    let mut acc = init;
    while let Some(entry) = cursor.advance()? {
        acc = f(acc, entry);
    }
    Ok(acc)
}

fn collect<T>(
    tx: &dyn Transaction,
    query: &Query,
    prefetch: usize,
    limit: Option<usize>,
    offset: usize,
    with_values: bool,
    mut map: impl FnMut(Entry) -> Option<T>,
) -> Result<Vec<T>> {
    let prefetch = match limit {
        Some(limit) => prefetch.min(limit.saturating_add(offset)).max(1),
        None => prefetch,
    };
    let mut cursor = Cursor::new(tx, query.clone(), prefetch)?;
    if with_values {
        cursor = cursor.with_values();
    }

    let mut out = Vec::new();
    let mut skipped = 0;
    while limit.map_or(true, |limit| out.len() < limit) {
        let Some(entry) = cursor.advance()? else {
            break;
        };
        if skipped < offset {
            skipped += 1;
            continue;
        }
        if let Some(item) = map(entry.clone()) {
            out.push(item);
        }
    }
    Ok(out)
}

/// Effective keys in iteration order.
pub fn keys(
    tx: &dyn Transaction,
    query: &Query,
    prefetch: usize,
    limit: Option<usize>,
    offset: usize,
) -> Result<Vec<Key>> {
    collect(tx, query, prefetch, limit, offset, false, |e| Some(e.key))
}

/// Primary keys in iteration order.
pub fn primary_keys(
    tx: &dyn Transaction,
    query: &Query,
    prefetch: usize,
    limit: Option<usize>,
    offset: usize,
) -> Result<Vec<Key>> {
    collect(tx, query, prefetch, limit, offset, false, |e| Some(e.primary_key))
}

/// Record values in iteration order.
pub fn values(
    tx: &dyn Transaction,
    query: &Query,
    prefetch: usize,
    limit: Option<usize>,
    offset: usize,
) -> Result<Vec<Value>> {
    collect(tx, query, prefetch, limit, offset, true, |e| e.value)
}
