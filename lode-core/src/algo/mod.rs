/// Join solvers
///
/// A scan opens one cursor per query and repeatedly shows a [`Solver`] the
/// cursors' current positions. The solver answers with one [`Move`] per
/// cursor and pushes matched primary keys into its [`Sink`]. The driver
/// owns the cursors; solvers only ever see positions.

pub mod nested_loop;
pub mod sorted_merge;
pub mod zigzag_merge;

use crate::connector::Transaction;
use crate::cursor::{Cursor, CursorStats, Position};
use crate::query::Query;
use crate::{Error, Key, Result};
use tracing::debug;

pub use nested_loop::NestedLoop;
pub use sorted_merge::SortedMerge;
pub use zigzag_merge::ZigzagMerge;

/// Requested movement of one cursor
#[derive(Debug, Clone, PartialEq)]
pub enum Move {
    Stay,
    Next,
    /// Seek to the first entry at or beyond an effective key
    Continue(Key),
    /// Seek to the first entry at or beyond (effective key, primary key)
    ContinuePrimary(Key, Key),
    /// Rewind and move onto the first entry
    Restart,
}

/// Solver answer for one round
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Stop,
    /// One move per cursor, in query order
    Move(Vec<Move>),
}

/// Receiver of matched primary keys
pub trait Sink {
    fn push(&mut self, primary_key: Key) -> Result<()>;
}

impl Sink for Vec<Key> {
    fn push(&mut self, primary_key: Key) -> Result<()> {
        Vec::push(self, primary_key);
        Ok(())
    }
}

/// Join strategy driven by [`run`]
pub trait Solver {
    /// Called once before the first round.
    fn begin(&mut self, _queries: &[Query]) -> Result<()> {
        Ok(())
    }

    /// Decides the next moves from the current positions; `None` marks an
    /// exhausted cursor.
    fn solve(&mut self, positions: &[Option<Position>]) -> Result<Step>;

    /// Called once after the last round.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Work done by one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub rounds: usize,
    /// Per cursor, in query order
    pub cursors: Vec<CursorStats>,
}

impl ScanStats {
    /// Entries surfaced by all cursors together
    pub fn visited(&self) -> usize {
        self.cursors.iter().map(|c| c.visited).sum()
    }
}

/// Runs `solver` over one cursor per query until it stops or no cursor
/// moves any more. Any cursor error aborts the scan.
pub fn run(
    tx: &dyn Transaction,
    solver: &mut dyn Solver,
    queries: &[Query],
    prefetch: usize,
) -> Result<ScanStats> {
    if queries.is_empty() {
        return Err(Error::InvalidValue("scan needs at least one query".to_string()));
    }
    solver.begin(queries)?;

    let mut cursors = queries
        .iter()
        .map(|q| Cursor::new(tx, q.clone(), prefetch))
        .collect::<Result<Vec<_>>>()?;
    for cursor in &mut cursors {
        cursor.advance()?;
    }

    let mut rounds = 0;
    loop {
        let positions: Vec<Option<Position>> = cursors.iter().map(Cursor::position).collect();
        rounds += 1;
        let moves = match solver.solve(&positions)? {
            Step::Stop => break,
            Step::Move(moves) => moves,
        };
        if moves.len() != cursors.len() {
            return Err(Error::InvalidState(format!(
                "solver returned {} moves for {} cursors",
                moves.len(),
                cursors.len()
            )));
        }

        let mut moved = false;
        for ((cursor, mv), before) in cursors.iter_mut().zip(moves).zip(&positions) {
            match mv {
                Move::Stay => continue,
                Move::Next => {
                    cursor.advance()?;
                }
                Move::Continue(key) => {
                    cursor.continue_to(&key)?;
                }
                Move::ContinuePrimary(key, primary_key) => {
                    cursor.continue_primary_key(&key, &primary_key)?;
                }
                Move::Restart => {
                    cursor.restart();
                    cursor.advance()?;
                    moved = true;
                    continue;
                }
            }
            moved |= Cursor::position(cursor) != *before;
        }
        if !moved {
            break;
        }
    }

    solver.finish()?;
    let stats = ScanStats {
        rounds,
        cursors: cursors.iter().map(Cursor::stats).collect(),
    };
    debug!(rounds, visited = stats.visited(), "scan finished");
    Ok(stats)
}

/// Common direction of all queries.
pub(crate) fn common_direction(queries: &[Query]) -> Result<bool> {
    let reverse = queries.first().map_or(false, |q| q.reverse);
    if queries.iter().any(|q| q.reverse != reverse) {
        return Err(Error::InvalidValue(
            "merge solvers need every query in the same direction".to_string(),
        ));
    }
    Ok(reverse)
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::connector::{MemoryConnector, MemoryEngine, StorageConnector, TransactionMode};
    use crate::schema::{DatabaseSchema, IndexSchema, KeyPath, StoreSchema};
    use crate::Value;

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

    pub fn animals() -> MemoryConnector {
        let schema = DatabaseSchema::new().with_store(
            StoreSchema::new("animals")
                .with_key_path("id")
                .with_index(IndexSchema::new("color", "color"))
                .with_index(IndexSchema::new("horn", "horn"))
                .with_index(IndexSchema::new("legs", "legs"))
                .with_index(IndexSchema::new("horn_name", KeyPath::composite(["horn", "name"])))
                .with_index(IndexSchema::new("legs_name", KeyPath::composite(["legs", "name"]))),
        );
        let connector = MemoryConnector::new(MemoryEngine::new());
        connector.connect("zoo", &schema).unwrap();
        connector
            .do_transaction(&["animals"], TransactionMode::ReadWrite, &mut |tx| {
                for (id, name, color, horn, legs) in ANIMALS {
                    let record = serde_json::json!({
                        "id": id, "name": name, "color": color, "horn": horn, "legs": legs
                    });
                    tx.put("animals", Value::from_json(record), None)?;
                }
                Ok(())
            })
            .unwrap();
        connector
    }
}
