/// Sorted-merge join
///
/// Every cursor must yield its join key in the same order, the primary key
/// by default. Each round either emits a key all cursors agree on and steps
/// all of them, or steps only the cursors holding the lowest key. Input that
/// goes backwards is rejected rather than producing a wrong intersection.

use super::{common_direction, Move, Sink, Solver, Step};
use crate::cursor::Position;
use crate::query::Query;
use crate::{Error, Key, Result};
use std::cmp::Ordering;
use tracing::debug;

pub struct SortedMerge<S = Vec<Key>> {
    out: S,
    effective_key: bool,
    reverse: bool,
    last: Vec<Option<Key>>,
    matches: usize,
}

impl<S: Sink> SortedMerge<S> {
    /// Merge on primary keys
    pub fn new(out: S) -> Self {
        Self {
            out,
            effective_key: false,
            reverse: false,
            last: Vec::new(),
            matches: 0,
        }
    }

    /// Merge on effective keys; the primary key of the first cursor is
    /// emitted.
    pub fn on_effective_key(mut self) -> Self {
        self.effective_key = true;
        self
    }

    pub fn output(&self) -> &S {
        &self.out
    }

    pub fn into_output(self) -> S {
        self.out
    }

    fn join_key<'p>(&self, position: &'p Position) -> &'p Key {
        if self.effective_key {
            &position.key
        } else {
            &position.primary_key
        }
    }

    /// Orders keys so that `Less` means "comes first" in the scan direction.
    fn compare(&self, a: &Key, b: &Key) -> Ordering {
        if self.reverse {
            b.cmp(a)
        } else {
            a.cmp(b)
        }
    }
}

impl<S: Sink> Solver for SortedMerge<S> {
    fn begin(&mut self, queries: &[Query]) -> Result<()> {
        self.reverse = common_direction(queries)?;
        self.last = vec![None; queries.len()];
        Ok(())
    }

    fn solve(&mut self, positions: &[Option<Position>]) -> Result<Step> {
        let mut keys = Vec::with_capacity(positions.len());
        for position in positions {
            match position {
                Some(p) => keys.push(self.join_key(p).clone()),
                None => return Ok(Step::Stop),
            }
        }

        for (i, key) in keys.iter().enumerate() {
            if let Some(last) = &self.last[i] {
                if self.compare(key, last) == Ordering::Less {
                    return Err(Error::InvalidState(format!(
                        "sorted merge input {} went from {} back to {}",
                        i, last, key
                    )));
                }
            }
            self.last[i] = Some(key.clone());
        }

        let Some(lowest) = keys.iter().min_by(|a, b| self.compare(a, b)).cloned() else {
            return Ok(Step::Stop);
        };
        if keys.iter().all(|k| *k == lowest) {
            if let Some(Some(first)) = positions.first() {
                self.out.push(first.primary_key.clone())?;
                self.matches += 1;
            }
            return Ok(Step::Move(vec![Move::Next; keys.len()]));
        }

        let moves = keys
            .iter()
            .map(|k| if *k == lowest { Move::Next } else { Move::Stay })
            .collect();
        Ok(Step::Move(moves))
    }

    fn finish(&mut self) -> Result<()> {
        debug!(matches = self.matches, "sorted merge join finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::run;
    use crate::algo::testing::animals;
    use crate::connector::{StorageConnector, TransactionMode};

    fn join(solver: &mut SortedMerge, queries: &[Query]) -> Result<()> {
        animals().do_transaction(&["animals"], TransactionMode::ReadOnly, &mut |tx| {
            run(&*tx, &mut *solver, queries, 2).map(|_| ())
        })
    }

    #[test]
    fn test_merge_on_primary_key() {
        let queries = [
            Query::index("animals", "horn").only(2).unwrap(),
            Query::index("animals", "color").only("spots").unwrap(),
            Query::index("animals", "legs").only(4).unwrap(),
        ];
        let mut solver = SortedMerge::new(Vec::new());
        join(&mut solver, &queries).unwrap();
        assert_eq!(solver.into_output(), vec![Key::from(2), Key::from(7)]);
    }

    #[test]
    fn test_merge_reverse() {
        let queries = [
            Query::index("animals", "horn").only(2).unwrap().reverse(),
            Query::index("animals", "color").only("spots").unwrap().reverse(),
        ];
        let mut solver = SortedMerge::new(Vec::new());
        join(&mut solver, &queries).unwrap();
        assert_eq!(solver.into_output(), vec![Key::from(7), Key::from(2)]);
    }

    #[test]
    fn test_merge_on_effective_key() {
        let queries = [
            Query::store("animals").with_range(crate::KeyRange::upper_bound(4, false).unwrap()),
            Query::store("animals").with_range(crate::KeyRange::lower_bound(3, false).unwrap()),
        ];
        let mut solver = SortedMerge::new(Vec::new()).on_effective_key();
        join(&mut solver, &queries).unwrap();
        assert_eq!(solver.into_output(), vec![Key::from(3), Key::from(4)]);
    }

    #[test]
    fn test_out_of_order_input_rejected() {
        // The color index walks primary keys out of order across colors.
        let queries = [
            Query::index("animals", "color"),
            Query::store("animals"),
        ];
        let mut solver = SortedMerge::new(Vec::new());
        assert!(matches!(join(&mut solver, &queries), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_mixed_directions_rejected() {
        let queries = [
            Query::store("animals"),
            Query::store("animals").reverse(),
        ];
        let mut solver = SortedMerge::new(Vec::new());
        assert!(matches!(join(&mut solver, &queries), Err(Error::InvalidValue(_))));
    }
}
