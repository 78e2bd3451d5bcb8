/// Nested-loop join
///
/// The first cursor drives. For each of its primary keys every other cursor
/// is rewound and scanned until it shows the same primary key or runs out.
/// Costs `outer × Σ inner` steps but makes no assumption about the order of
/// any cursor. A primary key is emitted once even when a multi-entry outer
/// index lists the record under several keys.

use super::{Move, Sink, Solver, Step};
use crate::cursor::Position;
use crate::{Key, Result};
use std::collections::BTreeSet;
use tracing::debug;

pub struct NestedLoop<S = Vec<Key>> {
    out: S,
    emitted: BTreeSet<Key>,
}

impl<S: Sink> NestedLoop<S> {
    pub fn new(out: S) -> Self {
        Self {
            out,
            emitted: BTreeSet::new(),
        }
    }

    pub fn output(&self) -> &S {
        &self.out
    }

    pub fn into_output(self) -> S {
        self.out
    }
}

impl<S: Sink> Solver for NestedLoop<S> {
    fn solve(&mut self, positions: &[Option<Position>]) -> Result<Step> {
        let Some((Some(outer), inner)) = positions.split_first() else {
            return Ok(Step::Stop);
        };
        if self.emitted.contains(&outer.primary_key) {
            return Ok(Step::Move(rewind(positions.len())));
        }

        let mut moves = vec![Move::Stay; positions.len()];
        for (i, cursor) in inner.iter().enumerate() {
            match cursor {
                Some(p) if p.primary_key == outer.primary_key => continue,
                Some(_) => {
                    moves[i + 1] = Move::Next;
                    return Ok(Step::Move(moves));
                }
                None => {
                    // Some inner cursor lacks the outer key; try the next one.
                    return Ok(Step::Move(rewind(positions.len())));
                }
            }
        }

        self.out.push(outer.primary_key.clone())?;
        self.emitted.insert(outer.primary_key.clone());
        Ok(Step::Move(rewind(positions.len())))
    }

    fn finish(&mut self) -> Result<()> {
        debug!(matches = self.emitted.len(), "nested loop join finished");
        Ok(())
    }
}

fn rewind(len: usize) -> Vec<Move> {
    let mut moves = vec![Move::Restart; len];
    moves[0] = Move::Next;
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::run;
    use crate::algo::testing::animals;
    use crate::connector::{StorageConnector, TransactionMode};
    use crate::query::Query;

    fn join(queries: &[Query]) -> Vec<Key> {
        let connector = animals();
        let mut solver = NestedLoop::new(Vec::new());
        connector
            .do_transaction(&["animals"], TransactionMode::ReadOnly, &mut |tx| {
                run(&*tx, &mut solver, queries, 3).map(|_| ())
            })
            .unwrap();
        solver.into_output()
    }

    #[test]
    fn test_three_way_join() {
        let queries = [
            Query::index("animals", "horn").only(2).unwrap(),
            Query::index("animals", "color").only("spots").unwrap(),
            Query::index("animals", "legs").only(4).unwrap(),
        ];
        assert_eq!(join(&queries), vec![Key::from(2), Key::from(7)]);
    }

    #[test]
    fn test_unordered_inner_cursor() {
        let queries = [
            Query::index("animals", "color").only("spots").unwrap(),
            Query::index("animals", "legs").reverse(),
        ];
        assert_eq!(
            join(&queries),
            vec![Key::from(2), Key::from(4), Key::from(5), Key::from(7)]
        );
    }

    #[test]
    fn test_single_query_echoes_outer() {
        let queries = [Query::index("animals", "horn").only(10).unwrap()];
        assert_eq!(join(&queries), vec![Key::from(3)]);
    }

    #[test]
    fn test_empty_inner_cursor() {
        let queries = [
            Query::index("animals", "color").only("spots").unwrap(),
            Query::index("animals", "horn").only(99).unwrap(),
        ];
        assert!(join(&queries).is_empty());
    }
}
