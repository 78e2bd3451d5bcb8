/// Zigzag merge join
///
/// Joins cursors over different indexes whose keys share a constant prefix,
/// e.g. `[horn, name]` restricted to `horn = 2` and `[legs, name]`
/// restricted to `legs = 4`. Within its prefix each cursor is ordered by
/// (last key component, primary key), so the cursor that is furthest ahead
/// sets a target and every lagging cursor seeks straight to it instead of
/// stepping. Scalar keys (an equality range on a plain index, or the store
/// itself) are ordered by primary key alone.

use super::{common_direction, Move, Sink, Solver, Step};
use crate::cursor::Position;
use crate::query::Query;
use crate::{Error, Key, Result};
use std::cmp::Ordering;
use tracing::debug;

/// Merge order of one position: (last key component, primary key)
type Token = (Option<Key>, Key);

pub struct ZigzagMerge<S = Vec<Key>> {
    out: S,
    reverse: bool,
    /// Cursors walking primary keys
    primary: Vec<bool>,
    /// First prefix seen per cursor
    prefixes: Vec<Option<Vec<Key>>>,
    matches: usize,
}

impl<S: Sink> ZigzagMerge<S> {
    pub fn new(out: S) -> Self {
        Self {
            out,
            reverse: false,
            primary: Vec::new(),
            prefixes: Vec::new(),
            matches: 0,
        }
    }

    pub fn output(&self) -> &S {
        &self.out
    }

    pub fn into_output(self) -> S {
        self.out
    }

    fn split(&self, i: usize, position: &Position) -> (Vec<Key>, Token) {
        if self.primary[i] {
            return (Vec::new(), (None, position.primary_key.clone()));
        }
        match &position.key {
            Key::Array(items) if items.len() >= 2 => {
                let (last, prefix) = items.split_last().map_or((None, &items[..]), |(l, p)| (Some(l), p));
                (prefix.to_vec(), (last.cloned(), position.primary_key.clone()))
            }
            key => (vec![key.clone()], (None, position.primary_key.clone())),
        }
    }

    fn compare(&self, a: &Token, b: &Token) -> Ordering {
        if self.reverse {
            b.cmp(a)
        } else {
            a.cmp(b)
        }
    }

    fn check_prefix(&mut self, i: usize, prefix: Vec<Key>) -> Result<Vec<Key>> {
        match &self.prefixes[i] {
            Some(seen) if *seen != prefix => Err(Error::InvalidState(format!(
                "zigzag input {} left its key prefix {} for {}",
                i,
                Key::Array(seen.clone()),
                Key::Array(prefix)
            ))),
            Some(_) => Ok(prefix),
            None => {
                self.prefixes[i] = Some(prefix.clone());
                Ok(prefix)
            }
        }
    }
}

impl<S: Sink> Solver for ZigzagMerge<S> {
    fn begin(&mut self, queries: &[Query]) -> Result<()> {
        self.reverse = common_direction(queries)?;
        self.primary = queries.iter().map(Query::is_primary).collect();
        self.prefixes = vec![None; queries.len()];
        Ok(())
    }

    fn solve(&mut self, positions: &[Option<Position>]) -> Result<Step> {
        let mut prefixes = Vec::with_capacity(positions.len());
        let mut tokens = Vec::with_capacity(positions.len());
        for (i, position) in positions.iter().enumerate() {
            let Some(position) = position else {
                return Ok(Step::Stop);
            };
            let (prefix, token) = self.split(i, position);
            prefixes.push(self.check_prefix(i, prefix)?);
            tokens.push(token);
        }

        let composite = tokens.iter().filter(|(postfix, _)| postfix.is_some()).count();
        if composite != 0 && composite != tokens.len() {
            return Err(Error::InvalidValue(
                "zigzag merge cannot mix composite and scalar keys".to_string(),
            ));
        }

        let Some(target) = tokens.iter().max_by(|a, b| self.compare(a, b)).cloned() else {
            return Ok(Step::Stop);
        };
        if tokens.iter().all(|t| *t == target) {
            self.out.push(target.1)?;
            self.matches += 1;
            return Ok(Step::Move(vec![Move::Next; tokens.len()]));
        }

        let (postfix, primary_key) = target;
        let moves = tokens
            .iter()
            .zip(prefixes)
            .enumerate()
            .map(|(i, (token, mut prefix))| {
                if token.0 == postfix && token.1 == primary_key {
                    Move::Stay
                } else if self.primary[i] {
                    Move::ContinuePrimary(primary_key.clone(), primary_key.clone())
                } else if let Some(postfix) = &postfix {
                    prefix.push(postfix.clone());
                    Move::ContinuePrimary(Key::Array(prefix), primary_key.clone())
                } else {
                    let key = prefix.pop().unwrap_or(Key::MIN);
                    Move::ContinuePrimary(key, primary_key.clone())
                }
            })
            .collect();
        Ok(Step::Move(moves))
    }

    fn finish(&mut self) -> Result<()> {
        debug!(matches = self.matches, "zigzag merge join finished");
        Ok(())
    }
}
