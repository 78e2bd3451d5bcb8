/// Key ranges
///
/// A range is an immutable pair of optional bounds, each open or closed.
/// Ranges are validated on construction, so every `KeyRange` value is
/// well formed.

use crate::{Error, Key, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Comparison operator for building ranges from a single condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// key = value
    Equal,
    /// key < value
    LessThan,
    /// key <= value
    LessThanOrEqual,
    /// key > value
    GreaterThan,
    /// key >= value
    GreaterThanOrEqual,
    /// key begins with value
    BeginsWith,
}

impl FromStr for Comparison {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" | "==" => Ok(Comparison::Equal),
            "<" => Ok(Comparison::LessThan),
            "<=" => Ok(Comparison::LessThanOrEqual),
            ">" => Ok(Comparison::GreaterThan),
            ">=" => Ok(Comparison::GreaterThanOrEqual),
            "^" => Ok(Comparison::BeginsWith),
            other => Err(Error::InvalidValue(format!("unknown comparison '{}'", other))),
        }
    }
}

/// Contiguous set of keys between two optional bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    fn new(lower: Option<Key>, upper: Option<Key>, lower_open: bool, upper_open: bool) -> Result<Self> {
        if let Some(lower) = &lower {
            lower.validate()?;
        }
        if let Some(upper) = &upper {
            upper.validate()?;
        }
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            match lo.cmp(hi) {
                std::cmp::Ordering::Greater => {
                    return Err(Error::InvalidValue(format!(
                        "lower bound {} is greater than upper bound {}",
                        lo, hi
                    )));
                }
                std::cmp::Ordering::Equal if lower_open || upper_open => {
                    return Err(Error::InvalidValue(format!(
                        "empty range: bounds equal to {} but not both closed",
                        lo
                    )));
                }
                _ => {}
            }
        }
        Ok(Self {
            lower,
            upper,
            lower_open,
            upper_open,
        })
    }

    /// Range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Result<Self> {
        let key = key.into();
        Self::new(Some(key.clone()), Some(key), false, false)
    }

    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Result<Self> {
        Self::new(Some(key.into()), None, open, false)
    }

    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Result<Self> {
        Self::new(None, Some(key.into()), false, open)
    }

    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        Self::new(Some(lower.into()), Some(upper.into()), lower_open, upper_open)
    }

    /// Range of keys starting with `prefix`.
    ///
    /// For arrays this is every array whose leading components equal the
    /// prefix, for strings and binaries every value with that prefix. Numbers
    /// and dates have no proper prefixes and match only themselves.
    pub fn starts(prefix: impl Into<Key>) -> Result<Self> {
        let prefix = prefix.into();
        match &prefix {
            Key::Array(items) => match items.split_last() {
                None => Self::new(Some(prefix.clone()), None, false, false),
                Some((last, head)) => {
                    let mut upper = head.to_vec();
                    upper.push(last.successor());
                    Self::new(Some(prefix.clone()), Some(Key::Array(upper)), false, true)
                }
            },
            Key::String(s) => {
                let upper = string_prefix_end(s).unwrap_or_else(|| Key::Binary(Bytes::new()));
                Self::new(Some(prefix.clone()), Some(upper), false, true)
            }
            Key::Binary(b) => {
                let upper = binary_prefix_end(b).unwrap_or_else(|| Key::Array(Vec::new()));
                Self::new(Some(prefix.clone()), Some(upper), false, true)
            }
            Key::Number(_) | Key::Date(_) => Self::only(prefix),
        }
    }

    /// Range from a single comparison, e.g. `when(Comparison::GreaterThan, 3)`.
    pub fn when(op: Comparison, value: impl Into<Key>) -> Result<Self> {
        let value = value.into();
        match op {
            Comparison::Equal => Self::only(value),
            Comparison::LessThan => Self::upper_bound(value, true),
            Comparison::LessThanOrEqual => Self::upper_bound(value, false),
            Comparison::GreaterThan => Self::lower_bound(value, true),
            Comparison::GreaterThanOrEqual => Self::lower_bound(value, false),
            Comparison::BeginsWith => Self::starts(value),
        }
    }

    /// Range from a lower and an upper comparison, e.g. `> 1` and `<= 5`.
    pub fn between_ops(
        lower_op: Comparison,
        lower: impl Into<Key>,
        upper_op: Comparison,
        upper: impl Into<Key>,
    ) -> Result<Self> {
        let lower_open = match lower_op {
            Comparison::GreaterThan => true,
            Comparison::GreaterThanOrEqual => false,
            other => {
                return Err(Error::InvalidValue(format!(
                    "{:?} cannot start a two-sided range",
                    other
                )))
            }
        };
        let upper_open = match upper_op {
            Comparison::LessThan => true,
            Comparison::LessThanOrEqual => false,
            other => {
                return Err(Error::InvalidValue(format!(
                    "{:?} cannot end a two-sided range",
                    other
                )))
            }
        };
        Self::bound(lower, upper, lower_open, upper_open)
    }

    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// The single key this range matches, if it is an equality range.
    pub fn as_only(&self) -> Option<&Key> {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) if lo == hi => Some(lo),
            _ => None,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        !self.is_below(key) && !self.is_above(key)
    }

    /// True if `key` sorts before every key in the range.
    pub fn is_below(&self, key: &Key) -> bool {
        match &self.lower {
            Some(lo) if self.lower_open => key <= lo,
            Some(lo) => key < lo,
            None => false,
        }
    }

    /// True if `key` sorts after every key in the range.
    pub fn is_above(&self, key: &Key) -> bool {
        match &self.upper {
            Some(hi) if self.upper_open => key >= hi,
            Some(hi) => key > hi,
            None => false,
        }
    }
}

fn string_prefix_end(s: &str) -> Option<Key> {
    let mut chars: Vec<char> = s.chars().collect();
    while let Some(last) = chars.pop() {
        let mut code = last as u32 + 1;
        if (0xD800..0xE000).contains(&code) {
            code = 0xE000;
        }
        if let Some(next) = char::from_u32(code) {
            chars.push(next);
            return Some(Key::String(chars.into_iter().collect()));
        }
    }
    None
}

fn binary_prefix_end(b: &[u8]) -> Option<Key> {
    let mut bytes = b.to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return Some(Key::Binary(Bytes::from(bytes)));
        }
    }
    None
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(only) = self.as_only() {
            return write!(f, "={}", only);
        }
        match &self.lower {
            Some(lo) => write!(f, "{}{}", if self.lower_open { "(" } else { "[" }, lo)?,
            None => write!(f, "(-inf")?,
        }
        write!(f, ", ")?;
        match &self.upper {
            Some(hi) => write!(f, "{}{}", hi, if self.upper_open { ")" } else { "]" }),
            None => write!(f, "+inf)"),
        }
    }
}
