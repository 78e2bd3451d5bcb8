/// Comparable keys and their order-preserving binary encoding
///
/// Keys order first by type (number < date < string < binary < array) and
/// then by value. Arrays compare element by element, a shorter array that is
/// a prefix of a longer one sorts first.

use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

const TAG_END: u8 = 0x00;
const TAG_NUMBER: u8 = 0x10;
const TAG_DATE: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_BINARY: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;

const ESCAPE: u8 = 0x01;
const SIGN_BIT: u64 = 1 << 63;

/// Key addressing a record in a store or an entry in an index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    /// Finite or infinite number, never NaN
    Number(f64),
    /// Milliseconds since the epoch
    Date(i64),
    String(String),
    Binary(Bytes),
    /// Composite key
    Array(Vec<Key>),
}

impl Key {
    /// Smallest possible key.
    pub const MIN: Key = Key::Number(f64::NEG_INFINITY);

    /// Number key, rejecting NaN.
    pub fn number(n: f64) -> Result<Self> {
        if n.is_nan() {
            return Err(Error::InvalidValue("NaN is not a valid key".to_string()));
        }
        Ok(Key::Number(normalize_zero(n)))
    }

    pub fn date(millis: i64) -> Self {
        Key::Date(millis)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Key::String(s.into())
    }

    pub fn binary(b: impl Into<Bytes>) -> Self {
        Key::Binary(b.into())
    }

    pub fn array(items: impl IntoIterator<Item = Key>) -> Self {
        Key::Array(items.into_iter().collect())
    }

    /// Checks that no component is NaN.
    pub fn validate(&self) -> Result<()> {
        match self {
            Key::Number(n) if n.is_nan() => {
                Err(Error::InvalidValue("NaN is not a valid key".to_string()))
            }
            Key::Array(items) => items.iter().try_for_each(Key::validate),
            _ => Ok(()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Key]> {
        match self {
            Key::Array(items) => Some(items),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::String(_) => 2,
            Key::Binary(_) => 3,
            Key::Array(_) => 4,
        }
    }

    /// Returns the immediate successor: the smallest key strictly greater
    /// than `self`. Every key has one, arrays are unbounded above.
    pub fn successor(&self) -> Key {
        match self {
            Key::Number(n) if *n == f64::INFINITY => Key::Date(i64::MIN),
            Key::Number(n) => Key::Number(next_up(*n)),
            Key::Date(d) if *d == i64::MAX => Key::String(String::new()),
            Key::Date(d) => Key::Date(d + 1),
            Key::String(s) => {
                let mut next = s.clone();
                next.push('\0');
                Key::String(next)
            }
            Key::Binary(b) => {
                let mut next = b.to_vec();
                next.push(0);
                Key::Binary(Bytes::from(next))
            }
            Key::Array(items) => {
                let mut next = items.clone();
                next.push(Key::MIN);
                Key::Array(next)
            }
        }
    }

    /// Encodes the key so that byte-wise comparison of encodings matches
    /// key comparison.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Key::Number(n) => {
                out.push(TAG_NUMBER);
                let bits = normalize_zero(*n).to_bits();
                let ordered = if bits & SIGN_BIT != 0 { !bits } else { bits ^ SIGN_BIT };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Key::Date(d) => {
                out.push(TAG_DATE);
                out.extend_from_slice(&((*d as u64) ^ SIGN_BIT).to_be_bytes());
            }
            Key::String(s) => {
                out.push(TAG_STRING);
                escape_into(s.as_bytes(), out);
            }
            Key::Binary(b) => {
                out.push(TAG_BINARY);
                escape_into(b, out);
            }
            Key::Array(items) => {
                out.push(TAG_ARRAY);
                for item in items {
                    item.encode_into(out);
                }
                out.push(TAG_END);
            }
        }
    }

    /// Decodes a key produced by [`Key::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Key> {
        let mut pos = 0;
        let key = decode_at(bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(Error::Serialization(format!(
                "trailing {} bytes after encoded key",
                bytes.len() - pos
            )));
        }
        Ok(key)
    }
}

fn normalize_zero(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

fn next_up(n: f64) -> f64 {
    if n == 0.0 {
        return f64::from_bits(1);
    }
    let bits = n.to_bits();
    if n > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b <= ESCAPE {
            out.push(ESCAPE);
            out.push(b + 1);
        } else {
            out.push(b);
        }
    }
    out.push(TAG_END);
}

fn unescape_at(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = *bytes
            .get(*pos)
            .ok_or_else(|| Error::Serialization("unterminated key component".to_string()))?;
        *pos += 1;
        match b {
            TAG_END => return Ok(out),
            ESCAPE => {
                let escaped = *bytes
                    .get(*pos)
                    .ok_or_else(|| Error::Serialization("dangling escape byte".to_string()))?;
                *pos += 1;
                out.push(escaped - 1);
            }
            other => out.push(other),
        }
    }
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let end = *pos + 8;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| Error::Serialization("truncated key".to_string()))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    *pos = end;
    Ok(u64::from_be_bytes(buf))
}

fn decode_at(bytes: &[u8], pos: &mut usize) -> Result<Key> {
    let tag = *bytes
        .get(*pos)
        .ok_or_else(|| Error::Serialization("empty key".to_string()))?;
    *pos += 1;

    match tag {
        TAG_NUMBER => {
            let ordered = read_u64(bytes, pos)?;
            let bits = if ordered & SIGN_BIT != 0 { ordered ^ SIGN_BIT } else { !ordered };
            Ok(Key::Number(f64::from_bits(bits)))
        }
        TAG_DATE => Ok(Key::Date((read_u64(bytes, pos)? ^ SIGN_BIT) as i64)),
        TAG_STRING => {
            let raw = unescape_at(bytes, pos)?;
            String::from_utf8(raw)
                .map(Key::String)
                .map_err(|e| Error::Serialization(e.to_string()))
        }
        TAG_BINARY => Ok(Key::Binary(Bytes::from(unescape_at(bytes, pos)?))),
        TAG_ARRAY => {
            let mut items = Vec::new();
            loop {
                match bytes.get(*pos) {
                    Some(&TAG_END) => {
                        *pos += 1;
                        return Ok(Key::Array(items));
                    }
                    Some(_) => items.push(decode_at(bytes, pos)?),
                    None => {
                        return Err(Error::Serialization("unterminated array key".to_string()))
                    }
                }
            }
        }
        other => Err(Error::Serialization(format!("unknown key tag 0x{:02x}", other))),
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Key::Date(a), Key::Date(b)) => a.cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Key::Number(n) => normalize_zero(*n).to_bits().hash(state),
            Key::Date(d) => d.hash(state),
            Key::String(s) => s.hash(state),
            Key::Binary(b) => b.hash(state),
            Key::Array(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Key::Number(n) => write!(f, "{}", n),
            Key::Date(d) => write!(f, "Date({})", d),
            Key::String(s) => write!(f, "{:?}", s),
            Key::Binary(b) => {
                write!(f, "0x")?;
                for byte in b.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Bytes> for Key {
    fn from(b: Bytes) -> Self {
        Key::Binary(b)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}
