use std::fmt;

use crate::object::Revision;

/// An index key: an arbitrary byte string.
///
/// Integers convert big-endian so that byte order matches numeric order.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the key, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(&self.0))
    }
}

/// Printable keys show as text, anything else as hex.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => f.write_str(s),
            _ => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

macro_rules! key_from_be {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Key {
                fn from(value: $ty) -> Self {
                    Self(value.to_be_bytes().to_vec())
                }
            }
        )*
    };
}

key_from_be!(u8, u16, u32, u64, u128);

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Self(vec![u8::from(value)])
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&String> for Key {
    fn from(value: &String) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Key {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// The keys an object produces for one index.
///
/// Primary indexes require exactly one key; secondary indexes may produce
/// none or several. Duplicates are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySet(Vec<Key>);

impl KeySet {
    /// No keys: the object is absent from the index.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Exactly one key.
    pub fn single(key: impl Into<Key>) -> Self {
        Self(vec![key.into()])
    }

    /// Add a key, ignoring duplicates.
    pub fn push(&mut self, key: impl Into<Key>) {
        let key = key.into();
        if !self.0.contains(&key) {
            self.0.push(key);
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the keys in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }
}

impl From<Key> for KeySet {
    fn from(key: Key) -> Self {
        Self(vec![key])
    }
}

impl<K: Into<Key>> FromIterator<K> for KeySet {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut set = Self::empty();
        for key in iter {
            set.push(key);
        }
        set
    }
}

impl IntoIterator for KeySet {
    type Item = Key;
    type IntoIter = std::vec::IntoIter<Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Key under which a non-unique index stores an object:
/// `secondary ++ primary ++ u16 BE len(secondary)`.
///
/// Returns `None` if the secondary key does not fit the length suffix.
pub(crate) fn encode_non_unique(secondary: &[u8], primary: &[u8]) -> Option<Vec<u8>> {
    let len = u16::try_from(secondary.len()).ok()?;
    let mut out = Vec::with_capacity(secondary.len() + primary.len() + 2);
    out.extend_from_slice(secondary);
    out.extend_from_slice(primary);
    out.extend_from_slice(&len.to_be_bytes());
    Some(out)
}

/// Length of the secondary part of a non-unique index key.
pub(crate) fn non_unique_secondary_len(encoded: &[u8]) -> Option<usize> {
    let split = encoded.len().checked_sub(2)?;
    let len = u16::from_be_bytes([encoded[split], encoded[split + 1]]) as usize;
    (len <= split).then_some(len)
}

pub(crate) fn revision_key(revision: Revision) -> [u8; 8] {
    revision.to_be_bytes()
}

/// Graveyard key: `u64 BE revision ++ primary`, ordered by deletion.
pub(crate) fn graveyard_key(revision: Revision, primary: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + primary.len());
    out.extend_from_slice(&revision.to_be_bytes());
    out.extend_from_slice(primary);
    out
}
