use std::cmp::Ordering;
use std::fmt::{self, Debug};

use bytes::Bytes;

/// Seek marker for the newest version of a user key. Versions of one
/// key sort by transaction id descending, so the maximum id comes
/// first.
pub const TRANC_ID_RANGE_BEGIN: u64 = u64::MAX;
/// Seek marker for the oldest version of a user key.
pub const TRANC_ID_RANGE_END: u64 = 0;

/// A user key paired with the transaction id of one version.
///
/// All ordered structures in the crate (blocks, skiplists, merge
/// iterators) compare this composite as a single unit: key bytes
/// ascending, then transaction id descending. Keeping the comparator
/// in one place is what makes block binary search and skiplist search
/// agree on where a version lives.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Key<T: AsRef<[u8]>> {
    key: T,
    tranc_id: u64,
}

pub type KeySlice<'a> = Key<&'a [u8]>;
pub type KeyVec = Key<Vec<u8>>;
pub type KeyBytes = Key<Bytes>;

impl<T: AsRef<[u8]>> Key<T> {
    pub fn key_ref(&self) -> &[u8] {
        self.key.as_ref()
    }

    pub fn key_len(&self) -> usize {
        self.key.as_ref().len()
    }

    pub fn tranc_id(&self) -> u64 {
        self.tranc_id
    }

    pub fn is_empty(&self) -> bool {
        self.key.as_ref().is_empty()
    }

    pub fn as_key_slice(&self) -> KeySlice {
        Key {
            key: self.key.as_ref(),
            tranc_id: self.tranc_id,
        }
    }

    pub fn to_key_vec(&self) -> KeyVec {
        Key {
            key: self.key.as_ref().to_vec(),
            tranc_id: self.tranc_id,
        }
    }
}

impl<'a> KeySlice<'a> {
    pub fn from_slice(key: &'a [u8], tranc_id: u64) -> Self {
        Self { key, tranc_id }
    }

    pub fn raw_ref(self) -> &'a [u8] {
        self.key
    }
}

impl KeyVec {
    /// An empty key, used as the "invalid" sentinel by iterators.
    pub fn new() -> Self {
        Self {
            key: Vec::new(),
            tranc_id: 0,
        }
    }

    pub fn from_vec(key: Vec<u8>, tranc_id: u64) -> Self {
        Self { key, tranc_id }
    }

    pub fn clear(&mut self) {
        self.key.clear();
        self.tranc_id = 0;
    }

    pub fn set_from_slice(&mut self, key: KeySlice) {
        self.key.clear();
        self.key.extend_from_slice(key.key_ref());
        self.tranc_id = key.tranc_id();
    }

    pub fn into_key_bytes(self) -> KeyBytes {
        Key {
            key: self.key.into(),
            tranc_id: self.tranc_id,
        }
    }
}

impl KeyBytes {
    pub fn from_bytes(key: Bytes, tranc_id: u64) -> Self {
        Self { key, tranc_id }
    }
}

impl<T: AsRef<[u8]> + Eq> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: AsRef<[u8]> + Eq> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .as_ref()
            .cmp(other.key.as_ref())
            .then_with(|| other.tranc_id.cmp(&self.tranc_id))
    }
}

impl<T: AsRef<[u8]>> Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}@{}",
            Bytes::copy_from_slice(self.key.as_ref()),
            self.tranc_id
        )
    }
}
