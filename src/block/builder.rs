use bytes::BufMut;

use super::{Block, LEN_VAR_SIZE, TRANC_ID_SIZE};
use crate::key::{KeySlice, KeyVec};

/// Builds a block under a soft byte budget.
///
/// The caller must append in composite order: keys non-decreasing,
/// and for equal keys, tranc_id strictly decreasing. The builder is
/// fed from already-ordered sources (a skiplist drain or a merge
/// iterator), so the ordering is asserted, not re-checked in release.
pub struct BlockBuilder {
    /// Serialized entries.
    data: Vec<u8>,
    /// Offset of each entry's key_len within `data`.
    offsets: Vec<u16>,
    /// The soft capacity, in encoded bytes.
    block_size: usize,
    first_key: KeyVec,
    last_key: KeyVec,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            block_size,
            first_key: KeyVec::new(),
            last_key: KeyVec::new(),
        }
    }

    /// Append an entry. Returns false when the encoded size would
    /// cross the budget and `force` is not set.
    ///
    /// The size accounting covers the whole encoded block: entry
    /// bytes, the offsets array, and the trailing count.
    #[must_use]
    pub fn add(&mut self, key: KeySlice, value: &[u8], force: bool) -> bool {
        assert!(!key.is_empty(), "key must not be empty");
        debug_assert!(
            self.is_empty() || self.last_key.as_key_slice() < key,
            "entries must arrive in composite order"
        );

        let entry_size = LEN_VAR_SIZE + key.key_len() + LEN_VAR_SIZE + value.len() + TRANC_ID_SIZE;
        if !force && self.cur_size() + entry_size + LEN_VAR_SIZE > self.block_size {
            return false;
        }

        if self.is_empty() {
            self.first_key.set_from_slice(key);
        }
        self.offsets.push(self.data.len() as u16);
        self.data.put_u16_le(key.key_len() as u16);
        self.data.put(key.key_ref());
        self.data.put_u16_le(value.len() as u16);
        self.data.put(value);
        self.data.put_u64_le(key.tranc_id());
        self.last_key.set_from_slice(key);

        true
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Encoded size if the block were sealed now.
    pub fn cur_size(&self) -> usize {
        self.data.len() + self.offsets.len() * LEN_VAR_SIZE + LEN_VAR_SIZE
    }

    pub fn first_key(&self) -> KeySlice {
        self.first_key.as_key_slice()
    }

    pub fn last_key(&self) -> KeySlice {
        self.last_key.as_key_slice()
    }

    /// Finalize the block.
    pub fn build(self) -> Block {
        assert!(!self.is_empty(), "block should not be empty");
        Block {
            data: self.data,
            offsets: self.offsets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_entries_past_the_budget() {
        let mut builder = BlockBuilder::new(48);
        assert!(builder.add(KeySlice::from_slice(b"aa", 1), b"11111111", false));
        // Entry fits the buffer but not the budget with the offsets
        // array included.
        assert!(!builder.add(KeySlice::from_slice(b"bb", 1), b"22222222", false));
        assert!(builder.add(KeySlice::from_slice(b"bb", 1), b"22222222", true));
        let block = builder.build();
        assert_eq!(block.num_entries(), 2);
    }

    #[test]
    fn tracks_first_and_last_key() {
        let mut builder = BlockBuilder::new(4096);
        assert!(builder.add(KeySlice::from_slice(b"aa", 2), b"x", false));
        assert!(builder.add(KeySlice::from_slice(b"bb", 9), b"y", false));
        assert_eq!(builder.first_key().key_ref(), b"aa");
        assert_eq!(builder.last_key().key_ref(), b"bb");
        assert_eq!(builder.last_key().tranc_id(), 9);
    }

    #[test]
    fn accounted_size_matches_encoded_size() {
        let mut builder = BlockBuilder::new(4096);
        assert!(builder.add(KeySlice::from_slice(b"k1", 1), b"value", false));
        assert!(builder.add(KeySlice::from_slice(b"k2", 1), b"", false));
        let accounted = builder.cur_size();
        let block = builder.build();
        assert_eq!(accounted, block.encode().len());
    }
}
