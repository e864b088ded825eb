use std::sync::Arc;

use crate::key::{KeySlice, KeyVec};

use super::Block;

/// Forward iterator over one block.
///
/// The current key is cached so `key()` can hand out a slice without
/// re-decoding; an empty cached key marks the end position.
pub struct BlockIterator {
    block: Arc<Block>,
    /// The current entry's key; empty when the iterator is exhausted.
    key: KeyVec,
    /// Byte range of the current value inside the block data.
    value_range: (usize, usize),
    /// Index of the current entry, in `[0, num_entries]`.
    idx: usize,
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            key: KeyVec::new(),
            value_range: (0, 0),
            idx: 0,
        }
    }

    pub fn create_and_seek_to_first(block: Arc<Block>) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_idx(0);
        iter
    }

    /// Position on entry `idx`; `idx == num_entries` yields the end
    /// iterator.
    pub fn create_and_seek_to_idx(block: Arc<Block>, idx: usize) -> Self {
        let mut iter = Self::new(block);
        iter.seek_to_idx(idx);
        iter
    }

    /// Seek to the first entry with composite key >= `key`. A miss
    /// past the last entry yields the end iterator.
    pub fn create_and_seek_to_key(block: Arc<Block>, key: KeySlice) -> Self {
        let idx = block.partition_point_composite(key);
        Self::create_and_seek_to_idx(block, idx)
    }

    pub fn key(&self) -> KeySlice {
        self.key.as_key_slice()
    }

    pub fn value(&self) -> &[u8] {
        &self.block.data[self.value_range.0..self.value_range.1]
    }

    pub fn is_valid(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn next(&mut self) {
        if self.is_valid() {
            self.seek_to_idx(self.idx + 1);
        }
    }

    fn seek_to_idx(&mut self, idx: usize) {
        self.idx = idx;
        if idx >= self.block.num_entries() {
            self.key.clear();
            self.value_range = (0, 0);
            return;
        }
        self.key.set_from_slice(self.block.entry_key_at(idx));
        self.value_range = self.block.value_range_at(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;

    fn block() -> Arc<Block> {
        let mut builder = BlockBuilder::new(4096);
        assert!(builder.add(KeySlice::from_slice(b"k1", 4), b"v1", false));
        assert!(builder.add(KeySlice::from_slice(b"k3", 2), b"v3", false));
        Arc::new(builder.build())
    }

    #[test]
    fn seek_to_key_lands_on_the_next_entry() {
        let iter = BlockIterator::create_and_seek_to_key(block(), KeySlice::from_slice(b"k2", 0));
        assert!(iter.is_valid());
        assert_eq!(iter.key().key_ref(), b"k3");
    }

    #[test]
    fn seek_past_the_end_is_invalid() {
        let iter = BlockIterator::create_and_seek_to_key(block(), KeySlice::from_slice(b"k9", 0));
        assert!(!iter.is_valid());
    }

    #[test]
    fn next_runs_off_the_end() {
        let mut iter = BlockIterator::create_and_seek_to_first(block());
        assert_eq!(iter.value(), b"v1");
        iter.next();
        assert_eq!(iter.value(), b"v3");
        iter.next();
        assert!(!iter.is_valid());
    }
}
