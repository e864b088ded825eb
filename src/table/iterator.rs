use std::sync::Arc;

use anyhow::Result;

use super::SsTable;
use crate::block::{Block, BlockIterator};
use crate::iterators::StorageIterator;
use crate::key::KeySlice;

/// Cursor over one table, chaining its block iterators.
pub struct SsTableIterator {
    table: Arc<SsTable>,
    blk_iter: Option<BlockIterator>,
    blk_idx: usize,
}

impl SsTableIterator {
    pub fn create_and_seek_to_first(table: Arc<SsTable>) -> Result<Self> {
        let block = table.read_block_cached(0)?;
        Ok(Self {
            blk_iter: Some(BlockIterator::create_and_seek_to_first(block)),
            table,
            blk_idx: 0,
        })
    }

    /// Seek to the first entry with composite key >= `key`.
    ///
    /// A run of one user key may straddle a block boundary, so a seek
    /// that exhausts one block retries in the following ones.
    pub fn create_and_seek_to_key(table: Arc<SsTable>, key: KeySlice) -> Result<Self> {
        let mut blk_idx = table
            .block_meta
            .partition_point(|meta| meta.last_key.as_ref() < key.key_ref());
        while blk_idx < table.num_blocks() {
            let block = table.read_block_cached(blk_idx)?;
            let iter = BlockIterator::create_and_seek_to_key(block, key);
            if iter.is_valid() {
                return Ok(Self {
                    table,
                    blk_iter: Some(iter),
                    blk_idx,
                });
            }
            blk_idx += 1;
        }
        Ok(Self::create_end(table))
    }

    /// Position directly on a known entry, for point lookups that
    /// already ran the in-block binary search.
    pub(crate) fn create_at(
        table: Arc<SsTable>,
        blk_idx: usize,
        block: Arc<Block>,
        entry_idx: usize,
    ) -> Self {
        Self {
            table,
            blk_iter: Some(BlockIterator::create_and_seek_to_idx(block, entry_idx)),
            blk_idx,
        }
    }

    pub(crate) fn create_end(table: Arc<SsTable>) -> Self {
        let blk_idx = table.num_blocks();
        Self {
            table,
            blk_iter: None,
            blk_idx,
        }
    }
}

impl StorageIterator for SsTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.blk_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.blk_iter.as_ref().unwrap().value()
    }

    fn is_valid(&self) -> bool {
        self.blk_iter
            .as_ref()
            .map(|iter| iter.is_valid())
            .unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        let Some(iter) = self.blk_iter.as_mut() else {
            return Ok(());
        };
        iter.next();
        if !iter.is_valid() {
            self.blk_idx += 1;
            if self.blk_idx < self.table.num_blocks() {
                let block = self.table.read_block_cached(self.blk_idx)?;
                self.blk_iter = Some(BlockIterator::create_and_seek_to_first(block));
            } else {
                self.blk_iter = None;
            }
        }
        Ok(())
    }

    fn num_active_iterators(&self) -> usize {
        1
    }
}
