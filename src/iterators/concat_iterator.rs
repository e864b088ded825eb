use std::sync::Arc;

use anyhow::Result;

use super::StorageIterator;
use crate::key::KeySlice;
use crate::table::{SsTable, SsTableIterator};

/// Sequential concatenation of the non-overlapping tables of one
/// level >= 1. Child iterators are opened lazily: seeking binary
/// searches the table ranges instead of touching every file.
pub struct SstConcatIterator {
    current: Option<SsTableIterator>,
    next_sst_idx: usize,
    sstables: Vec<Arc<SsTable>>,
}

impl SstConcatIterator {
    pub fn create_and_seek_to_first(sstables: Vec<Arc<SsTable>>) -> Result<Self> {
        let mut iter = Self {
            current: None,
            next_sst_idx: 0,
            sstables,
        };
        iter.roll_forward()?;
        Ok(iter)
    }

    pub fn create_and_seek_to_key(sstables: Vec<Arc<SsTable>>, key: KeySlice) -> Result<Self> {
        // First table whose range can still contain the key.
        let idx = sstables.partition_point(|sst| sst.last_key() < key.key_ref());
        let mut iter = Self {
            current: None,
            next_sst_idx: idx,
            sstables,
        };
        if iter.next_sst_idx < iter.sstables.len() {
            iter.current = Some(SsTableIterator::create_and_seek_to_key(
                iter.sstables[iter.next_sst_idx].clone(),
                key,
            )?);
            iter.next_sst_idx += 1;
        }
        iter.roll_forward()?;
        Ok(iter)
    }

    /// Roll into the next table whenever the current child is
    /// exhausted.
    fn roll_forward(&mut self) -> Result<()> {
        loop {
            if let Some(cur) = self.current.as_ref() {
                if cur.is_valid() {
                    return Ok(());
                }
            }
            if self.next_sst_idx >= self.sstables.len() {
                self.current = None;
                return Ok(());
            }
            self.current = Some(SsTableIterator::create_and_seek_to_first(
                self.sstables[self.next_sst_idx].clone(),
            )?);
            self.next_sst_idx += 1;
        }
    }
}

impl StorageIterator for SstConcatIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.current.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().unwrap().value()
    }

    fn is_valid(&self) -> bool {
        self.current
            .as_ref()
            .map(|iter| iter.is_valid())
            .unwrap_or(false)
    }

    fn next(&mut self) -> Result<()> {
        if let Some(cur) = self.current.as_mut() {
            cur.next()?;
        }
        self.roll_forward()
    }

    fn num_active_iterators(&self) -> usize {
        1
    }
}
