use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::StorageIterator;
use crate::key::{KeyBytes, KeySlice};
use crate::skiplist::SkipList;
use crate::table::{BlockCache, SsTable, SsTableBuilder};

pub(crate) fn map_bound(bound: Bound<&[u8]>) -> Bound<Bytes> {
    match bound {
        Bound::Included(x) => Bound::Included(Bytes::copy_from_slice(x)),
        Bound::Excluded(x) => Bound::Excluded(Bytes::copy_from_slice(x)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

struct FrozenTables {
    /// Front is the newest frozen skiplist, back the oldest.
    tables: VecDeque<Arc<SkipList>>,
    bytes: usize,
}

/// The write buffer: one active skiplist plus the frozen generations
/// waiting for flush.
///
/// Two reader-writer locks, one per region. Whenever both are taken
/// the order is fixed — active first, then frozen — so freeze and
/// flush cannot deadlock against each other.
pub struct MemTable {
    current: RwLock<SkipList>,
    frozen: RwLock<FrozenTables>,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(SkipList::default()),
            frozen: RwLock::new(FrozenTables {
                tables: VecDeque::new(),
                bytes: 0,
            }),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8], tranc_id: u64) {
        self.current.write().put(key, value, tranc_id);
    }

    /// One writer-lock acquisition for the whole batch.
    pub fn put_batch(&self, kvs: &[(&[u8], &[u8])], tranc_id: u64) {
        let mut current = self.current.write();
        for (key, value) in kvs {
            current.put(key, value, tranc_id);
        }
    }

    /// Deletion is a tombstone put.
    pub fn remove(&self, key: &[u8], tranc_id: u64) {
        self.current.write().put(key, b"", tranc_id);
    }

    pub fn remove_batch(&self, keys: &[&[u8]], tranc_id: u64) {
        let mut current = self.current.write();
        for key in keys {
            current.put(key, b"", tranc_id);
        }
    }

    /// Visible version of `key`, newest region first. A tombstone is
    /// reported as an empty value so the caller can stop the search.
    pub fn get(&self, key: &[u8], tranc_id: u64) -> Option<(Bytes, u64)> {
        {
            let current = self.current.read();
            let iter = current.get(key, tranc_id);
            if iter.is_valid() {
                return Some((iter.value(), iter.tranc_id()));
            }
        }
        let frozen = self.frozen.read();
        for table in frozen.tables.iter() {
            let iter = table.get(key, tranc_id);
            if iter.is_valid() {
                return Some((iter.value(), iter.tranc_id()));
            }
        }
        None
    }

    /// Batched lookup: the active lock is taken once for all keys,
    /// then the frozen lock once for the leftovers.
    pub fn get_batch(&self, keys: &[&[u8]], tranc_id: u64) -> Vec<Option<(Bytes, u64)>> {
        let mut results: Vec<Option<(Bytes, u64)>> = vec![None; keys.len()];
        {
            let current = self.current.read();
            for (slot, key) in results.iter_mut().zip(keys) {
                let iter = current.get(key, tranc_id);
                if iter.is_valid() {
                    *slot = Some((iter.value(), iter.tranc_id()));
                }
            }
        }
        if results.iter().all(|r| r.is_some()) {
            return results;
        }
        let frozen = self.frozen.read();
        for (slot, key) in results.iter_mut().zip(keys) {
            if slot.is_some() {
                continue;
            }
            for table in frozen.tables.iter() {
                let iter = table.get(key, tranc_id);
                if iter.is_valid() {
                    *slot = Some((iter.value(), iter.tranc_id()));
                    break;
                }
            }
        }
        results
    }

    /// Rotate the active skiplist onto the front of the frozen deque
    /// and install a fresh one.
    pub fn frozen_cur_table(&self) {
        let mut current = self.current.write();
        let mut frozen = self.frozen.write();
        if current.is_empty() {
            return;
        }
        let old = std::mem::take(&mut *current);
        frozen.bytes += old.get_size();
        frozen.tables.push_front(Arc::new(old));
    }

    /// Drain the oldest frozen skiplist into `builder` and build the
    /// table. When nothing is frozen yet, the active skiplist is
    /// promoted first; `None` means there was nothing to flush at
    /// all.
    pub fn flush_last(
        &self,
        mut builder: SsTableBuilder,
        path: impl AsRef<Path>,
        sst_id: usize,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Option<SsTable>> {
        let mut frozen = {
            let mut current = self.current.write();
            let mut frozen = self.frozen.write();
            if frozen.tables.is_empty() {
                if current.is_empty() {
                    return Ok(None);
                }
                let old = std::mem::take(&mut *current);
                frozen.bytes += old.get_size();
                frozen.tables.push_front(Arc::new(old));
            }
            frozen
        };

        // The frozen lock stays held until the table is built, so no
        // reader can miss entries that are neither in memory nor on
        // disk yet.
        let table = frozen.tables.pop_back().unwrap();
        frozen.bytes -= table.get_size();
        let entries = table.flush();
        debug!(sst_id, entries = entries.len(), "flushing skiplist");
        for (key, value, tranc_id) in entries {
            builder.add(KeySlice::from_slice(&key, tranc_id), &value)?;
        }
        let sst = builder.build(sst_id, block_cache, path)?;
        Ok(Some(sst))
    }

    pub fn get_cur_size(&self) -> usize {
        self.current.read().get_size()
    }

    pub fn get_frozen_size(&self) -> usize {
        self.frozen.read().bytes
    }

    pub fn get_total_size(&self) -> usize {
        self.get_cur_size() + self.get_frozen_size()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty() && self.frozen.read().tables.is_empty()
    }

    pub fn frozen_table_count(&self) -> usize {
        self.frozen.read().tables.len()
    }

    pub fn clear(&self) {
        let mut current = self.current.write();
        let mut frozen = self.frozen.write();
        current.clear();
        frozen.tables.clear();
        frozen.bytes = 0;
    }

    /// Merge of per-table runs inside the bounds; table index is the
    /// recency tie-breaker (0 = active, 1 = newest frozen, ...), so
    /// newer data shadows older on equal composite keys.
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> MergeIterator<MemTableIterator> {
        let mut runs = Vec::new();
        {
            let current = self.current.read();
            runs.push(Box::new(MemTableIterator::new(
                current.range_entries(lower, upper),
            )));
        }
        {
            let frozen = self.frozen.read();
            for table in frozen.tables.iter() {
                runs.push(Box::new(MemTableIterator::new(
                    table.range_entries(lower, upper),
                )));
            }
        }
        MergeIterator::create(runs)
    }

    /// First and last user key across all regions matching a monotone
    /// predicate.
    pub fn predicate_key_range(&self, predicate: &dyn Fn(&[u8]) -> i32) -> Option<(Bytes, Bytes)> {
        let mut range: Option<(Bytes, Bytes)> = None;
        let mut merge = |found: Option<(Bytes, Bytes)>| {
            if let Some((lo, hi)) = found {
                range = match range.take() {
                    None => Some((lo, hi)),
                    Some((cur_lo, cur_hi)) => {
                        Some((cur_lo.min(lo), cur_hi.max(hi)))
                    }
                };
            }
        };
        {
            let current = self.current.read();
            merge(current.predicate_key_range(predicate));
        }
        {
            let frozen = self.frozen.read();
            for table in frozen.tables.iter() {
                merge(table.predicate_key_range(predicate));
            }
        }
        range
    }
}

/// A materialized run from one skiplist. Snapshotting under the
/// region lock keeps the merge machinery free of lock lifetimes.
pub struct MemTableIterator {
    items: Vec<(KeyBytes, Bytes)>,
    idx: usize,
}

impl MemTableIterator {
    pub(crate) fn new(items: Vec<(KeyBytes, Bytes)>) -> Self {
        Self { items, idx: 0 }
    }

    #[cfg(test)]
    pub(crate) fn for_test(entries: Vec<(&[u8], u64, &[u8])>) -> Self {
        Self::new(
            entries
                .into_iter()
                .map(|(k, t, v)| {
                    (
                        KeyBytes::from_bytes(Bytes::copy_from_slice(k), t),
                        Bytes::copy_from_slice(v),
                    )
                })
                .collect(),
        )
    }
}

impl StorageIterator for MemTableIterator {
    type KeyType<'a> = KeySlice<'a>;

    fn key(&self) -> KeySlice {
        self.items[self.idx].0.as_key_slice()
    }

    fn value(&self) -> &[u8] {
        &self.items[self.idx].1
    }

    fn is_valid(&self) -> bool {
        self.idx < self.items.len()
    }

    fn next(&mut self) -> Result<()> {
        self.idx += 1;
        Ok(())
    }
}
