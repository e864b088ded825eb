use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use farmhash::fingerprint32;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::key::{KeySlice, TRANC_ID_RANGE_BEGIN};
use crate::lsm_iterator::{FusedIterator, LsmIterator};
use crate::mem_table::{map_bound, MemTable};
use crate::options::LsmOptions;
use crate::table::{BlockCache, FileObject, SsTable, SsTableBuilder, SsTableIterator};

/// The table layout of the engine, replaced wholesale on every
/// structural change. Readers clone the `Arc` and work on an
/// immutable snapshot, so no lock is held across file I/O.
#[derive(Clone, Default)]
pub struct LsmState {
    /// Table ids per level. Level 0 is newest-first and may overlap;
    /// deeper levels are ascending in both id and key order.
    pub level_sst_ids: BTreeMap<usize, VecDeque<usize>>,
    pub sstables: HashMap<usize, Arc<SsTable>>,
}

/// The storage engine: a memtable in front of leveled on-disk tables.
///
/// Flush and compaction serialize on `state_lock`; everything a
/// reader needs is either in the memtable (which has its own locks)
/// or reachable from one state snapshot.
pub struct LsmEngine {
    pub(crate) memtable: MemTable,
    pub(crate) state: RwLock<Arc<LsmState>>,
    pub(crate) state_lock: Mutex<()>,
    path: PathBuf,
    pub(crate) block_cache: Arc<BlockCache>,
    pub(crate) next_sst_id: AtomicUsize,
    max_flushed_tranc_id: AtomicU64,
    pub(crate) options: Arc<LsmOptions>,
}

impl LsmEngine {
    /// Open a data directory, recovering every `sst_<id>.<level>`
    /// file in it. The level suffix in the file name is authoritative.
    pub fn open(path: impl AsRef<Path>, options: LsmOptions) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            std::fs::create_dir_all(path)
                .with_context(|| format!("failed to create data dir {:?}", path))?;
        }
        let block_cache = Arc::new(BlockCache::new(options.block_cache_capacity));

        let mut state = LsmState::default();
        let mut max_sst_id = 0;
        let mut recovered = 0usize;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some((id, level)) = parse_sst_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let file = FileObject::open(&entry.path())?;
            let sst = SsTable::open(id, Some(block_cache.clone()), file)?;
            state.sstables.insert(id, Arc::new(sst));
            state.level_sst_ids.entry(level).or_default().push_back(id);
            max_sst_id = max_sst_id.max(id);
            recovered += 1;
        }
        for (level, ids) in state.level_sst_ids.iter_mut() {
            let mut sorted: Vec<usize> = ids.iter().copied().collect();
            sorted.sort_unstable();
            if *level == 0 {
                // Newest first, so point lookups honor recency.
                sorted.reverse();
            }
            *ids = sorted.into();
        }
        if recovered > 0 {
            info!(recovered, "recovered tables from {:?}", path);
        }

        Ok(Self {
            memtable: MemTable::new(),
            state: RwLock::new(Arc::new(state)),
            state_lock: Mutex::new(()),
            path: path.to_path_buf(),
            block_cache,
            next_sst_id: AtomicUsize::new(max_sst_id + 1),
            max_flushed_tranc_id: AtomicU64::new(0),
            options: Arc::new(options),
        })
    }

    pub(crate) fn snapshot(&self) -> Arc<LsmState> {
        self.state.read().clone()
    }

    pub(crate) fn path_of_sst(&self, sst_id: usize, level: usize) -> PathBuf {
        self.path.join(format!("sst_{:032}.{}", sst_id, level))
    }

    pub(crate) fn new_builder(&self) -> SsTableBuilder {
        SsTableBuilder::new(self.options.block_size).with_bloom_options(
            self.options.bloom_expected_size,
            self.options.bloom_expected_error_rate,
        )
    }

    /// Insert one version. Returns the id of the table a triggered
    /// flush produced, 0 otherwise.
    pub fn put(&self, key: &[u8], value: &[u8], tranc_id: u64) -> Result<usize> {
        assert!(!key.is_empty(), "key cannot be empty");
        self.memtable.put(key, value, tranc_id);
        self.maybe_freeze_and_flush()
    }

    /// Deletion is a tombstone put.
    pub fn remove(&self, key: &[u8], tranc_id: u64) -> Result<usize> {
        assert!(!key.is_empty(), "key cannot be empty");
        self.memtable.remove(key, tranc_id);
        self.maybe_freeze_and_flush()
    }

    pub fn put_batch(&self, kvs: &[(&[u8], &[u8])], tranc_id: u64) -> Result<usize> {
        for (key, _) in kvs {
            assert!(!key.is_empty(), "key cannot be empty");
        }
        self.memtable.put_batch(kvs, tranc_id);
        self.maybe_freeze_and_flush()
    }

    pub fn remove_batch(&self, keys: &[&[u8]], tranc_id: u64) -> Result<usize> {
        self.memtable.remove_batch(keys, tranc_id);
        self.maybe_freeze_and_flush()
    }

    fn maybe_freeze_and_flush(&self) -> Result<usize> {
        if self.memtable.get_cur_size() >= self.options.per_mem_size_limit {
            self.memtable.frozen_cur_table();
        }
        if self.memtable.get_total_size() >= self.options.tol_mem_size_limit {
            return self.flush();
        }
        Ok(0)
    }

    /// Visible value of `key` for a reader at `tranc_id` (0 means
    /// newest). The search order is recency: memtable, then L0
    /// newest-first, then one candidate table per deeper level.
    pub fn get(&self, key: &[u8], tranc_id: u64) -> Result<Option<(Bytes, u64)>> {
        if let Some((value, id)) = self.memtable.get(key, tranc_id) {
            if value.is_empty() {
                return Ok(None);
            }
            return Ok(Some((value, id)));
        }
        let snapshot = self.snapshot();
        self.sst_get(&snapshot, key, tranc_id)
    }

    fn sst_get(
        &self,
        snapshot: &LsmState,
        key: &[u8],
        tranc_id: u64,
    ) -> Result<Option<(Bytes, u64)>> {
        if let Some(l0_ids) = snapshot.level_sst_ids.get(&0) {
            for id in l0_ids {
                let sst = &snapshot.sstables[id];
                if !keep_table(key, sst) {
                    continue;
                }
                let iter = sst.get(key, tranc_id)?;
                if iter.is_valid() && iter.key().key_ref() == key {
                    if iter.value().is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some((
                        Bytes::copy_from_slice(iter.value()),
                        iter.key().tranc_id(),
                    )));
                }
            }
        }

        for (_level, ids) in snapshot.level_sst_ids.range(1..) {
            let ids: Vec<usize> = ids.iter().copied().collect();
            // Non-overlapping ranges: at most one table can hold the
            // key.
            let idx = ids.partition_point(|id| snapshot.sstables[id].last_key() < key);
            if idx >= ids.len() {
                continue;
            }
            let sst = &snapshot.sstables[&ids[idx]];
            if !keep_table(key, sst) {
                continue;
            }
            let iter = sst.get(key, tranc_id)?;
            if iter.is_valid() && iter.key().key_ref() == key {
                if iter.value().is_empty() {
                    return Ok(None);
                }
                return Ok(Some((
                    Bytes::copy_from_slice(iter.value()),
                    iter.key().tranc_id(),
                )));
            }
        }
        Ok(None)
    }

    /// Batched lookup: the memtable resolves what it can while
    /// holding each region lock once; leftovers walk the table path
    /// per key.
    pub fn get_batch(&self, keys: &[&[u8]], tranc_id: u64) -> Result<Vec<Option<(Bytes, u64)>>> {
        let mut results = self.memtable.get_batch(keys, tranc_id);
        let snapshot = self.snapshot();
        for (slot, key) in results.iter_mut().zip(keys) {
            match slot.take() {
                // A memtable tombstone settles the key as absent.
                Some((value, id)) => {
                    if !value.is_empty() {
                        *slot = Some((value, id));
                    }
                }
                None => *slot = self.sst_get(&snapshot, key, tranc_id)?,
            }
        }
        Ok(results)
    }

    /// Drain the oldest memtable generation into a new L0 table.
    /// When L0 already holds `sst_level_ratio` tables, compaction
    /// runs first. Returns the new table id, or 0 when there was
    /// nothing to flush.
    pub fn flush(&self) -> Result<usize> {
        let _guard = self.state_lock.lock();

        let l0_count = self
            .state
            .read()
            .level_sst_ids
            .get(&0)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if l0_count >= self.options.sst_level_ratio {
            self.full_compact(0)?;
        }

        let sst_id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let path = self.path_of_sst(sst_id, 0);
        let Some(sst) = self.memtable.flush_last(
            self.new_builder(),
            &path,
            sst_id,
            Some(self.block_cache.clone()),
        )?
        else {
            return Ok(0);
        };

        let max_tranc_id = sst.max_tranc_id();
        {
            let mut state = self.state.write();
            let mut snapshot = state.as_ref().clone();
            snapshot.sstables.insert(sst_id, Arc::new(sst));
            snapshot
                .level_sst_ids
                .entry(0)
                .or_default()
                .push_front(sst_id);
            *state = Arc::new(snapshot);
        }
        self.max_flushed_tranc_id
            .fetch_max(max_tranc_id, Ordering::SeqCst);
        debug!(sst_id, "flushed memtable to level 0");
        self.sync_dir()?;
        Ok(sst_id)
    }

    /// Flush until the memtable is drained.
    pub fn flush_all(&self) -> Result<()> {
        while self.memtable.get_total_size() > 0 {
            self.flush()?;
        }
        Ok(())
    }

    /// Greatest tranc id that has reached disk.
    pub fn max_flushed_tranc_id(&self) -> u64 {
        self.max_flushed_tranc_id.load(Ordering::SeqCst)
    }

    /// Compact L0 into L1 (and recursively deeper), regardless of
    /// the trigger thresholds.
    pub fn force_full_compact(&self) -> Result<()> {
        let _guard = self.state_lock.lock();
        self.full_compact(0)
    }

    /// Ordered scan of the live visible entries inside the bounds.
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        max_tranc_id: u64,
    ) -> Result<FusedIterator<LsmIterator>> {
        let mem_iter = self.memtable.scan(lower, upper);
        let snapshot = self.snapshot();

        let mut l0_iters = Vec::new();
        if let Some(l0_ids) = snapshot.level_sst_ids.get(&0) {
            for id in l0_ids {
                let sst = snapshot.sstables[id].clone();
                if !range_overlap(lower, upper, sst.first_key(), sst.last_key()) {
                    continue;
                }
                let iter = match lower {
                    Bound::Included(key) => SsTableIterator::create_and_seek_to_key(
                        sst,
                        KeySlice::from_slice(key, TRANC_ID_RANGE_BEGIN),
                    )?,
                    Bound::Excluded(key) => {
                        let mut iter = SsTableIterator::create_and_seek_to_key(
                            sst,
                            KeySlice::from_slice(key, TRANC_ID_RANGE_BEGIN),
                        )?;
                        while iter.is_valid() && iter.key().key_ref() == key {
                            iter.next()?;
                        }
                        iter
                    }
                    Bound::Unbounded => SsTableIterator::create_and_seek_to_first(sst)?,
                };
                l0_iters.push(Box::new(iter));
            }
        }
        let l0_merge = MergeIterator::create(l0_iters);

        let mut level_iters = Vec::new();
        for (_level, ids) in snapshot.level_sst_ids.range(1..) {
            let mut tables = Vec::with_capacity(ids.len());
            for id in ids {
                let sst = snapshot.sstables[id].clone();
                if range_overlap(lower, upper, sst.first_key(), sst.last_key()) {
                    tables.push(sst);
                }
            }
            let iter = match lower {
                Bound::Included(key) => SstConcatIterator::create_and_seek_to_key(
                    tables,
                    KeySlice::from_slice(key, TRANC_ID_RANGE_BEGIN),
                )?,
                Bound::Excluded(key) => {
                    let mut iter = SstConcatIterator::create_and_seek_to_key(
                        tables,
                        KeySlice::from_slice(key, TRANC_ID_RANGE_BEGIN),
                    )?;
                    while iter.is_valid() && iter.key().key_ref() == key {
                        iter.next()?;
                    }
                    iter
                }
                Bound::Unbounded => SstConcatIterator::create_and_seek_to_first(tables)?,
            };
            level_iters.push(Box::new(iter));
        }

        let inner = TwoMergeIterator::create(
            TwoMergeIterator::create(mem_iter, l0_merge)?,
            MergeIterator::create(level_iters),
        )?;
        Ok(FusedIterator::new(LsmIterator::new(
            inner,
            map_bound(upper),
            max_tranc_id,
        )?))
    }

    /// Scan the contiguous region where a monotone predicate is 0.
    /// Each structure binary searches for its own matching sub-range;
    /// the union of those ranges bounds the composed scan.
    pub fn iters_monotony_predicate(
        &self,
        max_tranc_id: u64,
        predicate: &dyn Fn(&[u8]) -> i32,
    ) -> Result<Option<FusedIterator<LsmIterator>>> {
        let mut range = self.memtable.predicate_key_range(predicate);
        let snapshot = self.snapshot();
        for sst in snapshot.sstables.values() {
            if let Some((lo, hi)) = sst.predicate_key_range(predicate)? {
                range = match range.take() {
                    None => Some((lo, hi)),
                    Some((cur_lo, cur_hi)) => Some((cur_lo.min(lo), cur_hi.max(hi))),
                };
            }
        }
        let Some((lo, hi)) = range else {
            return Ok(None);
        };
        let iter = self.scan(
            Bound::Included(lo.as_ref()),
            Bound::Included(hi.as_ref()),
            max_tranc_id,
        )?;
        Ok(Some(iter))
    }

    /// Prefix scan, phrased as a monotone predicate.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        max_tranc_id: u64,
    ) -> Result<Option<FusedIterator<LsmIterator>>> {
        let prefix = prefix.to_vec();
        let predicate = move |key: &[u8]| -> i32 {
            if key.starts_with(&prefix) {
                0
            } else if key < prefix.as_slice() {
                1
            } else {
                -1
            }
        };
        self.iters_monotony_predicate(max_tranc_id, &predicate)
    }

    /// Drop everything: memtable, descriptors, and files.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.state_lock.lock();
        self.memtable.clear();
        let old = {
            let mut state = self.state.write();
            let old = state.clone();
            *state = Arc::new(LsmState::default());
            old
        };
        for sst in old.sstables.values() {
            sst.del_sst()?;
        }
        Ok(())
    }

    pub(crate) fn sync_dir(&self) -> Result<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }
}

/// `sst_<32-digit id>.<level>`
fn parse_sst_file_name(name: &str) -> Option<(usize, usize)> {
    let rest = name.strip_prefix("sst_")?;
    let (id_part, level_part) = rest.split_once('.')?;
    let id = id_part.parse::<usize>().ok()?;
    let level = level_part.parse::<usize>().ok()?;
    Some((id, level))
}

/// Range check plus bloom consult; either one can rule the table out.
fn keep_table(key: &[u8], sst: &SsTable) -> bool {
    if sst.first_key() <= key && key <= sst.last_key() {
        if let Some(bloom) = sst.bloom.as_ref() {
            return bloom.may_contain(fingerprint32(key));
        }
        return true;
    }
    false
}

fn range_overlap(
    user_lower: Bound<&[u8]>,
    user_upper: Bound<&[u8]>,
    table_first: &[u8],
    table_last: &[u8],
) -> bool {
    match user_lower {
        Bound::Included(key) if key > table_last => return false,
        Bound::Excluded(key) if key >= table_last => return false,
        _ => {}
    }
    match user_upper {
        Bound::Included(key) if key < table_first => return false,
        Bound::Excluded(key) if key <= table_first => return false,
        _ => {}
    }
    true
}
