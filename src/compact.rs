use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::engine::LsmEngine;
use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::key::KeySlice;
use crate::table::{SsTable, SsTableIterator};

impl LsmEngine {
    /// Merge every table of `src_level` with every table of the next
    /// level, rewriting them as non-overlapping tables one level
    /// down. An oversized source level first pushes the level below
    /// it deeper, so the rewrite never lands on an already-bloated
    /// target.
    ///
    /// Caller holds `state_lock`; nothing else mutates the table maps
    /// while this runs.
    pub(crate) fn full_compact(&self, src_level: usize) -> Result<()> {
        let src_count = self
            .state
            .read()
            .level_sst_ids
            .get(&src_level)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if src_count > self.options.sst_level_ratio {
            self.full_compact(src_level + 1)?;
        }

        let target_level = src_level + 1;
        let snapshot = self.state.read().clone();
        let src_ids: Vec<usize> = snapshot
            .level_sst_ids
            .get(&src_level)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        if src_ids.is_empty() {
            return Ok(());
        }
        let dst_ids: Vec<usize> = snapshot
            .level_sst_ids
            .get(&target_level)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        // Tombstones can only be reclaimed when nothing deeper could
        // still hold the key.
        let is_bottom = snapshot
            .level_sst_ids
            .range(target_level + 1..)
            .all(|(_, ids)| ids.is_empty());

        debug!(
            src_level,
            target_level,
            src = src_ids.len(),
            dst = dst_ids.len(),
            "compacting"
        );
        let dst_tables: Vec<Arc<SsTable>> = dst_ids
            .iter()
            .map(|id| snapshot.sstables[id].clone())
            .collect();
        let new_ssts = if src_level == 0 {
            // L0 tables overlap, so they go through a heap merge; the
            // deque is newest-first and the merge prefers lower
            // indices, so recency survives the rewrite.
            let mut l0_iters = Vec::with_capacity(src_ids.len());
            for id in &src_ids {
                l0_iters.push(Box::new(SsTableIterator::create_and_seek_to_first(
                    snapshot.sstables[id].clone(),
                )?));
            }
            let iter = TwoMergeIterator::create(
                MergeIterator::create(l0_iters),
                SstConcatIterator::create_and_seek_to_first(dst_tables)?,
            )?;
            self.gen_sst_from_iter(iter, self.get_sst_size(target_level), target_level, is_bottom)?
        } else {
            let src_tables: Vec<Arc<SsTable>> = src_ids
                .iter()
                .map(|id| snapshot.sstables[id].clone())
                .collect();
            let iter = TwoMergeIterator::create(
                SstConcatIterator::create_and_seek_to_first(src_tables)?,
                SstConcatIterator::create_and_seek_to_first(dst_tables)?,
            )?;
            self.gen_sst_from_iter(iter, self.get_sst_size(target_level), target_level, is_bottom)?
        };

        // New tables become visible first; only then do the
        // superseded ones disappear.
        let mut old_tables = Vec::with_capacity(src_ids.len() + dst_ids.len());
        {
            let mut state = self.state.write();
            let mut new_state = state.as_ref().clone();
            for id in src_ids.iter().chain(dst_ids.iter()) {
                if let Some(sst) = new_state.sstables.remove(id) {
                    old_tables.push(sst);
                }
            }
            new_state.level_sst_ids.insert(src_level, VecDeque::new());
            let mut target_ids = VecDeque::with_capacity(new_ssts.len());
            for sst in &new_ssts {
                new_state.sstables.insert(sst.sst_id(), sst.clone());
                target_ids.push_back(sst.sst_id());
            }
            new_state.level_sst_ids.insert(target_level, target_ids);
            *state = Arc::new(new_state);
        }
        for sst in old_tables {
            sst.del_sst()?;
        }
        info!(
            src_level,
            target_level,
            new_tables = new_ssts.len(),
            "compaction finished"
        );
        Ok(())
    }

    /// Drain a merged stream into tables of roughly `target_sst_size`
    /// each. Output tables never split the versions of one user key,
    /// so every level stays non-overlapping.
    ///
    /// At the bottom of the tree, a user key whose newest surviving
    /// version is a tombstone is dropped together with everything it
    /// shadows.
    fn gen_sst_from_iter(
        &self,
        mut iter: impl for<'a> StorageIterator<KeyType<'a> = KeySlice<'a>>,
        target_sst_size: usize,
        target_level: usize,
        is_bottom: bool,
    ) -> Result<Vec<Arc<SsTable>>> {
        let mut new_ssts = Vec::new();
        let mut builder = self.new_builder();
        let mut cur_user_key: Vec<u8> = Vec::new();
        let mut drop_chain = false;

        while iter.is_valid() {
            let first_of_key = iter.key().key_ref() != cur_user_key.as_slice();
            if first_of_key {
                cur_user_key.clear();
                cur_user_key.extend(iter.key().key_ref());
                drop_chain = is_bottom && iter.value().is_empty();

                if !builder.is_empty() && builder.estimated_size() >= target_sst_size {
                    let full = std::mem::replace(&mut builder, self.new_builder());
                    let sst_id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
                    let sst = full.build(
                        sst_id,
                        Some(self.block_cache.clone()),
                        self.path_of_sst(sst_id, target_level),
                    )?;
                    new_ssts.push(Arc::new(sst));
                }
            }
            if drop_chain {
                iter.next()?;
                continue;
            }
            builder.add(iter.key(), iter.value())?;
            iter.next()?;
        }

        if !builder.is_empty() {
            let sst_id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
            let sst = builder.build(
                sst_id,
                Some(self.block_cache.clone()),
                self.path_of_sst(sst_id, target_level),
            )?;
            new_ssts.push(Arc::new(sst));
        }
        Ok(new_ssts)
    }

    /// Target table size doubles as the level capacity unit:
    /// `per_mem_size_limit * ratio^level`.
    pub(crate) fn get_sst_size(&self, level: usize) -> usize {
        self.options
            .per_mem_size_limit
            .saturating_mul(self.options.sst_level_ratio.saturating_pow(level as u32))
    }
}
