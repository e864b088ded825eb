use std::ops::Bound;

use anyhow::{bail, Result};
use bytes::Bytes;

use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::two_merge_iterator::TwoMergeIterator;
use crate::iterators::StorageIterator;
use crate::mem_table::MemTableIterator;
use crate::table::SsTableIterator;

/// The composed scan stack: memtable runs over L0 tables over the
/// concatenated deeper levels. Each two-way merge prefers its newer
/// side on ties.
pub type LsmIteratorInner = TwoMergeIterator<
    TwoMergeIterator<MergeIterator<MemTableIterator>, MergeIterator<SsTableIterator>>,
    MergeIterator<SstConcatIterator>,
>;

/// User-facing scan cursor. The inner stream carries every version of
/// every key; this layer applies visibility (`max_tranc_id`, 0 means
/// unrestricted), folds the versions of a user key down to the
/// visible one, hides tombstones, and stops at the end bound.
pub struct LsmIterator {
    inner: LsmIteratorInner,
    end_bound: Bound<Bytes>,
    is_valid: bool,
    max_tranc_id: u64,
    prev_key: Vec<u8>,
}

impl LsmIterator {
    pub(crate) fn new(
        iter: LsmIteratorInner,
        end_bound: Bound<Bytes>,
        max_tranc_id: u64,
    ) -> Result<Self> {
        let mut iter = Self {
            is_valid: iter.is_valid(),
            inner: iter,
            end_bound,
            max_tranc_id,
            prev_key: Vec::new(),
        };
        iter.check_end_bound();
        iter.move_to_visible()?;
        Ok(iter)
    }

    fn check_end_bound(&mut self) {
        if !self.is_valid {
            return;
        }
        match self.end_bound.as_ref() {
            Bound::Unbounded => {}
            Bound::Included(key) => self.is_valid = self.inner.key().key_ref() <= key.as_ref(),
            Bound::Excluded(key) => self.is_valid = self.inner.key().key_ref() < key.as_ref(),
        }
    }

    fn next_inner(&mut self) -> Result<()> {
        self.inner.next()?;
        if !self.inner.is_valid() {
            self.is_valid = false;
            return Ok(());
        }
        self.check_end_bound();
        Ok(())
    }

    /// Advance until the cursor sits on the visible, live version of
    /// a user key not yet yielded.
    fn move_to_visible(&mut self) -> Result<()> {
        loop {
            // Leftover versions of the key we already yielded or
            // skipped.
            while self.is_valid && self.inner.key().key_ref() == self.prev_key.as_slice() {
                self.next_inner()?;
            }
            if !self.is_valid {
                break;
            }

            self.prev_key.clear();
            self.prev_key.extend(self.inner.key().key_ref());

            // Versions newer than the reader are invisible.
            while self.is_valid
                && self.inner.key().key_ref() == self.prev_key.as_slice()
                && self.max_tranc_id != 0
                && self.inner.key().tranc_id() > self.max_tranc_id
            {
                self.next_inner()?;
            }
            if !self.is_valid {
                break;
            }
            if self.inner.key().key_ref() != self.prev_key.as_slice() {
                // Every version of the key was invisible.
                continue;
            }
            // A tombstone hides the key; move on to the next one.
            if !self.inner.value().is_empty() {
                break;
            }
        }
        Ok(())
    }
}

impl StorageIterator for LsmIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.is_valid
    }

    fn key(&self) -> &[u8] {
        self.inner.key().raw_ref()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn next(&mut self) -> Result<()> {
        self.next_inner()?;
        self.move_to_visible()?;
        Ok(())
    }

    fn num_active_iterators(&self) -> usize {
        self.inner.num_active_iterators()
    }
}

/// Guards a finished or failed iterator against further use: `next`
/// after an error keeps failing, and advancing an exhausted iterator
/// is a no-op.
pub struct FusedIterator<I: StorageIterator> {
    iter: I,
    has_errored: bool,
}

impl<I: StorageIterator> FusedIterator<I> {
    pub fn new(iter: I) -> Self {
        Self {
            iter,
            has_errored: false,
        }
    }
}

impl<I: StorageIterator> StorageIterator for FusedIterator<I> {
    type KeyType<'a> = I::KeyType<'a> where Self: 'a;

    fn is_valid(&self) -> bool {
        !self.has_errored && self.iter.is_valid()
    }

    fn key(&self) -> Self::KeyType<'_> {
        assert!(self.is_valid(), "use of an invalid iterator");
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.is_valid(), "use of an invalid iterator");
        self.iter.value()
    }

    fn next(&mut self) -> Result<()> {
        if self.has_errored {
            bail!("the iterator already failed");
        }
        if self.iter.is_valid() {
            if let Err(e) = self.iter.next() {
                self.has_errored = true;
                return Err(e);
            }
        }
        Ok(())
    }

    fn num_active_iterators(&self) -> usize {
        self.iter.num_active_iterators()
    }
}
