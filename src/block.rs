mod builder;
mod iterator;

use anyhow::Result;
use bytes::{Buf, BufMut};

pub use builder::BlockBuilder;
pub use iterator::BlockIterator;

use crate::error::StorageError;
use crate::key::KeySlice;

pub(crate) const LEN_VAR_SIZE: usize = 2;
pub(crate) const TRANC_ID_SIZE: usize = 8;

/// A block is the smallest unit of SST read I/O: a sorted run of
/// entries followed by their offsets and an entry count.
///
/// ```text
/// | entry_1 | ... | entry_N | offset_1 (u16) ... offset_N (u16) | N (u16) |
/// entry := key_len (u16 LE) | key | val_len (u16 LE) | val | tranc_id (u64 LE)
/// ```
///
/// Entries are ordered by (key ascending, tranc_id descending), so the
/// newest version of a key is the leftmost among its duplicates.
pub struct Block {
    pub(crate) data: Vec<u8>,
    pub(crate) offsets: Vec<u16>,
}

impl Block {
    /// Emit the on-disk layout: data region, offsets array, count.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.data.clone();
        for offset in self.offsets.iter() {
            buf.put_u16_le(*offset);
        }
        buf.put_u16_le(self.offsets.len() as u16);
        buf
    }

    /// Decode a block, rebuilding the offsets by walking the declared
    /// entry lengths. The walk doubles as a layout check: any length
    /// that runs past the data region is corruption.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < LEN_VAR_SIZE {
            return Err(StorageError::CorruptBlock(
                "shorter than the entry count suffix".to_string(),
            )
            .into());
        }
        let num_entries = (&raw[raw.len() - LEN_VAR_SIZE..]).get_u16_le() as usize;
        let tail = LEN_VAR_SIZE + num_entries * LEN_VAR_SIZE;
        if raw.len() < tail {
            return Err(StorageError::CorruptBlock(format!(
                "{} entries do not fit in {} bytes",
                num_entries,
                raw.len()
            ))
            .into());
        }
        let data_end = raw.len() - tail;
        let data = raw[..data_end].to_vec();

        let mut offsets = Vec::with_capacity(num_entries);
        let mut cur = 0usize;
        for _ in 0..num_entries {
            offsets.push(cur as u16);
            if cur + LEN_VAR_SIZE > data_end {
                return Err(StorageError::CorruptBlock("truncated key length".to_string()).into());
            }
            let key_len = (&data[cur..cur + LEN_VAR_SIZE]).get_u16_le() as usize;
            cur += LEN_VAR_SIZE + key_len;
            if cur + LEN_VAR_SIZE > data_end {
                return Err(
                    StorageError::CorruptBlock("key overruns data region".to_string()).into(),
                );
            }
            let val_len = (&data[cur..cur + LEN_VAR_SIZE]).get_u16_le() as usize;
            cur += LEN_VAR_SIZE + val_len + TRANC_ID_SIZE;
            if cur > data_end {
                return Err(
                    StorageError::CorruptBlock("value overruns data region".to_string()).into(),
                );
            }
        }
        if cur != data_end {
            return Err(StorageError::CorruptBlock(format!(
                "{} trailing bytes after the last entry",
                data_end - cur
            ))
            .into());
        }

        Ok(Self { data, offsets })
    }

    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Byte size of the encoded block.
    pub fn cur_size(&self) -> usize {
        self.data.len() + self.offsets.len() * LEN_VAR_SIZE + LEN_VAR_SIZE
    }

    pub(crate) fn key_at(&self, idx: usize) -> &[u8] {
        let offset = self.offsets[idx] as usize;
        let key_len = (&self.data[offset..offset + LEN_VAR_SIZE]).get_u16_le() as usize;
        &self.data[offset + LEN_VAR_SIZE..offset + LEN_VAR_SIZE + key_len]
    }

    /// Byte range of the value of entry `idx` inside `data`.
    pub(crate) fn value_range_at(&self, idx: usize) -> (usize, usize) {
        let offset = self.offsets[idx] as usize;
        let key_len = (&self.data[offset..offset + LEN_VAR_SIZE]).get_u16_le() as usize;
        let val_len_pos = offset + LEN_VAR_SIZE + key_len;
        let val_len = (&self.data[val_len_pos..val_len_pos + LEN_VAR_SIZE]).get_u16_le() as usize;
        let start = val_len_pos + LEN_VAR_SIZE;
        (start, start + val_len)
    }

    pub(crate) fn tranc_id_at(&self, idx: usize) -> u64 {
        let (_, val_end) = self.value_range_at(idx);
        (&self.data[val_end..val_end + TRANC_ID_SIZE]).get_u64_le()
    }

    pub(crate) fn entry_key_at(&self, idx: usize) -> KeySlice {
        KeySlice::from_slice(self.key_at(idx), self.tranc_id_at(idx))
    }

    pub fn first_key(&self) -> Option<KeySlice> {
        if self.is_empty() {
            None
        } else {
            Some(self.entry_key_at(0))
        }
    }

    /// Index of the first entry whose composite key is >= `target`.
    pub(crate) fn partition_point_composite(&self, target: KeySlice) -> usize {
        let mut lo = 0;
        let mut hi = self.num_entries();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry_key_at(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Binary search for a version of `key` visible at `tranc_id`.
    ///
    /// `tranc_id == 0` selects the newest version. Otherwise the match
    /// is the entry whose stored id equals `tranc_id`, or failing
    /// that, the greatest stored id strictly below it. Both cases fall
    /// out of one composite seek because versions sort descending.
    pub fn get_idx_binary(&self, key: &[u8], tranc_id: u64) -> Option<usize> {
        let seek_id = if tranc_id == 0 {
            crate::key::TRANC_ID_RANGE_BEGIN
        } else {
            tranc_id
        };
        let idx = self.partition_point_composite(KeySlice::from_slice(key, seek_id));
        if idx < self.num_entries() && self.key_at(idx) == key {
            Some(idx)
        } else {
            None
        }
    }

    /// Half-open index range of entries whose key satisfies a
    /// monotone predicate (`+1`: key left of the range, `0`: inside,
    /// `-1`: right of it). Two binary searches: the leftmost index
    /// with `pred <= 0` and the leftmost with `pred < 0`.
    pub fn get_monotony_predicate_range(
        &self,
        predicate: impl Fn(&[u8]) -> i32,
    ) -> Option<(usize, usize)> {
        let n = self.num_entries();

        let mut lo = 0;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if predicate(self.key_at(mid)) > 0 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let left = lo;

        let mut lo = left;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if predicate(self.key_at(mid)) >= 0 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let right = lo;

        if left < right {
            Some((left, right))
        } else {
            None
        }
    }
}
