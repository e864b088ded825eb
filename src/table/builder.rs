use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::{BufMut, Bytes};

use super::bloom::Bloom;
use super::{BlockCache, BlockMeta, FileObject, SsTable};
use crate::block::BlockBuilder;
use crate::error::StorageError;
use crate::key::KeySlice;

const DEFAULT_BLOOM_EXPECTED_SIZE: usize = 1 << 10;
const DEFAULT_BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Builds an SST from composite-ordered entries.
pub struct SsTableBuilder {
    builder: BlockBuilder,
    data: Vec<u8>,
    pub(crate) meta: Vec<BlockMeta>,
    block_size: usize,
    key_hashes: Vec<u32>,
    bloom_expected_size: usize,
    bloom_false_positive_rate: f64,
    min_tranc_id: u64,
    max_tranc_id: u64,
}

impl SsTableBuilder {
    pub fn new(block_size: usize) -> Self {
        Self {
            builder: BlockBuilder::new(block_size),
            data: Vec::new(),
            meta: Vec::new(),
            block_size,
            key_hashes: Vec::new(),
            bloom_expected_size: DEFAULT_BLOOM_EXPECTED_SIZE,
            bloom_false_positive_rate: DEFAULT_BLOOM_FALSE_POSITIVE_RATE,
            min_tranc_id: u64::MAX,
            max_tranc_id: 0,
        }
    }

    pub fn with_bloom_options(mut self, expected_size: usize, false_positive_rate: f64) -> Self {
        self.bloom_expected_size = expected_size;
        self.bloom_false_positive_rate = false_positive_rate;
        self
    }

    /// Append one entry, sealing the in-progress block when it runs
    /// out of budget. An entry too large for an empty block cannot be
    /// stored at all.
    pub fn add(&mut self, key: KeySlice, value: &[u8]) -> Result<()> {
        if key.key_len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(StorageError::InvariantViolation(
                "key or value exceeds the u16 length prefix".to_string(),
            )
            .into());
        }
        if !self.builder.add(key, value, false) {
            self.finish_block();
            if !self.builder.add(key, value, false) {
                return Err(StorageError::InvariantViolation(format!(
                    "entry of {} bytes cannot fit an empty {}-byte block",
                    key.key_len() + value.len(),
                    self.block_size,
                ))
                .into());
            }
        }
        self.key_hashes.push(farmhash::fingerprint32(key.key_ref()));
        self.min_tranc_id = self.min_tranc_id.min(key.tranc_id());
        self.max_tranc_id = self.max_tranc_id.max(key.tranc_id());
        Ok(())
    }

    /// Seal the current block into the data buffer and record its
    /// meta entry.
    fn finish_block(&mut self) {
        if self.builder.is_empty() {
            return;
        }
        let sealed = std::mem::replace(&mut self.builder, BlockBuilder::new(self.block_size));
        let first_key = Bytes::copy_from_slice(sealed.first_key().key_ref());
        let last_key = Bytes::copy_from_slice(sealed.last_key().key_ref());
        let offset = self.data.len();
        self.data.extend(sealed.build().encode());
        self.meta.push(BlockMeta {
            offset,
            first_key,
            last_key,
        });
    }

    /// Data bytes accumulated so far. Meta is small next to the
    /// blocks, so this is the split signal for compaction output.
    pub fn estimated_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.builder.is_empty()
    }

    /// Seal the last block, append the meta section and its offset,
    /// write the file, and hand back the descriptor.
    pub fn build(
        mut self,
        id: usize,
        block_cache: Option<Arc<BlockCache>>,
        path: impl AsRef<Path>,
    ) -> Result<SsTable> {
        self.finish_block();
        if self.meta.is_empty() {
            return Err(
                StorageError::InvariantViolation("cannot build an empty table".to_string()).into(),
            );
        }

        let mut data = self.data;
        let meta_offset = data.len() as u32;
        BlockMeta::encode_block_meta(&self.meta, &mut data);
        data.put_u32_le(meta_offset);

        let bits_per_key = Bloom::bloom_bits_per_key(
            self.key_hashes.len().max(self.bloom_expected_size),
            self.bloom_false_positive_rate,
        );
        let bloom = Bloom::build_from_key_hashes(&self.key_hashes, bits_per_key);

        let file = FileObject::create(path.as_ref(), data)?;
        Ok(SsTable::from_builder_parts(
            file,
            self.meta,
            meta_offset as usize,
            id,
            block_cache,
            Some(bloom),
            self.min_tranc_id,
            self.max_tranc_id,
        ))
    }
}
