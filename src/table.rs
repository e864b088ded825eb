pub(crate) mod bloom;
mod builder;
mod iterator;

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, Bytes};

pub use bloom::Bloom;
pub use builder::SsTableBuilder;
pub use iterator::SsTableIterator;

use crate::block::Block;
use crate::error::StorageError;

/// Shared cache of decoded blocks, keyed by `(sst_id, block_idx)`.
pub type BlockCache = moka::sync::Cache<(usize, usize), Arc<Block>>;

const U32_SIZE: usize = 4;

/// Per-block descriptor: where the block starts and which user keys
/// bound it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub offset: usize,
    pub first_key: Bytes,
    pub last_key: Bytes,
}

impl BlockMeta {
    /// Append the meta section: `N (u32 LE) | entries | hash (u32 LE)`.
    /// The hash is crc32 over the entry bytes only, so it survives a
    /// round trip through any process.
    pub fn encode_block_meta(metas: &[BlockMeta], buf: &mut Vec<u8>) {
        buf.put_u32_le(metas.len() as u32);
        let entries_start = buf.len();
        for meta in metas {
            buf.put_u32_le(meta.offset as u32);
            buf.put_u16_le(meta.first_key.len() as u16);
            buf.put(meta.first_key.as_ref());
            buf.put_u16_le(meta.last_key.len() as u16);
            buf.put(meta.last_key.as_ref());
        }
        let hash = crc32fast::hash(&buf[entries_start..]);
        buf.put_u32_le(hash);
    }

    pub fn decode_block_meta(raw: &[u8]) -> Result<Vec<BlockMeta>> {
        if raw.len() < 2 * U32_SIZE {
            return Err(
                StorageError::CorruptMeta("shorter than count and hash".to_string()).into(),
            );
        }
        let num_entries = (&raw[..U32_SIZE]).get_u32_le() as usize;
        let entries = &raw[U32_SIZE..raw.len() - U32_SIZE];
        let stored_hash = (&raw[raw.len() - U32_SIZE..]).get_u32_le();
        if crc32fast::hash(entries) != stored_hash {
            return Err(StorageError::CorruptMeta("hash mismatch".to_string()).into());
        }

        let mut metas = Vec::with_capacity(num_entries);
        let mut buf = entries;
        for _ in 0..num_entries {
            if buf.remaining() < U32_SIZE + 2 {
                return Err(StorageError::CorruptMeta("truncated entry".to_string()).into());
            }
            let offset = buf.get_u32_le() as usize;
            let first_key_len = buf.get_u16_le() as usize;
            if buf.remaining() < first_key_len + 2 {
                return Err(StorageError::CorruptMeta("truncated first key".to_string()).into());
            }
            let first_key = buf.copy_to_bytes(first_key_len);
            let last_key_len = buf.get_u16_le() as usize;
            if buf.remaining() < last_key_len {
                return Err(StorageError::CorruptMeta("truncated last key".to_string()).into());
            }
            let last_key = buf.copy_to_bytes(last_key_len);
            metas.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }
        if buf.has_remaining() {
            return Err(StorageError::CorruptMeta(format!(
                "{} bytes beyond the declared entries",
                buf.remaining()
            ))
            .into());
        }
        Ok(metas)
    }
}

/// An owning handle to an SST file. Creation writes a temp file,
/// syncs it, and renames into place so readers never observe a
/// partial table; a failed build leaves nothing behind.
pub struct FileObject {
    file: File,
    size: u64,
    path: PathBuf,
}

impl FileObject {
    pub fn create(path: &Path, data: Vec<u8>) -> Result<Self> {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("invalid sst path {:?}", path))?
            .to_string_lossy()
            .into_owned();
        let tmp_path = path.with_file_name(format!("{}.tmp", file_name));

        let write = (|| -> Result<()> {
            let mut file = File::create(&tmp_path)?;
            std::io::Write::write_all(&mut file, &data)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        Ok(Self {
            file: File::open(path)?,
            size: data.len() as u64,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            path: path.to_path_buf(),
        })
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

/// Immutable on-disk table: blocks, then the meta section, then the
/// meta offset.
///
/// The bloom filter and the tranc-id range live only on the in-memory
/// descriptor; a table reopened from disk runs without a filter and
/// with a permissive id range.
pub struct SsTable {
    pub(crate) file: FileObject,
    pub(crate) block_meta: Vec<BlockMeta>,
    pub(crate) block_meta_offset: usize,
    id: usize,
    block_cache: Option<Arc<BlockCache>>,
    first_key: Bytes,
    last_key: Bytes,
    pub(crate) bloom: Option<Bloom>,
    min_tranc_id: u64,
    max_tranc_id: u64,
}

impl SsTable {
    /// Open an existing table: locate the meta section through the
    /// trailing offset and decode it (hash-checked).
    pub fn open(id: usize, block_cache: Option<Arc<BlockCache>>, file: FileObject) -> Result<Self> {
        let size = file.size();
        if size < U32_SIZE as u64 {
            return Err(StorageError::CorruptMeta("file too short".to_string()).into());
        }
        let raw_offset = file.read(size - U32_SIZE as u64, U32_SIZE as u64)?;
        let meta_offset = (&raw_offset[..]).get_u32_le() as u64;
        if meta_offset + U32_SIZE as u64 > size {
            return Err(
                StorageError::CorruptMeta("meta offset beyond the file".to_string()).into(),
            );
        }
        let raw_meta = file.read(meta_offset, size - U32_SIZE as u64 - meta_offset)?;
        let block_meta = BlockMeta::decode_block_meta(&raw_meta)?;
        let first_key = match block_meta.first() {
            Some(meta) => meta.first_key.clone(),
            None => return Err(StorageError::CorruptMeta("table has no blocks".to_string()).into()),
        };
        let last_key = block_meta.last().unwrap().last_key.clone();

        Ok(Self {
            file,
            block_meta,
            block_meta_offset: meta_offset as usize,
            id,
            block_cache,
            first_key,
            last_key,
            bloom: None,
            min_tranc_id: 0,
            max_tranc_id: u64::MAX,
        })
    }

    pub(crate) fn from_builder_parts(
        file: FileObject,
        block_meta: Vec<BlockMeta>,
        block_meta_offset: usize,
        id: usize,
        block_cache: Option<Arc<BlockCache>>,
        bloom: Option<Bloom>,
        min_tranc_id: u64,
        max_tranc_id: u64,
    ) -> Self {
        let first_key = block_meta.first().unwrap().first_key.clone();
        let last_key = block_meta.last().unwrap().last_key.clone();
        Self {
            file,
            block_meta,
            block_meta_offset,
            id,
            block_cache,
            first_key,
            last_key,
            bloom,
            min_tranc_id,
            max_tranc_id,
        }
    }

    /// Decode block `idx` straight from the file.
    pub fn read_block(&self, idx: usize) -> Result<Arc<Block>> {
        let offset = self.block_meta[idx].offset;
        let end = self
            .block_meta
            .get(idx + 1)
            .map(|meta| meta.offset)
            .unwrap_or(self.block_meta_offset);
        let raw = self.file.read(offset as u64, (end - offset) as u64)?;
        Ok(Arc::new(Block::decode(&raw)?))
    }

    /// Like `read_block`, but consults the shared cache first.
    pub fn read_block_cached(&self, idx: usize) -> Result<Arc<Block>> {
        if let Some(cache) = &self.block_cache {
            cache
                .try_get_with((self.id, idx), || self.read_block(idx))
                .map_err(|e| anyhow!("{}", e))
        } else {
            self.read_block(idx)
        }
    }

    /// Block whose key range covers `key`, if any.
    pub fn find_block_idx(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .block_meta
            .partition_point(|meta| meta.last_key.as_ref() < key);
        if idx < self.block_meta.len() && self.block_meta[idx].first_key.as_ref() <= key {
            Some(idx)
        } else {
            None
        }
    }

    /// Point lookup: an iterator positioned at the version of `key`
    /// visible to `tranc_id`, or the end iterator on a miss.
    pub fn get(self: &Arc<Self>, key: &[u8], tranc_id: u64) -> Result<SsTableIterator> {
        if key < self.first_key.as_ref() || key > self.last_key.as_ref() {
            return Ok(SsTableIterator::create_end(self.clone()));
        }
        let mut blk_idx = match self.find_block_idx(key) {
            Some(idx) => idx,
            None => return Ok(SsTableIterator::create_end(self.clone())),
        };
        loop {
            let block = self.read_block_cached(blk_idx)?;
            if let Some(entry_idx) = block.get_idx_binary(key, tranc_id) {
                return Ok(SsTableIterator::create_at(
                    self.clone(),
                    blk_idx,
                    block,
                    entry_idx,
                ));
            }
            // A version run can straddle a block boundary; keep
            // looking while the next block still starts on this key.
            let run_continues = blk_idx + 1 < self.block_meta.len()
                && self.block_meta[blk_idx].last_key.as_ref() == key
                && self.block_meta[blk_idx + 1].first_key.as_ref() == key;
            if !run_continues {
                return Ok(SsTableIterator::create_end(self.clone()));
            }
            blk_idx += 1;
        }
    }

    /// First and last user key of this table matching a monotone
    /// predicate. Binary search over the block metas narrows to the
    /// boundary blocks; the in-block search does the rest.
    pub fn predicate_key_range(
        &self,
        predicate: &dyn Fn(&[u8]) -> i32,
    ) -> Result<Option<(Bytes, Bytes)>> {
        let n = self.block_meta.len();
        let left_blk = self
            .block_meta
            .partition_point(|meta| predicate(meta.last_key.as_ref()) > 0);
        if left_blk >= n {
            return Ok(None);
        }
        let right_blk = self
            .block_meta
            .partition_point(|meta| predicate(meta.first_key.as_ref()) >= 0);
        if right_blk == 0 || right_blk <= left_blk {
            return Ok(None);
        }
        let right_blk = right_blk - 1;

        let mut first = None;
        for idx in left_blk..=right_blk {
            let block = self.read_block_cached(idx)?;
            if let Some((l, _)) = block.get_monotony_predicate_range(predicate) {
                first = Some(Bytes::copy_from_slice(block.key_at(l)));
                break;
            }
        }
        let mut last = None;
        for idx in (left_blk..=right_blk).rev() {
            let block = self.read_block_cached(idx)?;
            if let Some((_, r)) = block.get_monotony_predicate_range(predicate) {
                last = Some(Bytes::copy_from_slice(block.key_at(r - 1)));
                break;
            }
        }
        Ok(first.zip(last))
    }

    /// Remove the backing file. Callers drop the descriptor once the
    /// replacement tables are visible.
    pub fn del_sst(&self) -> Result<()> {
        self.file.remove()
    }

    pub fn sst_id(&self) -> usize {
        self.id
    }

    pub fn num_blocks(&self) -> usize {
        self.block_meta.len()
    }

    pub fn first_key(&self) -> &[u8] {
        self.first_key.as_ref()
    }

    pub fn last_key(&self) -> &[u8] {
        self.last_key.as_ref()
    }

    pub fn table_size(&self) -> u64 {
        self.file.size()
    }

    pub fn min_tranc_id(&self) -> u64 {
        self.min_tranc_id
    }

    pub fn max_tranc_id(&self) -> u64 {
        self.max_tranc_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterators::StorageIterator;
    use crate::key::KeySlice;
    use tempfile::tempdir;

    #[test]
    fn meta_codec_round_trips() {
        let metas = vec![
            BlockMeta {
                offset: 0,
                first_key: Bytes::from_static(b"aaa"),
                last_key: Bytes::from_static(b"ccc"),
            },
            BlockMeta {
                offset: 97,
                first_key: Bytes::from_static(b"ddd"),
                last_key: Bytes::from_static(b"zzz"),
            },
        ];
        let mut buf = Vec::new();
        BlockMeta::encode_block_meta(&metas, &mut buf);
        let decoded = BlockMeta::decode_block_meta(&buf).unwrap();
        assert_eq!(decoded, metas);
    }

    #[test]
    fn meta_codec_rejects_tampering() {
        let metas = vec![BlockMeta {
            offset: 12,
            first_key: Bytes::from_static(b"k1"),
            last_key: Bytes::from_static(b"k2"),
        }];
        let mut buf = Vec::new();
        BlockMeta::encode_block_meta(&metas, &mut buf);
        buf[6] ^= 0xff;
        assert!(BlockMeta::decode_block_meta(&buf).is_err());
        assert!(BlockMeta::decode_block_meta(&buf[..4]).is_err());
    }

    fn build_table(dir: &Path, id: usize, keys: usize) -> Arc<SsTable> {
        let mut builder = SsTableBuilder::new(128);
        for i in 0..keys {
            let key = format!("key{:03}", i);
            let value = format!("value{:03}", i);
            builder
                .add(
                    KeySlice::from_slice(key.as_bytes(), (i + 1) as u64),
                    value.as_bytes(),
                )
                .unwrap();
        }
        Arc::new(
            builder
                .build(id, None, &dir.join(format!("sst_{:032}.0", id)))
                .unwrap(),
        )
    }

    #[test]
    fn build_then_reopen_reads_the_same_entries() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 1, 100);
        assert!(table.num_blocks() > 1);
        assert_eq!(table.first_key(), b"key000");
        assert_eq!(table.last_key(), b"key099");
        assert!(table.bloom.is_some());

        let reopened = Arc::new(
            SsTable::open(
                1,
                None,
                FileObject::open(&dir.path().join(format!("sst_{:032}.0", 1))).unwrap(),
            )
            .unwrap(),
        );
        assert_eq!(reopened.num_blocks(), table.num_blocks());
        assert_eq!(reopened.first_key(), table.first_key());
        assert_eq!(reopened.last_key(), table.last_key());

        let iter = reopened.get(b"key042", 0).unwrap();
        assert!(iter.is_valid());
        assert_eq!(iter.key().key_ref(), b"key042");
        assert_eq!(iter.value(), b"value042");

        let miss = reopened.get(b"key42", 0).unwrap();
        assert!(!miss.is_valid());
    }

    #[test]
    fn point_lookup_respects_visibility() {
        let dir = tempdir().unwrap();
        let mut builder = SsTableBuilder::new(4096);
        builder
            .add(KeySlice::from_slice(b"k", 9), b"v9")
            .unwrap();
        builder
            .add(KeySlice::from_slice(b"k", 4), b"v4")
            .unwrap();
        let table = Arc::new(
            builder
                .build(7, None, &dir.path().join("sst_7.0"))
                .unwrap(),
        );
        assert_eq!(table.min_tranc_id(), 4);
        assert_eq!(table.max_tranc_id(), 9);

        assert_eq!(table.get(b"k", 0).unwrap().value(), b"v9");
        assert_eq!(table.get(b"k", 5).unwrap().value(), b"v4");
        assert!(!table.get(b"k", 3).unwrap().is_valid());
    }

    #[test]
    fn iterator_scans_across_blocks() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 2, 60);
        let mut iter = SsTableIterator::create_and_seek_to_first(table.clone()).unwrap();
        let mut count = 0;
        let mut prev: Option<Vec<u8>> = None;
        while iter.is_valid() {
            let key = iter.key().key_ref().to_vec();
            if let Some(p) = &prev {
                assert!(p < &key);
            }
            prev = Some(key);
            count += 1;
            iter.next().unwrap();
        }
        assert_eq!(count, 60);

        let iter =
            SsTableIterator::create_and_seek_to_key(table, KeySlice::from_slice(b"key0305", 0))
                .unwrap();
        assert!(iter.is_valid());
        assert_eq!(iter.key().key_ref(), b"key031");
    }

    #[test]
    fn predicate_range_spans_blocks() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 3, 100);
        let pred = |key: &[u8]| -> i32 {
            if key < b"key020".as_slice() {
                1
            } else if key > b"key060".as_slice() {
                -1
            } else {
                0
            }
        };
        let (first, last) = table.predicate_key_range(&pred).unwrap().unwrap();
        assert_eq!(first.as_ref(), b"key020");
        assert_eq!(last.as_ref(), b"key060");

        let nothing = |key: &[u8]| -> i32 {
            if key < b"zzz".as_slice() {
                1
            } else {
                -1
            }
        };
        assert!(table.predicate_key_range(&nothing).unwrap().is_none());
    }

    #[test]
    fn removed_table_is_gone_from_disk() {
        let dir = tempdir().unwrap();
        let table = build_table(dir.path(), 4, 10);
        let path = dir.path().join(format!("sst_{:032}.0", 4));
        assert!(path.exists());
        table.del_sst().unwrap();
        assert!(!path.exists());
    }
}
