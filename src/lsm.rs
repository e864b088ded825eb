use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::error;

use crate::engine::LsmEngine;
use crate::lsm_iterator::{FusedIterator, LsmIterator};
use crate::options::LsmOptions;
use crate::tranc::TrancManager;

/// The public surface: the engine plus the transaction-id glue.
///
/// Every mutating call runs under a fresh transaction id; readers see
/// everything committed before them. Closing (or dropping) the handle
/// drains the memtable to disk and persists the id watermark, which
/// is all the durability this core provides — write-ahead logging
/// belongs to an outer layer.
pub struct Lsm {
    engine: Arc<LsmEngine>,
    tranc_manager: Arc<TrancManager>,
}

impl Lsm {
    pub fn open(path: impl AsRef<Path>, options: LsmOptions) -> Result<Self> {
        let engine = Arc::new(LsmEngine::open(&path, options)?);
        let tranc_manager = Arc::new(TrancManager::open(&path)?);
        Ok(Self {
            engine,
            tranc_manager,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.put_inner(self.engine.put(key, value, tranc_id)?)
    }

    pub fn put_batch(&self, kvs: &[(&[u8], &[u8])]) -> Result<()> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.put_inner(self.engine.put_batch(kvs, tranc_id)?)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.put_inner(self.engine.remove(key, tranc_id)?)
    }

    pub fn remove_batch(&self, keys: &[&[u8]]) -> Result<()> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.put_inner(self.engine.remove_batch(keys, tranc_id)?)
    }

    /// Propagate the flushed watermark when a write triggered a
    /// flush.
    fn put_inner(&self, flushed_sst_id: usize) -> Result<()> {
        if flushed_sst_id != 0 {
            self.tranc_manager
                .update_max_flushed_tranc_id(self.engine.max_flushed_tranc_id());
        }
        Ok(())
    }

    /// Read at the latest snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        Ok(self.engine.get(key, tranc_id)?.map(|(value, _)| value))
    }

    /// Read at an explicit snapshot (0 means newest).
    pub fn get_with_tranc_id(&self, key: &[u8], tranc_id: u64) -> Result<Option<Bytes>> {
        Ok(self.engine.get(key, tranc_id)?.map(|(value, _)| value))
    }

    pub fn get_batch(&self, keys: &[&[u8]]) -> Result<Vec<Option<Bytes>>> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        Ok(self
            .engine
            .get_batch(keys, tranc_id)?
            .into_iter()
            .map(|slot| slot.map(|(value, _)| value))
            .collect())
    }

    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<FusedIterator<LsmIterator>> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.engine.scan(lower, upper, tranc_id)
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Option<FusedIterator<LsmIterator>>> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.engine.scan_prefix(prefix, tranc_id)
    }

    pub fn iters_monotony_predicate(
        &self,
        predicate: &dyn Fn(&[u8]) -> i32,
    ) -> Result<Option<FusedIterator<LsmIterator>>> {
        let tranc_id = self.tranc_manager.next_transaction_id();
        self.engine.iters_monotony_predicate(tranc_id, predicate)
    }

    pub fn flush(&self) -> Result<()> {
        if self.engine.flush()? != 0 {
            self.tranc_manager
                .update_max_flushed_tranc_id(self.engine.max_flushed_tranc_id());
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        self.engine.flush_all()?;
        self.tranc_manager
            .update_max_flushed_tranc_id(self.engine.max_flushed_tranc_id());
        Ok(())
    }

    /// Flush everything and persist the id watermark.
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        self.tranc_manager.write_tranc_id_file()
    }

    pub fn engine(&self) -> &Arc<LsmEngine> {
        &self.engine
    }
}

impl Drop for Lsm {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("error while closing the store: {e:#}");
        }
    }
}
