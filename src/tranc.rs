use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const TRANC_ID_FILE: &str = "tranc_id";

#[derive(Serialize, Deserialize)]
struct TrancIdRecord {
    next_tranc_id: u64,
    max_flushed_tranc_id: u64,
}

/// Allocates monotonic transaction ids and persists the watermark.
///
/// Commit, abort and isolation enforcement live outside the storage
/// core; this is only the id fountain the engine's visibility scalar
/// comes from.
pub struct TrancManager {
    next_tranc_id: AtomicU64,
    max_flushed_tranc_id: AtomicU64,
    path: PathBuf,
}

impl TrancManager {
    /// Load the persisted watermark from `dir`, or start fresh at 1.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(TRANC_ID_FILE);
        let (next, max_flushed) = if path.exists() {
            let raw = fs::read(&path)
                .with_context(|| format!("failed to read tranc id file {:?}", path))?;
            let record: TrancIdRecord =
                serde_json::from_slice(&raw).context("corrupt tranc id file")?;
            (record.next_tranc_id, record.max_flushed_tranc_id)
        } else {
            (1, 0)
        };
        Ok(Self {
            next_tranc_id: AtomicU64::new(next),
            max_flushed_tranc_id: AtomicU64::new(max_flushed),
            path,
        })
    }

    pub fn next_transaction_id(&self) -> u64 {
        self.next_tranc_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn update_max_flushed_tranc_id(&self, tranc_id: u64) {
        self.max_flushed_tranc_id
            .fetch_max(tranc_id, Ordering::SeqCst);
    }

    pub fn max_flushed_tranc_id(&self) -> u64 {
        self.max_flushed_tranc_id.load(Ordering::SeqCst)
    }

    /// Persist the watermark with an atomic rewrite.
    pub fn write_tranc_id_file(&self) -> Result<()> {
        let record = TrancIdRecord {
            next_tranc_id: self.next_tranc_id.load(Ordering::SeqCst),
            max_flushed_tranc_id: self.max_flushed_tranc_id.load(Ordering::SeqCst),
        };
        let raw = serde_json::to_vec(&record)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &raw)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
