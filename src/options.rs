/// Numeric tunables for the engine.
///
/// The configuration loader lives outside the core; whatever reads a
/// config file hands the resolved numbers over through this struct.
#[derive(Debug, Clone)]
pub struct LsmOptions {
    /// Byte budget of one block, and the builder capacity.
    pub block_size: usize,
    /// Byte budget of a single skiplist. Crossing it freezes the
    /// active skiplist; it is also the target SST size at L0.
    pub per_mem_size_limit: usize,
    /// Total memtable byte budget (active + frozen) that triggers a
    /// flush to L0.
    pub tol_mem_size_limit: usize,
    /// Per-level fanout. Doubles as the L0 table count that triggers
    /// compaction before a flush.
    pub sst_level_ratio: usize,
    /// Entry capacity of the shared block cache.
    pub block_cache_capacity: u64,
    /// Sizing floor for the per-SST bloom filter, in keys.
    pub bloom_expected_size: usize,
    /// Acceptable bloom filter false positive rate.
    pub bloom_expected_error_rate: f64,
}

impl Default for LsmOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            per_mem_size_limit: 4 << 20,
            tol_mem_size_limit: 8 << 20,
            sst_level_ratio: 4,
            block_cache_capacity: 1 << 10,
            bloom_expected_size: 1 << 16,
            bloom_expected_error_rate: 0.01,
        }
    }
}

impl LsmOptions {
    /// Small budgets so tests exercise freeze, flush and compaction
    /// with a few hundred keys.
    pub fn small_for_test() -> Self {
        Self {
            block_size: 256,
            per_mem_size_limit: 1 << 10,
            tol_mem_size_limit: 2 << 10,
            sst_level_ratio: 4,
            block_cache_capacity: 64,
            bloom_expected_size: 64,
            bloom_expected_error_rate: 0.01,
        }
    }
}
