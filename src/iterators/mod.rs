pub mod concat_iterator;
pub mod merge_iterator;
pub mod two_merge_iterator;

use anyhow::Result;

/// The crate-wide cursor contract: a positioned iterator exposing the
/// current entry until `next` moves it or exhausts it.
pub trait StorageIterator {
    type KeyType<'a>: PartialEq + Eq + PartialOrd + Ord
    where
        Self: 'a;

    /// Current value. Only meaningful while `is_valid`.
    fn value(&self) -> &[u8];

    /// Current key. Only meaningful while `is_valid`.
    fn key(&self) -> Self::KeyType<'_>;

    fn is_valid(&self) -> bool;

    fn next(&mut self) -> Result<()>;

    /// Number of underlying leaf iterators, for introspection in
    /// tests.
    fn num_active_iterators(&self) -> usize {
        1
    }
}
