use thiserror::Error;

/// Typed failure kinds for the storage core.
///
/// Corruption and invariant violations are fatal to the operation that
/// hit them and propagate to the caller through `anyhow`. IO failures
/// travel as `std::io::Error`. A missing key is not an error; lookups
/// report it as an empty result.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    #[error("corrupt meta section: {0}")]
    CorruptMeta(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
