use thiserror::Error;

/// Errors that may occur while interacting with head storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// A writer panicked while holding the chain history lock; the stored state can no longer
    /// be trusted.
    #[error("chain history lock poisoned")]
    LockPoisoned,

    /// The requested block range is empty.
    #[error("invalid block range: {from} > {to}")]
    InvalidRange {
        /// First block of the range.
        from: u64,
        /// Last block of the range, inclusive.
        to: u64,
    },
}

impl StorageError {
    /// Returns `true` if the storage can no longer be used.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::LockPoisoned)
    }
}
