use alloy_eips::BlockId;
use alloy_primitives::ChainId;
use kona_headtracker_storage::StorageError;
use thiserror::Error;

/// Errors returned by a [`ChainClient`](crate::ChainClient).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The request to the node failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The head subscription could not be established or broke down.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// The node delivered a head that could not be decoded.
    #[error("invalid head: {0}")]
    InvalidHead(String),
}

/// Errors returned by a [`LogProvider`](crate::LogProvider).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogProviderError {
    /// The node refused the query because the result would be too large.
    #[error("log query limit exceeded: {0}")]
    LimitExceeded(String),

    /// The log query failed.
    #[error("log query failed: {0}")]
    Request(String),
}

/// Errors that can occur while tracking heads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeadTrackerError {
    /// Error from the head storage.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Error from the chain client.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Error from the log provider.
    #[error(transparent)]
    LogProvider(#[from] LogProviderError),

    /// The client has no block for the given identifier.
    #[error("block not found: {0}")]
    BlockNotFound(BlockId),

    /// The client returned a block other than the one requested.
    #[error("requested block {requested}, client returned block {received}")]
    BlockNumberMismatch {
        /// The requested block number.
        requested: u64,
        /// The number of the returned block.
        received: u64,
    },

    /// A reorg reaches below the latest finalized block.
    #[error(
        "reorg greater than finality depth detected at block {block_number}, finalized block {finalized_block_number}"
    )]
    FinalityViolated {
        /// The block at which the reorg was detected.
        block_number: u64,
        /// The finalized block number bounding the search.
        finalized_block_number: u64,
    },

    /// A head was received from a chain other than the configured one.
    #[error("received head for chain {received}, expected chain {expected}")]
    ChainIdMismatch {
        /// The configured chain ID.
        expected: ChainId,
        /// The chain ID of the received head.
        received: ChainId,
    },

    /// Replay was requested from a block that cannot be replayed.
    #[error("cannot replay from block {from_block}, latest saved block is {latest_saved:?}")]
    InvalidReplay {
        /// The requested starting block.
        from_block: u64,
        /// The latest saved block number, if any.
        latest_saved: Option<u64>,
    },

    /// Replay was requested from a block the client has not produced yet.
    #[error("cannot replay from block {from_block}, latest block on chain is {latest}")]
    ReplayAheadOfChain {
        /// The requested starting block.
        from_block: u64,
        /// The client's latest block number.
        latest: u64,
    },

    /// The service is shutting down.
    #[error("head tracker cancelled")]
    Cancelled,
}

impl HeadTrackerError {
    /// Returns `true` if the error must stop the service instead of being retried on the next
    /// head.
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::ChainIdMismatch { .. } => true,
            Self::Storage(err) => err.is_fatal(),
            _ => false,
        }
    }
}

/// Errors raised when registering a [`LogFilter`](kona_headtracker_types::LogFilter).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    /// The filter selects no contract.
    #[error("filter {0} must specify at least one address")]
    NoAddresses(String),

    /// The filter selects no event.
    #[error("filter {0} must specify at least one event signature")]
    NoEventSigs(String),

    /// The filter contains the zero address.
    #[error("filter {0} contains the zero address")]
    ZeroAddress(String),

    /// The filter contains the zero event signature.
    #[error("filter {0} contains the zero event signature")]
    ZeroEventSig(String),
}

/// Errors raised while validating a [`HeadTrackerConfig`](crate::HeadTrackerConfig).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The broadcast buffer cannot hold any head.
    #[error("max buffer size must be greater than zero")]
    ZeroBufferSize,

    /// Backfill could never make progress.
    #[error("backfill batch size must be greater than zero")]
    ZeroBackfillBatchSize,

    /// The history window would not cover a reorg down to the finalized block.
    #[error("history depth {history_depth} must be greater than finality depth {finality_depth}")]
    HistoryTooShallow {
        /// Configured history depth.
        history_depth: u64,
        /// Configured finality depth.
        finality_depth: u64,
    },

    /// Depth-based finality needs a non-zero depth.
    #[error("finality depth must be greater than zero when the finality tag is disabled")]
    ZeroFinalityDepth,

    /// The redial backoff bounds are inverted.
    #[error("redial backoff minimum {min:?} exceeds maximum {max:?}")]
    InvalidRedialBackoff {
        /// Minimum delay.
        min: std::time::Duration,
        /// Maximum delay.
        max: std::time::Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(HeadTrackerError::ChainIdMismatch { expected: 1, received: 2 }.is_fatal());
        assert!(HeadTrackerError::Storage(StorageError::LockPoisoned).is_fatal());

        let invalid_range = StorageError::InvalidRange { from: 2, to: 1 };
        assert!(!HeadTrackerError::Storage(invalid_range).is_fatal());
        assert!(!HeadTrackerError::Cancelled.is_fatal());
        assert!(
            !HeadTrackerError::FinalityViolated { block_number: 10, finalized_block_number: 5 }
                .is_fatal()
        );
        assert!(!HeadTrackerError::Client(ClientError::Transport("timeout".into())).is_fatal());
    }

    #[test]
    fn test_block_not_found_display() {
        let err = HeadTrackerError::BlockNotFound(BlockId::number(12));
        assert!(err.to_string().starts_with("block not found"));
    }
}
