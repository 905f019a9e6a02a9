use crate::{SavedBlock, StorageError};
use alloy_primitives::B256;
use kona_headtracker_types::{ChainHead, Log};
use std::fmt::Debug;

/// Provides read access to the chain history recorded by the head tracker.
///
/// Lookups return `Ok(None)` when nothing is stored for the key. A missing entry is an
/// expected condition (for example the very first poll on a new chain) and is kept apart from
/// genuine storage failures.
pub trait HeadStorageReader: Debug {
    /// The chain-specific head type held by the storage.
    type Head: ChainHead;

    /// Returns the highest-numbered block stored so far.
    ///
    /// # Returns
    /// * `Ok(Some(SavedBlock))` with the latest block.
    /// * `Ok(None)` if nothing was ever stored for this chain.
    /// * `Err(StorageError)` if the storage could not be read.
    fn latest_block(&self) -> Result<Option<SavedBlock<Self::Head>>, StorageError>;

    /// Returns the block stored at the given height.
    ///
    /// When several competing heads were stored at the same height, the most recently stored
    /// one is returned.
    ///
    /// # Arguments
    /// * `block_number` - The height to look up.
    fn block_by_number(
        &self,
        block_number: u64,
    ) -> Result<Option<SavedBlock<Self::Head>>, StorageError>;

    /// Returns the head with the given hash.
    fn head_by_hash(&self, block_hash: B256) -> Result<Option<Self::Head>, StorageError>;

    /// Walks parent links from the head with the given hash through every known ancestor.
    ///
    /// The returned chain starts at the requested head and ends at the oldest ancestor still
    /// retained. It is empty if the hash is unknown.
    fn chain(&self, block_hash: B256) -> Result<Vec<Self::Head>, StorageError>;

    /// Returns [`HeadStorageReader::chain`] starting at the latest head.
    fn latest_chain(&self) -> Result<Vec<Self::Head>, StorageError>;

    /// Returns the logs stored for the given block hash, ordered by log index.
    fn logs_by_block_hash(&self, block_hash: B256) -> Result<Vec<Log>, StorageError>;

    /// Returns the logs stored for blocks in `from..=to`, ordered by block and log index.
    ///
    /// # Returns
    /// * `Err(StorageError::InvalidRange)` if `from > to`.
    fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<Log>, StorageError>;
}

/// Provides write access to the chain history recorded by the head tracker.
///
/// All writes are atomic from the caller's perspective. A failed write leaves the previously
/// stored state untouched, so callers may simply retry from the last saved block.
pub trait HeadStorageWriter: HeadStorageReader {
    /// Stores a processed block together with the logs it produced.
    ///
    /// Heads older than the configured history depth are evicted afterwards, except those at or
    /// above the finalized block number recorded with the latest head. Logs are not evicted
    /// with their heads.
    ///
    /// # Arguments
    /// * `block` - The block to save.
    /// * `logs` - The logs emitted within that block.
    fn store_block_logs(
        &self,
        block: SavedBlock<Self::Head>,
        logs: Vec<Log>,
    ) -> Result<(), StorageError>;

    /// Stores logs without an accompanying head.
    ///
    /// Used for bulk backfill of finalized history. Logs already present are skipped, which
    /// makes repeated backfills of the same range idempotent.
    fn store_logs(&self, logs: Vec<Log>) -> Result<(), StorageError>;

    /// Inserts heads into the chain history.
    ///
    /// Heads already known by hash are ignored. The latest head only moves to a strictly higher
    /// block number. Once all heads are inserted, every head with
    /// `latest - number >= history_depth` is evicted. Logs are not evicted with their heads.
    ///
    /// # Arguments
    /// * `history_depth` - The retention window, clamped to at least one block.
    /// * `blocks` - The blocks to insert.
    fn add_heads(
        &self,
        history_depth: u64,
        blocks: Vec<SavedBlock<Self::Head>>,
    ) -> Result<(), StorageError>;

    /// Removes every head and log at or above `block_number`.
    ///
    /// Used to discard a non-canonical suffix after a reorg. Deleting a range that holds
    /// nothing is a no-op.
    fn delete_from(&self, block_number: u64) -> Result<(), StorageError>;
}

/// Combines [`HeadStorageReader`] and [`HeadStorageWriter`].
pub trait HeadStorage: HeadStorageWriter {}

impl<T: HeadStorageWriter> HeadStorage for T {}
