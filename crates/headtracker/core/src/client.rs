//! Chain client abstraction consumed by the head tracker.

use crate::{ClientError, LogProviderError};
use alloy_primitives::{B256, ChainId};
use async_trait::async_trait;
use futures::Stream;
use kona_headtracker_types::{ChainHead, Log, LogFilter};
use std::{fmt::Debug, pin::Pin};

/// A stream of heads produced by a single subscription.
pub type HeadStream<H> = Pin<Box<dyn Stream<Item = Result<H, ClientError>> + Send>>;

/// Access to the remote node the tracker follows.
///
/// Lookups return `Ok(None)` when the node has no matching block.
#[async_trait]
pub trait ChainClient: Debug + Send + Sync + 'static {
    /// The head type produced by the client.
    type Head: ChainHead;

    /// Fetches the head at the given height, or the latest head when `number` is `None`.
    async fn head_by_number(&self, number: Option<u64>) -> Result<Option<Self::Head>, ClientError>;

    /// Fetches the head with the given hash.
    async fn head_by_hash(&self, block_hash: B256) -> Result<Option<Self::Head>, ClientError>;

    /// Fetches the head the node currently reports as finalized.
    async fn latest_finalized_block(&self) -> Result<Option<Self::Head>, ClientError>;

    /// Opens a new subscription to heads as the node imports them.
    ///
    /// The returned stream ends or yields an error when the subscription breaks down.
    async fn subscribe_new_heads(&self) -> Result<HeadStream<Self::Head>, ClientError>;

    /// Returns the chain ID every received head must belong to.
    fn configured_chain_id(&self) -> ChainId;
}

/// Access to the logs emitted on the followed chain.
///
/// Only logs selected by the given [`LogFilter`] are returned.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogProvider: Debug + Send + Sync + 'static {
    /// Returns the matching logs of every block in `from..=to`.
    ///
    /// Returns [`LogProviderError::LimitExceeded`] when the node refuses a range this large.
    async fn logs_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, LogProviderError>;

    /// Returns the matching logs of the block with the given hash.
    async fn logs_by_block_hash(
        &self,
        block_hash: B256,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, LogProviderError>;
}
