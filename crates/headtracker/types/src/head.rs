//! Chain head abstraction.

use alloy_primitives::{B256, ChainId};
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// The capability set the head tracker needs from a chain-specific block header.
///
/// Every chain integration supplies a concrete implementation, allowing the same reorg
/// resolution engine to run against different chain families. Absence of a head is always
/// expressed with [`Option`], so implementations carry no "zero value" sentinel.
pub trait ChainHead: Clone + Debug + Send + Sync + 'static {
    /// Returns the height of the block.
    fn block_number(&self) -> u64;

    /// Returns the hash identifying the block.
    fn block_hash(&self) -> B256;

    /// Returns the hash of the block preceding this one.
    fn parent_hash(&self) -> B256;

    /// Returns the block timestamp in seconds.
    fn timestamp(&self) -> u64;

    /// Returns the identifier of the chain this head was observed on.
    fn chain_id(&self) -> ChainId;
}

/// A block header as observed on an EVM chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Constructor, Display, Serialize, Deserialize,
)]
#[display("#{number} ({hash})")]
#[serde(rename_all = "camelCase")]
pub struct BlockHead {
    /// The block number.
    pub number: u64,
    /// The block hash.
    pub hash: B256,
    /// The parent block hash.
    pub parent_hash: B256,
    /// The block timestamp.
    pub timestamp: u64,
    /// The chain the block belongs to.
    pub chain_id: ChainId,
}

impl BlockHead {
    /// Builds a [`BlockHead`] from an RPC header received from the given chain.
    pub fn from_header(header: &alloy_rpc_types_eth::Header, chain_id: ChainId) -> Self {
        Self {
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
            chain_id,
        }
    }
}

impl ChainHead for BlockHead {
    fn block_number(&self) -> u64 {
        self.number
    }

    fn block_hash(&self) -> B256 {
        self.hash
    }

    fn parent_hash(&self) -> B256 {
        self.parent_hash
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }
}
