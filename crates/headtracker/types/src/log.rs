//! Log records associated with saved heads.

use alloy_primitives::{Address, B256, Bytes};
use serde::{Deserialize, Serialize};

/// A log emitted by a transaction in a canonical block.
///
/// Logs are identified by `(block_hash, log_index)`; storing the same log twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// The emitting contract.
    pub address: Address,
    /// Indexed topics.
    pub topics: Vec<B256>,
    /// Non-indexed payload.
    pub data: Bytes,
    /// Hash of the block containing the log.
    pub block_hash: B256,
    /// Number of the block containing the log.
    pub block_number: u64,
    /// Timestamp of the block containing the log, when the node reports it.
    pub block_timestamp: Option<u64>,
    /// Hash of the emitting transaction.
    pub transaction_hash: B256,
    /// Position of the log within its block.
    pub log_index: u64,
}

impl Log {
    /// Converts an RPC log into a [`Log`].
    ///
    /// Returns `None` for pending logs, which carry no block position yet.
    pub fn from_rpc(log: &alloy_rpc_types_eth::Log) -> Option<Self> {
        Some(Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_hash: log.block_hash?,
            block_number: log.block_number?,
            block_timestamp: log.block_timestamp,
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            log_index: log.log_index?,
        })
    }

    /// Returns the key identifying this log.
    pub const fn id(&self) -> (B256, u64) {
        (self.block_hash, self.log_index)
    }
}
