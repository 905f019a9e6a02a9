//! [`ChainClient`] and [`LogProvider`] over an alloy websocket provider.

use alloy_eips::BlockNumberOrTag;
use alloy_network::Ethereum;
use alloy_primitives::{B256, ChainId};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::{RpcClient, WsConnect};
use alloy_rpc_types_eth::{Block, Filter};
use alloy_transport::{TransportError, TransportResult};
use async_trait::async_trait;
use futures::StreamExt;
use kona_headtracker::{ChainClient, ClientError, HeadStream, LogProvider, LogProviderError};
use kona_headtracker_types::{BlockHead, Log, LogFilter};
use tracing::trace;
use url::Url;

/// JSON-RPC error code returned by nodes when a request exceeds a server-side limit.
const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Fragments of error messages nodes use to refuse oversized log queries.
const LIMIT_EXCEEDED_MESSAGES: [&str; 4] =
    ["limit exceeded", "query returned more than", "block range", "response size"];

/// Follows an EVM chain through a websocket RPC endpoint.
#[derive(Debug, Clone)]
pub struct AlloyChainClient {
    provider: RootProvider<Ethereum>,
    chain_id: ChainId,
}

impl AlloyChainClient {
    /// Connects to the websocket endpoint at `url`.
    pub async fn connect(url: &Url, chain_id: ChainId) -> TransportResult<Self> {
        let client = RpcClient::connect_pubsub(WsConnect::new(url.as_str())).await?;
        Ok(Self { provider: RootProvider::new(client), chain_id })
    }

    /// Returns the chain ID reported by the node.
    pub async fn remote_chain_id(&self) -> TransportResult<ChainId> {
        self.provider.get_chain_id().await
    }

    fn to_head(&self, block: Option<Block>) -> Option<BlockHead> {
        block.map(|block| BlockHead::from_header(&block.header, self.chain_id))
    }
}

fn client_error(err: TransportError) -> ClientError {
    ClientError::Transport(err.to_string())
}

fn log_provider_error(err: TransportError) -> LogProviderError {
    let limit_exceeded = err.as_error_resp().is_some_and(|payload| {
        let message = payload.message.to_lowercase();
        payload.code == LIMIT_EXCEEDED_CODE ||
            LIMIT_EXCEEDED_MESSAGES.iter().any(|fragment| message.contains(fragment))
    });
    if limit_exceeded {
        LogProviderError::LimitExceeded(err.to_string())
    } else {
        LogProviderError::Request(err.to_string())
    }
}

fn convert_logs(logs: Vec<alloy_rpc_types_eth::Log>) -> Vec<Log> {
    let total = logs.len();
    let logs: Vec<_> = logs.iter().filter_map(Log::from_rpc).collect();
    if logs.len() < total {
        trace!(
            target: "headtracker::provider",
            skipped = total - logs.len(),
            "Skipped pending logs"
        );
    }
    logs
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    type Head = BlockHead;

    async fn head_by_number(&self, number: Option<u64>) -> Result<Option<BlockHead>, ClientError> {
        let tag = number.map_or(BlockNumberOrTag::Latest, BlockNumberOrTag::Number);
        let block = self.provider.get_block_by_number(tag).await.map_err(client_error)?;
        Ok(self.to_head(block))
    }

    async fn head_by_hash(&self, block_hash: B256) -> Result<Option<BlockHead>, ClientError> {
        let block = self.provider.get_block_by_hash(block_hash).await.map_err(client_error)?;
        Ok(self.to_head(block))
    }

    async fn latest_finalized_block(&self) -> Result<Option<BlockHead>, ClientError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Finalized)
            .await
            .map_err(client_error)?;
        Ok(self.to_head(block))
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream<BlockHead>, ClientError> {
        let subscription = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|err| ClientError::Subscription(err.to_string()))?;
        let chain_id = self.chain_id;
        let stream = subscription
            .into_stream()
            .map(move |header| Ok(BlockHead::from_header(&header, chain_id)));
        Ok(Box::pin(stream))
    }

    fn configured_chain_id(&self) -> ChainId {
        self.chain_id
    }
}

#[async_trait]
impl LogProvider for AlloyChainClient {
    async fn logs_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, LogProviderError> {
        let filter = rpc_filter(filter).from_block(from).to_block(to);
        let logs = self.provider.get_logs(&filter).await.map_err(log_provider_error)?;
        Ok(convert_logs(logs))
    }

    async fn logs_by_block_hash(
        &self,
        block_hash: B256,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, LogProviderError> {
        let filter = rpc_filter(filter).at_block_hash(block_hash);
        let logs = self.provider.get_logs(&filter).await.map_err(log_provider_error)?;
        Ok(convert_logs(logs))
    }
}

/// Builds an `eth_getLogs` filter selecting the addresses and event signatures of `filter`.
fn rpc_filter(filter: &LogFilter) -> Filter {
    Filter::new().address(filter.addresses.clone()).event_signature(filter.event_sigs.clone())
}
