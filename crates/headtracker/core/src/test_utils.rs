//! Test utilities for the head tracker.
//!
//! [`TestChainClient`] simulates a node in memory: blocks are produced on demand, the canonical
//! chain can be reorganized from any height, and subscriptions are driven explicitly by the
//! test.

use crate::{
    ChainClient, ClientError, HeadStream, HeadTrackerMetrics, LogProvider, LogProviderError,
};
use alloy_primitives::{Address, B256, ChainId};
use async_trait::async_trait;
use kona_headtracker_types::{BlockHead, Log, LogFilter};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Contract emitting every synthetic log of [`TestLogProvider`].
pub const TEST_ADDRESS: Address = Address::with_last_byte(0xaa);

/// Event signature of every synthetic log of [`TestLogProvider`].
pub const TEST_EVENT_SIG: B256 = B256::with_last_byte(0xee);

/// Returns the deterministic hash of block `number` on fork `fork`.
pub fn block_hash(number: u64, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&number.to_be_bytes());
    bytes[31] = fork;
    B256::from(bytes)
}

#[derive(Debug, Default)]
struct SimulatedChain {
    blocks: HashMap<B256, BlockHead>,
    canonical: BTreeMap<u64, B256>,
    forks: u8,
    finalized: Option<u64>,
    subscribers: Vec<mpsc::UnboundedSender<Result<BlockHead, ClientError>>>,
    failing_subscriptions: usize,
    subscribe_calls: usize,
    failing_requests: bool,
}

impl SimulatedChain {
    fn tip(&self) -> Option<BlockHead> {
        self.canonical.last_key_value().map(|(_, hash)| self.blocks[hash])
    }

    fn push(&mut self, chain_id: ChainId) -> BlockHead {
        let (number, parent_hash) = match self.tip() {
            Some(tip) => (tip.number + 1, tip.hash),
            None => (0, B256::ZERO),
        };
        let hash = block_hash(number, self.forks);
        let head = BlockHead::new(number, hash, parent_hash, number * 12, chain_id);
        self.blocks.insert(head.hash, head);
        self.canonical.insert(number, head.hash);
        head
    }
}

/// An in-memory [`ChainClient`] over a simulated chain of [`BlockHead`]s.
#[derive(Debug)]
pub struct TestChainClient {
    chain_id: ChainId,
    chain: Mutex<SimulatedChain>,
}

impl TestChainClient {
    /// Creates a client whose chain holds blocks `0..=tip`.
    pub fn new(chain_id: ChainId, tip: u64) -> Self {
        let client = Self { chain_id, chain: Mutex::new(SimulatedChain::default()) };
        client.extend(tip + 1);
        client
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedChain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `count` blocks to the canonical chain and returns them.
    pub fn extend(&self, count: u64) -> Vec<BlockHead> {
        let mut chain = self.lock();
        (0..count).map(|_| chain.push(self.chain_id)).collect()
    }

    /// Replaces every canonical block at or above `from` with `count` blocks of a new fork.
    pub fn reorg(&self, from: u64, count: u64) -> Vec<BlockHead> {
        let mut chain = self.lock();
        chain.canonical.retain(|number, _| *number < from);
        chain.forks += 1;
        (0..count).map(|_| chain.push(self.chain_id)).collect()
    }

    /// Adds `head` to the known blocks, making it the canonical block at its height if
    /// `canonical` is set.
    pub fn insert_block(&self, head: BlockHead, canonical: bool) {
        let mut chain = self.lock();
        chain.blocks.insert(head.hash, head);
        if canonical {
            chain.canonical.insert(head.number, head.hash);
        }
    }

    /// Returns the canonical block at `number`.
    pub fn block(&self, number: u64) -> Option<BlockHead> {
        let chain = self.lock();
        chain.canonical.get(&number).map(|hash| chain.blocks[hash])
    }

    /// Returns the canonical tip.
    pub fn tip(&self) -> BlockHead {
        self.lock().tip().unwrap_or_default()
    }

    /// Sets the block reported as finalized.
    pub fn set_finalized(&self, number: Option<u64>) {
        self.lock().finalized = number;
    }

    /// Makes the next `count` subscription attempts fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.lock().failing_subscriptions = count;
    }

    /// Makes every block request fail until reset.
    pub fn fail_requests(&self, failing: bool) {
        self.lock().failing_requests = failing;
    }

    /// Returns the number of subscription attempts so far.
    pub fn subscribe_calls(&self) -> usize {
        self.lock().subscribe_calls
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut chain = self.lock();
        chain.subscribers.retain(|tx| !tx.is_closed());
        chain.subscribers.len()
    }

    /// Sends an item to every live subscription.
    pub fn emit(&self, item: Result<BlockHead, ClientError>) {
        self.lock().subscribers.retain(|tx| tx.send(item.clone()).is_ok());
    }

    /// Sends the canonical tip to every live subscription.
    pub fn emit_tip(&self) -> BlockHead {
        let tip = self.tip();
        self.emit(Ok(tip));
        tip
    }

    /// Ends every live subscription.
    pub fn drop_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    fn check_requests(&self) -> Result<(), ClientError> {
        if self.lock().failing_requests {
            return Err(ClientError::Transport("simulated request failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for TestChainClient {
    type Head = BlockHead;

    async fn head_by_number(&self, number: Option<u64>) -> Result<Option<BlockHead>, ClientError> {
        self.check_requests()?;
        Ok(match number {
            Some(number) => self.block(number),
            None => self.lock().tip(),
        })
    }

    async fn head_by_hash(&self, block_hash: B256) -> Result<Option<BlockHead>, ClientError> {
        self.check_requests()?;
        Ok(self.lock().blocks.get(&block_hash).copied())
    }

    async fn latest_finalized_block(&self) -> Result<Option<BlockHead>, ClientError> {
        self.check_requests()?;
        let finalized = self.lock().finalized;
        Ok(finalized.and_then(|number| self.block(number)))
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream<BlockHead>, ClientError> {
        let mut chain = self.lock();
        chain.subscribe_calls += 1;
        if chain.failing_subscriptions > 0 {
            chain.failing_subscriptions -= 1;
            return Err(ClientError::Subscription("simulated subscription failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        chain.subscribers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn configured_chain_id(&self) -> ChainId {
        self.chain_id
    }
}

/// A [`LogProvider`] serving one synthetic log per block of a [`TestChainClient`].
#[derive(Debug)]
pub struct TestLogProvider {
    chain: Arc<TestChainClient>,
    max_range: Option<u64>,
    ranges: Mutex<Vec<(u64, u64)>>,
    block_queries: AtomicUsize,
}

impl TestLogProvider {
    /// Creates a provider serving logs of the given chain.
    pub const fn new(chain: Arc<TestChainClient>) -> Self {
        Self {
            chain,
            max_range: None,
            ranges: Mutex::new(Vec::new()),
            block_queries: AtomicUsize::new(0),
        }
    }

    /// Refuses range queries spanning more than `max_range` blocks.
    pub const fn with_max_range(mut self, max_range: u64) -> Self {
        self.max_range = Some(max_range);
        self
    }

    /// Returns every successfully served range query.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the number of per-block log queries.
    pub fn block_queries(&self) -> usize {
        self.block_queries.load(Ordering::SeqCst)
    }

    /// Returns a filter selecting every synthetic log.
    pub fn filter() -> LogFilter {
        LogFilter::new([TEST_ADDRESS], [TEST_EVENT_SIG])
    }

    /// Returns the synthetic log of the given block.
    pub fn log_for(head: &BlockHead) -> Log {
        Log {
            address: TEST_ADDRESS,
            topics: vec![TEST_EVENT_SIG],
            block_hash: head.hash,
            block_number: head.number,
            block_timestamp: Some(head.timestamp),
            transaction_hash: head.hash,
            ..Default::default()
        }
    }
}

#[async_trait]
impl LogProvider for TestLogProvider {
    async fn logs_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, LogProviderError> {
        if self.max_range.is_some_and(|max| to - from + 1 > max) {
            return Err(LogProviderError::LimitExceeded(format!("range {from}..={to} too large")));
        }
        self.ranges.lock().unwrap_or_else(PoisonError::into_inner).push((from, to));
        Ok((from..=to)
            .filter_map(|n| self.chain.block(n))
            .map(|h| Self::log_for(&h))
            .filter(|log| filter.matches(log))
            .collect())
    }

    async fn logs_by_block_hash(
        &self,
        block_hash: B256,
        filter: &LogFilter,
    ) -> Result<Vec<Log>, LogProviderError> {
        self.block_queries.fetch_add(1, Ordering::SeqCst);
        let head = self.chain.lock().blocks.get(&block_hash).copied();
        Ok(head.map(|h| Self::log_for(&h)).filter(|log| filter.matches(log)).into_iter().collect())
    }
}

/// A [`HeadTrackerMetrics`] sink counting every observation.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    /// Heads received.
    pub heads_received: AtomicUsize,
    /// Connection errors.
    pub connection_errors: AtomicUsize,
    /// Very old heads.
    pub very_old_heads: AtomicUsize,
    /// Resolved reorgs.
    pub reorgs: AtomicUsize,
    /// Sum of the depths of all resolved reorgs.
    pub reorg_depth: AtomicU64,
    /// Finality violations.
    pub finality_violations: AtomicUsize,
    /// Backfilled blocks.
    pub backfilled_blocks: AtomicU64,
}

impl HeadTrackerMetrics for RecordingMetrics {
    fn record_head_received(&self, _: ChainId) {
        self.heads_received.fetch_add(1, Ordering::SeqCst);
    }

    fn record_connection_error(&self, _: ChainId) {
        self.connection_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn record_very_old_head(&self, _: ChainId) {
        self.very_old_heads.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reorg(&self, _: ChainId, depth: u64) {
        self.reorgs.fetch_add(1, Ordering::SeqCst);
        self.reorg_depth.fetch_add(depth, Ordering::SeqCst);
    }

    fn record_finality_violation(&self, _: ChainId) {
        self.finality_violations.fetch_add(1, Ordering::SeqCst);
    }

    fn record_backfill(&self, _: ChainId, blocks: u64) {
        self.backfilled_blocks.fetch_add(blocks, Ordering::SeqCst);
    }
}
