//! Reorg-aware processing of new heads.

use crate::{
    ChainClient, ErrorBuffer, FilterRegistry, HeadBroadcaster, HeadTrackerConfig,
    HeadTrackerError, HeadTrackerMetrics, HealthError, HealthReport, LogBackfiller, LogProvider,
    Mailbox, NewHeadHandler,
};
use alloy_eips::BlockId;
use alloy_primitives::B256;
use async_trait::async_trait;
use kona_headtracker_storage::{HeadStorage, SavedBlock};
use kona_headtracker_types::ChainHead;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::{
    sync::Mutex,
    time::{Instant, MissedTickBehavior, interval, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Follows the chain reported by the client and keeps the saved history canonical.
///
/// For every new head the tracker resumes after the latest saved block, checks each block's
/// parent hash against the saved history, and on a mismatch walks back to the lowest common
/// ancestor, deletes the stale suffix and continues from the block after it. Finalized ranges
/// are backfilled in bulk.
///
/// Rounds triggered by new heads, [`HeadTracker::retrieve_and_save_heads`] and
/// [`HeadTracker::replay`] never overlap.
#[derive(Debug)]
pub struct HeadTracker<C, S, L>
where
    C: ChainClient,
{
    client: Arc<C>,
    storage: Arc<S>,
    log_provider: Arc<L>,
    filters: Arc<FilterRegistry>,
    backfiller: LogBackfiller<S, L>,
    broadcaster: Arc<HeadBroadcaster<C::Head>>,
    broadcast_buffer: Mailbox<C::Head>,
    config: HeadTrackerConfig,
    metrics: Arc<dyn HeadTrackerMetrics>,
    round: Mutex<()>,
    finality_violated: AtomicBool,
    /// Next block of the backup poller, zero until the first backup poll.
    backup_next_block: AtomicU64,
    errors: ErrorBuffer,
    cancel: CancellationToken,
}

impl<C, S, L> HeadTracker<C, S, L>
where
    C: ChainClient,
    S: HeadStorage<Head = C::Head> + Send + Sync + 'static,
    L: LogProvider,
{
    /// Component name used in health reports.
    pub const NAME: &'static str = "HeadTracker";

    /// Creates a new tracker.
    pub fn new(
        client: Arc<C>,
        storage: Arc<S>,
        log_provider: Arc<L>,
        broadcaster: Arc<HeadBroadcaster<C::Head>>,
        config: HeadTrackerConfig,
        metrics: Arc<dyn HeadTrackerMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let filters = Arc::new(FilterRegistry::default());
        let backfiller = LogBackfiller::new(
            Arc::clone(&storage),
            Arc::clone(&log_provider),
            Arc::clone(&filters),
            config.backfill_batch_size,
        );
        Self {
            client,
            storage,
            log_provider,
            filters,
            backfiller,
            broadcaster,
            broadcast_buffer: Mailbox::new(config.max_buffer_size),
            config,
            metrics,
            round: Mutex::new(()),
            finality_violated: AtomicBool::new(false),
            backup_next_block: AtomicU64::new(0),
            errors: ErrorBuffer::default(),
            cancel,
        }
    }

    /// Returns the registry of filters selecting the logs saved with each block.
    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Returns the errors reported for operator visibility since the last call.
    pub fn take_errors(&self) -> Vec<HeadTrackerError> {
        self.errors.flush()
    }

    /// Returns `true` if the last processed round detected a reorg below the finalized block.
    pub fn finality_violated(&self) -> bool {
        self.finality_violated.load(Ordering::Acquire)
    }

    /// Reports the tracker unhealthy while finality is violated.
    pub fn health_report(&self) -> HealthReport {
        let status =
            if self.finality_violated() { Err(HealthError::FinalityViolated) } else { Ok(()) };
        HealthReport::from([(Self::NAME.to_string(), status)])
    }

    /// Returns the latest saved head.
    pub fn latest_chain(&self) -> Result<Option<C::Head>, HeadTrackerError> {
        Ok(self.storage.latest_block()?.map(|block| block.head))
    }

    /// Fetches the latest head from the client together with the finalized block number.
    pub async fn latest_and_finalized_block(&self) -> Result<(C::Head, u64), HeadTrackerError> {
        let latest = self
            .cancellable(self.client.head_by_number(None))
            .await??
            .ok_or(HeadTrackerError::BlockNotFound(BlockId::latest()))?;
        let finalized = self.finalized_block_number(&latest).await?;
        Ok((latest, finalized))
    }

    /// Processes a newly observed head.
    ///
    /// Transient failures are logged and swallowed: the next head resumes from the latest saved
    /// block. Only cancellation and fatal errors are returned.
    pub async fn process_new_head(&self, head: C::Head) -> Result<(), HeadTrackerError> {
        let result = async {
            let _round = self.cancellable(self.round.lock()).await?;
            self.handle_head(head).await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() || err == HeadTrackerError::Cancelled => Err(err),
            Err(err) => {
                warn!(
                    target: "headtracker::tracker",
                    %err,
                    "Failed to process new head, retrying on next head"
                );
                Ok(())
            }
        }
    }

    async fn handle_head(&self, head: C::Head) -> Result<(), HeadTrackerError> {
        let chain_id = self.client.configured_chain_id();
        let head_number = head.block_number();

        let current_block_number = match self.storage.latest_block()? {
            Some(saved) => {
                let saved_number = saved.head.block_number();
                if head_number <= saved_number {
                    if head_number.saturating_add(self.config.finality_depth) < saved_number {
                        self.metrics.record_very_old_head(chain_id);
                        warn!(
                            target: "headtracker::tracker",
                            block_number = head_number,
                            latest_saved = saved_number,
                            "Received very old head"
                        );
                    } else {
                        debug!(
                            target: "headtracker::tracker",
                            block_number = head_number,
                            block_hash = %head.block_hash(),
                            latest_saved = saved_number,
                            "Head is not ahead of the latest saved block"
                        );
                    }
                    return Ok(());
                }
                saved_number + 1
            }
            None => {
                let finalized = self.finalized_block_number(&head).await?;
                if finalized == 0 {
                    info!(
                        target: "headtracker::tracker",
                        block_number = head_number,
                        finality_depth = self.config.finality_depth,
                        "Chain too short to start from a finalized block, waiting"
                    );
                    return Ok(());
                }
                info!(
                    target: "headtracker::tracker",
                    block_number = head_number,
                    start = finalized,
                    "No saved blocks, starting from the finalized block"
                );
                return self.save_heads(finalized, head, Some(finalized)).await;
            }
        };

        self.save_heads(current_block_number, head, None).await
    }

    /// Saves every block from `current_block_number` up to `latest`, resolving reorgs on the
    /// way, and notifies the broadcaster once `latest` is saved.
    ///
    /// Waits for any round in progress. On failure nothing past the last saved block is
    /// assumed, so the next call re-derives the resumption point from storage.
    pub async fn retrieve_and_save_heads(
        &self,
        current_block_number: u64,
        latest: C::Head,
        latest_finalized_block_number: Option<u64>,
    ) -> Result<(), HeadTrackerError> {
        let _round = self.cancellable(self.round.lock()).await?;
        self.save_heads(current_block_number, latest, latest_finalized_block_number).await
    }

    async fn save_heads(
        &self,
        current_block_number: u64,
        latest: C::Head,
        latest_finalized_block_number: Option<u64>,
    ) -> Result<(), HeadTrackerError> {
        let finalized = match latest_finalized_block_number {
            Some(number) => number,
            None => self.finalized_block_number(&latest).await?,
        };
        let latest_number = latest.block_number();

        if current_block_number > latest_number {
            trace!(
                target: "headtracker::tracker",
                current_block_number,
                latest_number,
                "No new blocks"
            );
            return Ok(());
        }

        let supplied = (current_block_number == latest_number).then(|| latest.clone());
        let mut current =
            self.get_current_block_maybe_handle_reorg(current_block_number, supplied).await?;

        let last_safe_backfill_block = finalized.min(latest_number).checked_sub(1);
        if let Some(last_safe) =
            last_safe_backfill_block.filter(|last| *last >= current.block_number())
        {
            let from = current.block_number();
            let blocks = self.cancellable(self.backfiller.backfill(from, last_safe)).await??;
            self.metrics.record_backfill(self.client.configured_chain_id(), blocks);
            info!(
                target: "headtracker::tracker",
                from,
                to = last_safe,
                "Backfilled finalized blocks"
            );

            let next = last_safe + 1;
            let supplied = (next == latest_number).then(|| latest.clone());
            current = self.get_current_block_maybe_handle_reorg(next, supplied).await?;
        }

        let filter = self.filters.merged();
        loop {
            let block_number = current.block_number();
            let block_hash = current.block_hash();
            let logs = match &filter {
                Some(filter) => {
                    let request = self.log_provider.logs_by_block_hash(block_hash, filter);
                    self.cancellable(request).await??
                }
                None => Vec::new(),
            };
            self.storage.store_block_logs(SavedBlock::new(current, finalized), logs)?;
            debug!(target: "headtracker::tracker", block_number, %block_hash, "Saved block");

            let next = block_number + 1;
            if next > latest_number {
                break;
            }
            current = self.get_current_block_maybe_handle_reorg(next, None).await?;
        }

        if self.finality_violated.swap(false, Ordering::AcqRel) {
            info!(target: "headtracker::tracker", "Finality no longer violated");
        }
        if self.broadcast_buffer.deliver(latest) {
            debug!(target: "headtracker::tracker", "Broadcast buffer full, dropped oldest head");
        }
        Ok(())
    }

    /// Returns the block at `block_number`, resolving a reorg if its parent does not match the
    /// saved history.
    ///
    /// After a reorg the returned block is the first block after the lowest common ancestor,
    /// and every saved block from its height upwards has been deleted.
    async fn get_current_block_maybe_handle_reorg(
        &self,
        block_number: u64,
        supplied: Option<C::Head>,
    ) -> Result<C::Head, HeadTrackerError> {
        let current = match supplied {
            Some(head) => head,
            None => self.head_by_number(block_number).await?,
        };

        let expected_parent = match block_number.checked_sub(1) {
            Some(parent_number) => self.storage.block_by_number(parent_number)?,
            None => None,
        };
        let Some(expected_parent) = expected_parent else {
            debug!(
                target: "headtracker::tracker",
                block_number,
                "No saved parent, accepting block"
            );
            return Ok(current);
        };

        if current.parent_hash() == expected_parent.head.block_hash() {
            return Ok(current);
        }

        warn!(
            target: "headtracker::tracker",
            block_number,
            expected_parent = %expected_parent.head.block_hash(),
            actual_parent = %current.parent_hash(),
            "Reorg detected"
        );

        let block_after_lca =
            self.find_block_after_lca(&current, expected_parent.finalized_block_number).await?;
        let resume_from = block_after_lca.block_number();

        self.storage.delete_from(resume_from).inspect_err(|err| {
            error!(
                target: "headtracker::tracker",
                resume_from,
                %err,
                "Failed to delete stale blocks"
            );
        })?;

        let depth = block_number.saturating_sub(resume_from);
        self.metrics.record_reorg(self.client.configured_chain_id(), depth);
        info!(
            target: "headtracker::tracker",
            lca = resume_from.saturating_sub(1),
            resume_from,
            block_hash = %block_after_lca.block_hash(),
            "Resolved reorg, resuming after common ancestor"
        );
        Ok(block_after_lca)
    }

    /// Walks back from `current` through the client's chain until a parent matches the saved
    /// history, and returns the block just above that common ancestor.
    ///
    /// Fails with [`HeadTrackerError::FinalityViolated`] if the walk reaches below
    /// `finalized_block_number`.
    async fn find_block_after_lca(
        &self,
        current: &C::Head,
        finalized_block_number: u64,
    ) -> Result<C::Head, HeadTrackerError> {
        let mut block_after_lca = current.clone();
        let mut parent = self.parent_of(current).await?;

        while parent.block_number() >= finalized_block_number {
            let saved = self
                .storage
                .block_by_number(parent.block_number())?
                .ok_or(HeadTrackerError::BlockNotFound(BlockId::number(parent.block_number())))?;
            if saved.head.block_hash() == parent.block_hash() {
                return Ok(block_after_lca);
            }

            trace!(
                target: "headtracker::tracker",
                block_number = parent.block_number(),
                "Saved block not canonical, walking back"
            );
            let next = self.parent_of(&parent).await?;
            block_after_lca = parent;
            parent = next;
        }

        let err = HeadTrackerError::FinalityViolated {
            block_number: current.block_number(),
            finalized_block_number,
        };
        error!(
            target: "headtracker::tracker",
            block_number = current.block_number(),
            finalized_block_number,
            "Reorg greater than finality depth detected, manual intervention required"
        );
        self.finality_violated.store(true, Ordering::Release);
        self.metrics.record_finality_violation(self.client.configured_chain_id());
        self.errors.append(err.clone());
        Err(err)
    }

    /// Deletes every saved block from `from_block` upwards and re-derives the chain from there.
    ///
    /// Waits for any round in progress. `from_block` must lie within `1..=latest_saved + 1` and
    /// must not be ahead of the client's latest block.
    pub async fn replay(&self, from_block: u64) -> Result<(), HeadTrackerError> {
        let _round = self.cancellable(self.round.lock()).await?;

        let latest_saved = self.storage.latest_block()?.map(|block| block.head.block_number());
        if from_block == 0 || latest_saved.is_none_or(|saved| from_block > saved + 1) {
            return Err(HeadTrackerError::InvalidReplay { from_block, latest_saved });
        }

        let (head, finalized) = self.latest_and_finalized_block().await?;
        if from_block > head.block_number() {
            return Err(HeadTrackerError::ReplayAheadOfChain {
                from_block,
                latest: head.block_number(),
            });
        }

        info!(target: "headtracker::tracker", from_block, ?latest_saved, "Replaying blocks");
        self.storage.delete_from(from_block)?;
        self.save_heads(from_block, head, Some(finalized)).await
    }

    /// Fetches the logs of finalized blocks again, continuing where the previous backup poll
    /// ended.
    ///
    /// The first poll starts `backup_poll_block_delay` blocks below the latest saved block, or
    /// just below the finalized block recorded with it if that is lower.
    pub async fn backup_poll(&self) -> Result<(), HeadTrackerError> {
        let mut next = self.backup_next_block.load(Ordering::Acquire);
        if next == 0 {
            let Some(saved) = self.storage.latest_block()? else {
                warn!(
                    target: "headtracker::tracker",
                    "Backup poll ran before the first saved block, skipping"
                );
                return Ok(());
            };
            let behind =
                saved.head.block_number().saturating_sub(self.config.backup_poll_block_delay);
            next = saved.finalized_block_number.saturating_sub(1).min(behind);
            self.backup_next_block.store(next, Ordering::Release);
        }

        let (_, finalized) = self.latest_and_finalized_block().await?;
        let Some(last_safe) = finalized.checked_sub(1).filter(|last| *last >= next) else {
            trace!(target: "headtracker::tracker", next, finalized, "Nothing to backup poll");
            return Ok(());
        };

        info!(target: "headtracker::tracker", from = next, to = last_safe, "Backup poll started");
        let blocks = self.cancellable(self.backfiller.backfill(next, last_safe)).await??;
        self.metrics.record_backfill(self.client.configured_chain_id(), blocks);
        self.backup_next_block.store(last_safe + 1, Ordering::Release);
        info!(target: "headtracker::tracker", from = next, to = last_safe, "Backup poll finished");
        Ok(())
    }

    /// Runs [`Self::backup_poll`] every `backup_poll_interval` until cancelled.
    pub async fn run_backup_poller(&self) {
        if !self.config.backup_poll_enabled() {
            debug!(target: "headtracker::tracker", "Backup poller disabled");
            return;
        }

        let period = self.config.backup_poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => match self.backup_poll().await {
                    Ok(()) | Err(HeadTrackerError::Cancelled) => {}
                    Err(err) => warn!(target: "headtracker::tracker", %err, "Backup poll failed"),
                },
            }
        }
        debug!(target: "headtracker::tracker", "Backup poller stopped");
    }

    /// Forwards processed heads to the broadcaster until cancelled.
    ///
    /// With a zero sampling interval every buffered head is forwarded as soon as it is
    /// processed; otherwise only the latest head is forwarded once per interval.
    pub async fn run_broadcast_loop(&self) {
        if self.config.sampling_interval.is_zero() {
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = self.broadcast_buffer.notified() => {
                        while let Some(head) = self.broadcast_buffer.retrieve() {
                            self.broadcaster.broadcast_new_longest_chain(head);
                        }
                    }
                }
            }
        } else {
            let mut ticker = interval(self.config.sampling_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(head) = self.broadcast_buffer.retrieve_latest_and_clear() {
                            self.broadcaster.broadcast_new_longest_chain(head);
                        }
                    }
                }
            }
        }
        debug!(target: "headtracker::tracker", "Broadcast loop stopped");
    }

    async fn finalized_block_number(&self, latest: &C::Head) -> Result<u64, HeadTrackerError> {
        if !self.config.finality_tag_enabled {
            return Ok(latest.block_number().saturating_sub(self.config.finality_depth));
        }
        let finalized = self
            .cancellable(self.client.latest_finalized_block())
            .await??
            .ok_or(HeadTrackerError::BlockNotFound(BlockId::finalized()))?;
        Ok(finalized.block_number())
    }

    async fn head_by_number(&self, block_number: u64) -> Result<C::Head, HeadTrackerError> {
        let head = self
            .cancellable(self.client.head_by_number(Some(block_number)))
            .await??
            .ok_or(HeadTrackerError::BlockNotFound(BlockId::number(block_number)))?;
        if head.block_number() != block_number {
            return Err(HeadTrackerError::BlockNumberMismatch {
                requested: block_number,
                received: head.block_number(),
            });
        }
        Ok(head)
    }

    async fn head_by_hash(&self, block_hash: B256) -> Result<C::Head, HeadTrackerError> {
        self.cancellable(self.client.head_by_hash(block_hash))
            .await??
            .ok_or(HeadTrackerError::BlockNotFound(BlockId::hash(block_hash)))
    }

    /// Fetches the parent of `child`, which must sit exactly one height below it.
    async fn parent_of(&self, child: &C::Head) -> Result<C::Head, HeadTrackerError> {
        let parent = self.head_by_hash(child.parent_hash()).await?;
        if parent.block_number().checked_add(1) != Some(child.block_number()) {
            return Err(HeadTrackerError::BlockNumberMismatch {
                requested: child.block_number().saturating_sub(1),
                received: parent.block_number(),
            });
        }
        Ok(parent)
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, HeadTrackerError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HeadTrackerError::Cancelled),
            output = fut => Ok(output),
        }
    }
}

#[async_trait]
impl<C, S, L> NewHeadHandler<C::Head> for HeadTracker<C, S, L>
where
    C: ChainClient,
    S: HeadStorage<Head = C::Head> + Send + Sync + 'static,
    L: LogProvider,
{
    async fn handle_new_head(&self, head: C::Head) -> Result<(), HeadTrackerError> {
        self.process_new_head(head).await
    }
}
