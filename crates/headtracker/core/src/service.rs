//! Contains the [`HeadTrackerService`], wiring the listener, tracker and broadcaster together.

use crate::{
    ChainClient, ConfigError, HeadBroadcaster, HeadListener, HeadTracker, HeadTrackerConfig,
    HeadTrackerError, HeadTrackerMetrics, HealthReport, LogProvider,
};
use kona_headtracker_storage::HeadStorage;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs the head tracking pipeline for a single chain.
///
/// Heads flow from the [`HeadListener`] through the [`HeadTracker`], which keeps the saved
/// history canonical, into the [`HeadBroadcaster`], which notifies subscribers of the new
/// longest chain. The tracker's backup poller runs alongside when enabled.
#[derive(Debug)]
pub struct HeadTrackerService<C, S, L>
where
    C: ChainClient,
{
    listener: HeadListener<C>,
    tracker: Arc<HeadTracker<C, S, L>>,
    broadcaster: Arc<HeadBroadcaster<C::Head>>,
    cancel: CancellationToken,
}

impl<C, S, L> HeadTrackerService<C, S, L>
where
    C: ChainClient,
    S: HeadStorage<Head = C::Head> + Send + Sync + 'static,
    L: LogProvider,
{
    /// Builds the pipeline after validating `config`.
    pub fn new(
        client: Arc<C>,
        storage: Arc<S>,
        log_provider: Arc<L>,
        config: HeadTrackerConfig,
        metrics: Arc<dyn HeadTrackerMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let broadcaster = Arc::new(HeadBroadcaster::new(config.callback_timeout));
        let listener = HeadListener::new(Arc::clone(&client), &config, Arc::clone(&metrics));
        let tracker = Arc::new(HeadTracker::new(
            client,
            storage,
            log_provider,
            Arc::clone(&broadcaster),
            config,
            metrics,
            cancel.clone(),
        ));
        Ok(Self { listener, tracker, broadcaster, cancel })
    }

    /// Returns the broadcaster to subscribe to new longest chains.
    pub const fn broadcaster(&self) -> &Arc<HeadBroadcaster<C::Head>> {
        &self.broadcaster
    }

    /// Returns the tracker.
    pub const fn tracker(&self) -> &Arc<HeadTracker<C, S, L>> {
        &self.tracker
    }

    /// Returns the health of every component.
    pub fn health_report(&self) -> HealthReport {
        let mut report = self.listener.health_report();
        report.extend(self.tracker.health_report());
        report.extend(self.broadcaster.health_report());
        report
    }

    /// Runs the pipeline until the cancellation token fires or a fatal error occurs.
    ///
    /// On return the token is cancelled and every background task has stopped.
    pub async fn start(&self) -> Result<(), HeadTrackerError> {
        let mut tasks = JoinSet::new();

        let broadcaster = Arc::clone(&self.broadcaster);
        let cancel = self.cancel.clone();
        tasks.spawn(async move { broadcaster.run(cancel).await });

        let tracker = Arc::clone(&self.tracker);
        tasks.spawn(async move { tracker.run_broadcast_loop().await });

        let tracker = Arc::clone(&self.tracker);
        tasks.spawn(async move { tracker.run_backup_poller().await });

        info!(target: "headtracker", "Starting head tracker");
        let result =
            self.listener.listen_for_new_heads(self.tracker.as_ref(), self.cancel.clone()).await;
        if let Err(err) = &result {
            error!(target: "headtracker", %err, "Head tracker stopped with error");
        }

        self.cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(target: "headtracker", %err, "Head tracker task failed");
            }
        }
        info!(target: "headtracker", "Head tracker stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        HeadTrackable,
        test_utils::{RecordingMetrics, TestChainClient, TestLogProvider},
    };
    use async_trait::async_trait;
    use kona_headtracker_storage::{HeadStorageReader, InMemoryHeadSaver};
    use kona_headtracker_types::BlockHead;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const CHAIN_ID: u64 = 1;

    #[derive(Debug)]
    struct ChannelSubscriber(mpsc::UnboundedSender<BlockHead>);

    #[async_trait]
    impl HeadTrackable<BlockHead> for ChannelSubscriber {
        async fn on_new_longest_chain(&self, head: BlockHead) {
            let _ = self.0.send(head);
        }
    }

    type Service =
        HeadTrackerService<TestChainClient, InMemoryHeadSaver<BlockHead>, TestLogProvider>;

    fn service(
        client: &Arc<TestChainClient>,
        storage: &Arc<InMemoryHeadSaver<BlockHead>>,
        config: HeadTrackerConfig,
        cancel: &CancellationToken,
    ) -> Result<Service, ConfigError> {
        HeadTrackerService::new(
            Arc::clone(client),
            Arc::clone(storage),
            Arc::new(TestLogProvider::new(Arc::clone(client))),
            config,
            Arc::new(RecordingMetrics::default()),
            cancel.clone(),
        )
    }

    #[test]
    fn test_rejects_invalid_config() {
        let client = Arc::new(TestChainClient::new(CHAIN_ID, 10));
        let storage = Arc::new(InMemoryHeadSaver::new(10));
        let config =
            HeadTrackerConfig { history_depth: 10, finality_depth: 10, ..Default::default() };

        assert_eq!(
            service(&client, &storage, config, &CancellationToken::new()).unwrap_err(),
            ConfigError::HistoryTooShallow { history_depth: 10, finality_depth: 10 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracks_and_broadcasts_new_heads() {
        let client = Arc::new(TestChainClient::new(CHAIN_ID, 30));
        let storage = Arc::new(InMemoryHeadSaver::new(100));
        let cancel = CancellationToken::new();
        let config = HeadTrackerConfig {
            finality_depth: 10,
            sampling_interval: Duration::ZERO,
            ..Default::default()
        };
        let service = Arc::new(service(&client, &storage, config, &cancel).unwrap());
        service.tracker().filters().register("test", TestLogProvider::filter()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (latest, _unsubscribe) =
            service.broadcaster().subscribe(Arc::new(ChannelSubscriber(tx)));
        assert_eq!(latest, None);

        let running = Arc::clone(&service);
        let handle = tokio::spawn(async move { running.start().await });
        while client.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let tip = client.emit_tip();
        assert_eq!(rx.recv().await, Some(tip));
        assert_eq!(storage.latest_block().unwrap().map(|block| block.head), Some(tip));
        assert_eq!(
            storage.logs_by_block_hash(tip.hash).unwrap(),
            vec![TestLogProvider::log_for(&tip)]
        );

        client.reorg(29, 3);
        let tip = client.emit_tip();
        assert_eq!(rx.recv().await, Some(tip));
        assert_eq!(storage.block_by_number(29).unwrap().map(|block| block.head), client.block(29));

        let report = service.health_report();
        assert_eq!(report.len(), 3);
        assert!(report.values().all(Result::is_ok));

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(service.broadcaster().subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_fatal_error() {
        let client = Arc::new(TestChainClient::new(CHAIN_ID, 30));
        let storage = Arc::new(InMemoryHeadSaver::new(100));
        let cancel = CancellationToken::new();
        let service = service(&client, &storage, HeadTrackerConfig::default(), &cancel).unwrap();

        let emitter = Arc::clone(&client);
        tokio::spawn(async move {
            while emitter.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            emitter.emit(Ok(BlockHead { chain_id: 5, ..emitter.tip() }));
        });

        assert_eq!(
            service.start().await,
            Err(HeadTrackerError::ChainIdMismatch { expected: CHAIN_ID, received: 5 })
        );
        assert!(cancel.is_cancelled());
    }
}
