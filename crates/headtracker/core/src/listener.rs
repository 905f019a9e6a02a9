//! Subscription to new heads.

use crate::{
    ChainClient, ClientError, HeadStream, HeadTrackerConfig, HeadTrackerError, HeadTrackerMetrics,
    HealthError, HealthReport,
};
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::StreamExt;
use kona_headtracker_types::ChainHead;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives every head delivered by a [`HeadListener`].
#[async_trait]
pub trait NewHeadHandler<H>: Send + Sync {
    /// Processes a newly observed head.
    ///
    /// Returning [`HeadTrackerError::Cancelled`] stops the listener cleanly; any other error
    /// stops it with that error.
    async fn handle_new_head(&self, head: H) -> Result<(), HeadTrackerError>;
}

#[derive(Debug)]
enum SubscriptionEnd {
    Resubscribe,
    Stopped,
}

/// Keeps a single subscription to new heads alive and forwards every head to a handler.
#[derive(Debug)]
pub struct HeadListener<C> {
    client: Arc<C>,
    idle_threshold: Duration,
    redial_backoff_min: Duration,
    redial_backoff_max: Duration,
    metrics: Arc<dyn HeadTrackerMetrics>,
    connected: AtomicBool,
    receiving_heads: AtomicBool,
}

impl<C: ChainClient> HeadListener<C> {
    /// Component name used in health reports.
    pub const NAME: &'static str = "HeadListener";

    /// Creates a listener for the given client.
    pub fn new(
        client: Arc<C>,
        config: &HeadTrackerConfig,
        metrics: Arc<dyn HeadTrackerMetrics>,
    ) -> Self {
        Self {
            client,
            idle_threshold: config.block_emission_idle_warning_threshold,
            redial_backoff_min: config.redial_backoff_min,
            redial_backoff_max: config.redial_backoff_max,
            metrics,
            connected: AtomicBool::new(false),
            receiving_heads: AtomicBool::new(false),
        }
    }

    /// Returns `true` while a subscription is active.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Returns `false` once no head arrived within the idle threshold, until the next head.
    pub fn receiving_heads(&self) -> bool {
        self.receiving_heads.load(Ordering::Acquire)
    }

    /// Reports the listener unhealthy when disconnected or not receiving heads.
    pub fn health_report(&self) -> HealthReport {
        let status = if !self.connected() {
            Err(HealthError::NotConnected)
        } else if !self.receiving_heads() {
            Err(HealthError::NotReceivingHeads)
        } else {
            Ok(())
        };
        HealthReport::from([(Self::NAME.to_string(), status)])
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.redial_backoff_min)
            .with_max_delay(self.redial_backoff_max)
            .without_max_times()
            .build()
    }

    /// Subscribes to new heads and hands each one to `handler` until `cancel` fires.
    ///
    /// Failed or dropped subscriptions are re-established after a backoff delay. The loop ends
    /// with an error when the handler fails or a head from another chain is received.
    pub async fn listen_for_new_heads<F>(
        &self,
        handler: &F,
        cancel: CancellationToken,
    ) -> Result<(), HeadTrackerError>
    where
        F: NewHeadHandler<C::Head> + ?Sized,
    {
        let chain_id = self.client.configured_chain_id();
        let mut backoff = self.backoff();
        let mut redial = false;

        loop {
            if redial {
                let delay = backoff.next().unwrap_or(self.redial_backoff_max);
                debug!(target: "headtracker::listener", ?delay, "Waiting before resubscribing");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = sleep(delay) => {}
                }
            }
            redial = true;

            let subscription = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                subscription = self.client.subscribe_new_heads() => subscription,
            };
            let stream = match subscription {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(
                        target: "headtracker::listener",
                        chain_id,
                        %err,
                        "Failed to subscribe to new heads"
                    );
                    self.metrics.record_connection_error(chain_id);
                    continue;
                }
            };

            info!(target: "headtracker::listener", chain_id, "Subscribed to new heads");
            self.connected.store(true, Ordering::Release);
            backoff = self.backoff();

            let end = self.receive_heads(stream, handler, &cancel).await;
            self.connected.store(false, Ordering::Release);

            match end? {
                SubscriptionEnd::Resubscribe => continue,
                SubscriptionEnd::Stopped => {
                    info!(target: "headtracker::listener", chain_id, "Head listener stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn receive_heads<F>(
        &self,
        mut stream: HeadStream<C::Head>,
        handler: &F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionEnd, HeadTrackerError>
    where
        F: NewHeadHandler<C::Head> + ?Sized,
    {
        let chain_id = self.client.configured_chain_id();
        let idle_enabled = !self.idle_threshold.is_zero();
        let mut idle_armed = idle_enabled;
        let idle = sleep(self.idle_threshold);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SubscriptionEnd::Stopped),
                _ = &mut idle, if idle_armed => {
                    idle_armed = false;
                    self.receiving_heads.store(false, Ordering::Release);
                    warn!(
                        target: "headtracker::listener",
                        chain_id,
                        threshold = ?self.idle_threshold,
                        "Have not received a head within the idle threshold, the node may be stuck"
                    );
                }
                item = stream.next() => match item {
                    Some(Ok(head)) => {
                        self.receiving_heads.store(true, Ordering::Release);
                        if idle_enabled {
                            idle.as_mut().reset(Instant::now() + self.idle_threshold);
                            idle_armed = true;
                        }

                        if head.chain_id() != chain_id {
                            error!(
                                target: "headtracker::listener",
                                expected = chain_id,
                                received = head.chain_id(),
                                block_number = head.block_number(),
                                "Received head from unexpected chain"
                            );
                            return Err(HeadTrackerError::ChainIdMismatch {
                                expected: chain_id,
                                received: head.chain_id(),
                            });
                        }

                        self.metrics.record_head_received(chain_id);
                        debug!(
                            target: "headtracker::listener",
                            block_number = head.block_number(),
                            block_hash = %head.block_hash(),
                            "Received new head"
                        );

                        match handler.handle_new_head(head).await {
                            Ok(()) => {}
                            Err(HeadTrackerError::Cancelled) => return Ok(SubscriptionEnd::Stopped),
                            Err(err) => {
                                error!(
                                    target: "headtracker::listener",
                                    %err,
                                    "Failed to handle new head"
                                );
                                return Err(err);
                            }
                        }
                    }
                    Some(Err(ClientError::InvalidHead(reason))) => {
                        warn!(
                            target: "headtracker::listener",
                            chain_id,
                            %reason,
                            "Skipping invalid head"
                        );
                    }
                    Some(Err(err)) => {
                        warn!(
                            target: "headtracker::listener",
                            chain_id,
                            %err,
                            "Head subscription failed"
                        );
                        self.metrics.record_connection_error(chain_id);
                        return Ok(SubscriptionEnd::Resubscribe);
                    }
                    None => {
                        warn!(
                            target: "headtracker::listener",
                            chain_id,
                            "Head subscription closed"
                        );
                        return Ok(SubscriptionEnd::Resubscribe);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingMetrics, TestChainClient};
    use kona_headtracker_storage::StorageError;
    use kona_headtracker_types::BlockHead;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    const CHAIN_ID: u64 = 1;

    #[derive(Debug, Default)]
    struct RecordingHandler {
        heads: Mutex<Vec<BlockHead>>,
        error: Option<HeadTrackerError>,
    }

    impl RecordingHandler {
        fn heads(&self) -> Vec<BlockHead> {
            self.heads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NewHeadHandler<BlockHead> for RecordingHandler {
        async fn handle_new_head(&self, head: BlockHead) -> Result<(), HeadTrackerError> {
            self.heads.lock().unwrap().push(head);
            self.error.clone().map_or(Ok(()), Err)
        }
    }

    struct Harness {
        client: Arc<TestChainClient>,
        metrics: Arc<RecordingMetrics>,
        listener: Arc<HeadListener<TestChainClient>>,
        handler: Arc<RecordingHandler>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new(config: HeadTrackerConfig, handler: RecordingHandler) -> Self {
            let client = Arc::new(TestChainClient::new(CHAIN_ID, 10));
            let metrics = Arc::new(RecordingMetrics::default());
            let listener = Arc::new(HeadListener::new(
                Arc::clone(&client),
                &config,
                Arc::clone(&metrics) as Arc<dyn HeadTrackerMetrics>,
            ));
            Self {
                client,
                metrics,
                listener,
                handler: Arc::new(handler),
                cancel: CancellationToken::new(),
            }
        }

        fn spawn(&self) -> JoinHandle<Result<(), HeadTrackerError>> {
            let listener = Arc::clone(&self.listener);
            let handler = Arc::clone(&self.handler);
            let cancel = self.cancel.clone();
            tokio::spawn(
                async move { listener.listen_for_new_heads(handler.as_ref(), cancel).await },
            )
        }

        async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
            for _ in 0..1000 {
                if condition(self) {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
            panic!("condition not reached");
        }

        async fn wait_subscribed(&self) {
            self.wait_until(|h| h.client.subscriber_count() == 1 && h.listener.connected()).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_heads_to_handler() {
        let harness = Harness::new(HeadTrackerConfig::default(), RecordingHandler::default());
        assert_eq!(
            harness.listener.health_report().get(HeadListener::<TestChainClient>::NAME),
            Some(&Err(HealthError::NotConnected))
        );

        let handle = harness.spawn();
        harness.wait_subscribed().await;

        let tip = harness.client.emit_tip();
        harness.wait_until(|h| h.handler.heads().len() == 1).await;
        assert_eq!(harness.handler.heads(), vec![tip]);
        assert_eq!(harness.metrics.heads_received.load(Ordering::SeqCst), 1);
        assert!(harness.listener.receiving_heads());
        assert_eq!(
            harness.listener.health_report().get(HeadListener::<TestChainClient>::NAME),
            Some(&Ok(()))
        );

        harness.cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert!(!harness.listener.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_failures() {
        let harness = Harness::new(HeadTrackerConfig::default(), RecordingHandler::default());
        harness.client.fail_next_subscriptions(2);

        let handle = harness.spawn();
        harness.wait_until(|h| h.client.subscribe_calls() == 1).await;
        assert!(!harness.listener.connected());
        assert_eq!(
            harness.listener.health_report().get(HeadListener::<TestChainClient>::NAME),
            Some(&Err(HealthError::NotConnected))
        );

        harness.wait_until(|h| h.client.subscribe_calls() == 2).await;
        assert!(!harness.listener.connected());
        assert_eq!(harness.metrics.connection_errors.load(Ordering::SeqCst), 2);

        harness.wait_subscribed().await;
        assert_eq!(harness.client.subscribe_calls(), 3);
        let tip = harness.client.emit_tip();
        harness.wait_until(|h| h.handler.heads().len() == 1).await;
        assert_eq!(harness.handler.heads(), vec![tip]);

        harness.cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_when_subscription_ends() {
        let harness = Harness::new(HeadTrackerConfig::default(), RecordingHandler::default());
        let handle = harness.spawn();
        harness.wait_subscribed().await;

        harness.client.drop_subscriptions();
        harness.wait_until(|h| !h.listener.connected()).await;
        assert_eq!(harness.client.subscribe_calls(), 1);
        harness.wait_until(|h| h.client.subscribe_calls() == 2).await;
        harness.wait_subscribed().await;
        let first = harness.client.emit_tip();
        harness.wait_until(|h| h.handler.heads().len() == 1).await;

        harness.client.emit(Err(ClientError::Transport("connection reset".to_string())));
        harness.wait_until(|h| !h.listener.connected()).await;
        harness.wait_until(|h| h.client.subscribe_calls() == 3).await;
        assert_eq!(harness.metrics.connection_errors.load(Ordering::SeqCst), 1);
        harness.wait_subscribed().await;
        harness.client.extend(1);
        let second = harness.client.emit_tip();
        harness.wait_until(|h| h.handler.heads().len() == 2).await;

        assert_eq!(harness.handler.heads(), vec![first, second]);

        harness.cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_invalid_heads() {
        let harness = Harness::new(HeadTrackerConfig::default(), RecordingHandler::default());
        let handle = harness.spawn();
        harness.wait_subscribed().await;

        harness.client.emit(Err(ClientError::InvalidHead("missing hash".to_string())));
        let tip = harness.client.emit_tip();
        harness.wait_until(|h| h.handler.heads().len() == 1).await;

        assert_eq!(harness.handler.heads(), vec![tip]);
        assert_eq!(harness.client.subscribe_calls(), 1);

        harness.cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_id_mismatch_is_fatal() {
        let harness = Harness::new(HeadTrackerConfig::default(), RecordingHandler::default());
        let handle = harness.spawn();
        harness.wait_subscribed().await;

        let foreign = BlockHead { chain_id: 2, ..harness.client.tip() };
        harness.client.emit(Ok(foreign));

        assert_eq!(
            handle.await.unwrap(),
            Err(HeadTrackerError::ChainIdMismatch { expected: CHAIN_ID, received: 2 })
        );
        assert!(harness.handler.heads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_stops_listener() {
        let handler = RecordingHandler {
            error: Some(HeadTrackerError::Storage(StorageError::LockPoisoned)),
            ..Default::default()
        };
        let harness = Harness::new(HeadTrackerConfig::default(), handler);
        let handle = harness.spawn();
        harness.wait_subscribed().await;

        harness.client.emit_tip();

        assert_eq!(
            handle.await.unwrap(),
            Err(HeadTrackerError::Storage(StorageError::LockPoisoned))
        );
        assert!(!harness.listener.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_cancellation_stops_listener() {
        let handler =
            RecordingHandler { error: Some(HeadTrackerError::Cancelled), ..Default::default() };
        let harness = Harness::new(HeadTrackerConfig::default(), handler);
        let handle = harness.spawn();
        harness.wait_subscribed().await;

        harness.client.emit_tip();

        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_threshold() {
        let config = HeadTrackerConfig {
            block_emission_idle_warning_threshold: Duration::from_secs(5),
            ..Default::default()
        };
        let harness = Harness::new(config, RecordingHandler::default());
        let handle = harness.spawn();
        harness.wait_subscribed().await;

        harness.client.emit_tip();
        harness.wait_until(|h| h.listener.receiving_heads()).await;

        sleep(Duration::from_secs(6)).await;
        assert!(!harness.listener.receiving_heads());
        assert_eq!(
            harness.listener.health_report().get(HeadListener::<TestChainClient>::NAME),
            Some(&Err(HealthError::NotReceivingHeads))
        );

        harness.client.emit_tip();
        harness.wait_until(|h| h.listener.receiving_heads()).await;

        harness.cancel.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
    }
}
