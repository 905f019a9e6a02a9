//! Fan-out of the latest chain head to subscribers.

use crate::{HealthReport, Mailbox};
use async_trait::async_trait;
use kona_headtracker_types::ChainHead;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A consumer of "new longest chain" notifications.
#[async_trait]
pub trait HeadTrackable<H>: Send + Sync + 'static {
    /// Called with the latest head of the longest chain.
    ///
    /// Implementations must not assume every head is observed: intermediate heads are skipped
    /// when dispatch falls behind.
    async fn on_new_longest_chain(&self, head: H);
}

type Callbacks<H> = Arc<Mutex<HashMap<u64, Arc<dyn HeadTrackable<H>>>>>;

fn lock<H>(callbacks: &Callbacks<H>) -> MutexGuard<'_, HashMap<u64, Arc<dyn HeadTrackable<H>>>> {
    callbacks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dispatches the latest head to a dynamic set of subscribers.
///
/// Producers never block: [`HeadBroadcaster::broadcast_new_longest_chain`] deposits the head
/// in a single-slot mailbox, replacing any head not yet dispatched. The dispatch loop started
/// by [`HeadBroadcaster::run`] invokes every subscriber concurrently, each under its own
/// timeout, and waits for the whole round before taking the next head.
pub struct HeadBroadcaster<H> {
    mailbox: Mailbox<H>,
    callbacks: Callbacks<H>,
    next_id: AtomicU64,
    latest: Mutex<Option<H>>,
    callback_timeout: Duration,
}

impl<H: fmt::Debug> fmt::Debug for HeadBroadcaster<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadBroadcaster")
            .field("mailbox", &self.mailbox)
            .field("subscribers", &lock(&self.callbacks).len())
            .field("latest", &self.latest)
            .field("callback_timeout", &self.callback_timeout)
            .finish()
    }
}

/// Deregisters a subscriber from a [`HeadBroadcaster`].
pub struct Unsubscribe<H> {
    id: u64,
    callbacks: Callbacks<H>,
}

impl<H> fmt::Debug for Unsubscribe<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").field("id", &self.id).finish()
    }
}

impl<H> Unsubscribe<H> {
    /// Removes the subscriber. Its callback is not invoked for any later dispatch round.
    pub fn unsubscribe(self) {
        lock(&self.callbacks).remove(&self.id);
    }
}

impl<H: ChainHead> HeadBroadcaster<H> {
    /// Component name used in health reports.
    pub const NAME: &'static str = "HeadBroadcaster";

    /// Creates a broadcaster invoking each callback for at most `callback_timeout` per head.
    pub fn new(callback_timeout: Duration) -> Self {
        Self {
            mailbox: Mailbox::new(1),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            latest: Mutex::new(None),
            callback_timeout,
        }
    }

    /// Queues `head` for dispatch, replacing any head still waiting.
    pub fn broadcast_new_longest_chain(&self, head: H) {
        if self.mailbox.deliver(head) {
            debug!(target: "headtracker::broadcaster", "Replaced undelivered head");
        }
    }

    /// Registers a subscriber.
    ///
    /// Returns the latest dispatched head, if any, so the subscriber learns the chain state
    /// without waiting for the next dispatch, together with a handle to deregister.
    pub fn subscribe(&self, callback: Arc<dyn HeadTrackable<H>>) -> (Option<H>, Unsubscribe<H>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks).insert(id, callback);
        (self.latest(), Unsubscribe { id, callbacks: Arc::clone(&self.callbacks) })
    }

    /// Returns the latest dispatched head.
    pub fn latest(&self) -> Option<H> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Runs the dispatch loop until `cancel` fires, then drops every subscriber.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(target: "headtracker::broadcaster", "Starting head broadcaster");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.mailbox.notified() => {
                    if let Some(head) = self.mailbox.retrieve() {
                        self.execute_callbacks(head).await;
                    }
                }
            }
        }

        lock(&self.callbacks).clear();
        info!(target: "headtracker::broadcaster", "Head broadcaster stopped");
    }

    async fn execute_callbacks(&self, head: H) {
        let callbacks: Vec<_> = lock(&self.callbacks).values().cloned().collect();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(head.clone());

        debug!(
            target: "headtracker::broadcaster",
            block_number = head.block_number(),
            subscribers = callbacks.len(),
            "Dispatching new longest chain"
        );

        let mut round = JoinSet::new();
        for callback in callbacks {
            let head = head.clone();
            let timeout = self.callback_timeout;
            round.spawn(async move {
                let block_number = head.block_number();
                if tokio::time::timeout(timeout, callback.on_new_longest_chain(head)).await.is_err()
                {
                    warn!(
                        target: "headtracker::broadcaster",
                        block_number,
                        ?timeout,
                        "Subscriber timed out handling new head"
                    );
                }
            });
        }

        while let Some(result) = round.join_next().await {
            if let Err(err) = result {
                warn!(
                    target: "headtracker::broadcaster",
                    %err,
                    "Subscriber failed handling new head"
                );
            }
        }
    }

    /// Reports the broadcaster as healthy; dispatch has no failure mode of its own.
    pub fn health_report(&self) -> HealthReport {
        HealthReport::from([(Self::NAME.to_string(), Ok(()))])
    }
}
