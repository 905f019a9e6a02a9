//! Bounded hand-off between producer and consumer tasks.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Notify;

/// A bounded queue that never blocks the producer.
///
/// Delivering into a full mailbox drops the oldest item, so a mailbox of capacity one always
/// holds the most recent item only. Consumers wait on [`Mailbox::notified`] and then drain
/// with [`Mailbox::retrieve`] or [`Mailbox::retrieve_latest_and_clear`]. A delivery made
/// while no consumer is waiting is remembered, so the next wait returns immediately.
#[derive(Debug)]
pub struct Mailbox<T> {
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Mailbox<T> {
    /// Creates an empty mailbox holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Returns the maximum number of items held.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deposits an item and wakes the consumer.
    ///
    /// Returns `true` if the mailbox was full and its oldest item was dropped.
    pub fn deliver(&self, item: T) -> bool {
        let dropped = {
            let mut queue = self.lock();
            let dropped = queue.len() >= self.capacity;
            if dropped {
                queue.pop_front();
            }
            queue.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Removes and returns the oldest item.
    pub fn retrieve(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Returns the newest item and discards everything else.
    pub fn retrieve_latest_and_clear(&self) -> Option<T> {
        let mut queue = self.lock();
        let latest = queue.pop_back();
        queue.clear();
        latest
    }

    /// Returns the number of items waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no item is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until an item is delivered.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_single_slot_replaces() {
        let mailbox = Mailbox::new(1);
        assert!(!mailbox.deliver(1));
        assert!(mailbox.deliver(2));

        assert_eq!(mailbox.len(), 1);
        assert_eq!(mailbox.retrieve(), Some(2));
        assert_eq!(mailbox.retrieve(), None);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mailbox = Mailbox::new(0);
        assert_eq!(mailbox.capacity(), 1);
        mailbox.deliver("a");
        assert_eq!(mailbox.retrieve(), Some("a"));
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let mailbox = Mailbox::new(3);
        for item in 1..=5 {
            mailbox.deliver(item);
        }

        assert_eq!(mailbox.retrieve(), Some(3));
        assert_eq!(mailbox.retrieve(), Some(4));
        assert_eq!(mailbox.retrieve(), Some(5));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_retrieve_latest_and_clear() {
        let mailbox = Mailbox::new(3);
        mailbox.deliver(1);
        mailbox.deliver(2);

        assert_eq!(mailbox.retrieve_latest_and_clear(), Some(2));
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.retrieve_latest_and_clear(), None);
    }

    #[tokio::test]
    async fn test_delivery_before_wait_is_not_lost() {
        let mailbox = Mailbox::new(1);
        mailbox.deliver(7);

        tokio::time::timeout(Duration::from_secs(1), mailbox.notified())
            .await
            .expect("notification should be pending");
        assert_eq!(mailbox.retrieve(), Some(7));
    }
}
