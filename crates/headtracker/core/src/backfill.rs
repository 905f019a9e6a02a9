//! Bulk retrieval of logs for finalized history.

use crate::{FilterRegistry, HeadTrackerError, LogProvider, LogProviderError};
use derive_more::Constructor;
use kona_headtracker_storage::HeadStorageWriter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fetches and stores the logs of a block range in batches.
///
/// Finalized blocks need no per-block reorg checks, so their logs are requested range by range.
/// When the node rejects a range as too large the batch size is halved and the range retried.
/// Logs are stored idempotently, so a range may safely be backfilled again after a crash.
#[derive(Debug, Constructor)]
pub struct LogBackfiller<S, L> {
    storage: Arc<S>,
    provider: Arc<L>,
    filters: Arc<FilterRegistry>,
    batch_size: u64,
}

impl<S, L> LogBackfiller<S, L>
where
    S: HeadStorageWriter,
    L: LogProvider,
{
    /// Backfills the logs of every block in `from..=to`.
    ///
    /// Returns the number of blocks covered.
    pub async fn backfill(&self, from: u64, to: u64) -> Result<u64, HeadTrackerError> {
        if from > to {
            return Ok(0);
        }
        let Some(filter) = self.filters.merged() else {
            debug!(target: "headtracker::backfill", from, to, "No filters registered, skipping");
            return Ok(to - from + 1);
        };

        let mut batch_size = self.batch_size.max(1);
        let mut start = from;
        loop {
            let end = start.saturating_add(batch_size - 1).min(to);
            match self.provider.logs_in_range(start, end, &filter).await {
                Ok(logs) => {
                    debug!(
                        target: "headtracker::backfill",
                        from = start,
                        to = end,
                        logs = logs.len(),
                        "Backfilled logs"
                    );
                    self.storage.store_logs(logs)?;
                }
                Err(LogProviderError::LimitExceeded(reason)) if batch_size > 1 => {
                    batch_size /= 2;
                    warn!(
                        target: "headtracker::backfill",
                        from = start,
                        to = end,
                        batch_size,
                        %reason,
                        "Log query too large, retrying with a smaller batch"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            if end == to {
                return Ok(to - from + 1);
            }
            start = end + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockLogProvider;
    use alloy_primitives::{Address, B256};
    use kona_headtracker_storage::{HeadStorageReader, InMemoryHeadSaver};
    use kona_headtracker_types::{BlockHead, Log, LogFilter};
    use mockall::predicate::{always, eq};

    fn filters() -> Arc<FilterRegistry> {
        let filters = FilterRegistry::default();
        let filter = LogFilter::new([Address::with_last_byte(1)], [B256::with_last_byte(1)]);
        filters.register("test", filter).unwrap();
        Arc::new(filters)
    }

    fn log(number: u64) -> Log {
        Log {
            block_hash: B256::with_last_byte(number as u8),
            block_number: number,
            ..Default::default()
        }
    }

    fn logs(from: u64, to: u64) -> Vec<Log> {
        (from..=to).map(log).collect()
    }

    #[tokio::test]
    async fn test_backfill_in_batches() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let mut provider = MockLogProvider::new();
        provider
            .expect_logs_in_range()
            .with(eq(10), eq(13), always())
            .times(1)
            .returning(|f, t, _| Ok(logs(f, t)));
        provider
            .expect_logs_in_range()
            .with(eq(14), eq(17), always())
            .times(1)
            .returning(|f, t, _| Ok(logs(f, t)));
        provider
            .expect_logs_in_range()
            .with(eq(18), eq(19), always())
            .times(1)
            .returning(|f, t, _| Ok(logs(f, t)));

        let backfiller =
            LogBackfiller::new(Arc::clone(&storage), Arc::new(provider), filters(), 4);
        assert_eq!(backfiller.backfill(10, 19).await, Ok(10));
        assert_eq!(storage.logs_in_range(0, 100).unwrap(), logs(10, 19));
    }

    #[tokio::test]
    async fn test_backfill_halves_batch_on_limit() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let mut provider = MockLogProvider::new();
        provider
            .expect_logs_in_range()
            .withf(|from, to, _| to - from + 1 > 2)
            .returning(|_, _, _| Err(LogProviderError::LimitExceeded("too many results".into())));
        provider
            .expect_logs_in_range()
            .withf(|from, to, _| to - from + 1 <= 2)
            .times(3)
            .returning(|f, t, _| Ok(logs(f, t)));

        let backfiller =
            LogBackfiller::new(Arc::clone(&storage), Arc::new(provider), filters(), 8);
        assert_eq!(backfiller.backfill(1, 5).await, Ok(5));
        assert_eq!(storage.logs_in_range(1, 5).unwrap(), logs(1, 5));
    }

    #[tokio::test]
    async fn test_backfill_gives_up_at_single_block() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let mut provider = MockLogProvider::new();
        provider
            .expect_logs_in_range()
            .returning(|_, _, _| Err(LogProviderError::LimitExceeded("too many results".into())));

        let backfiller = LogBackfiller::new(storage, Arc::new(provider), filters(), 4);
        assert_eq!(
            backfiller.backfill(1, 5).await,
            Err(HeadTrackerError::LogProvider(LogProviderError::LimitExceeded(
                "too many results".into()
            )))
        );
    }

    #[tokio::test]
    async fn test_backfill_is_idempotent() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let mut provider = MockLogProvider::new();
        provider.expect_logs_in_range().times(2).returning(|f, t, _| Ok(logs(f, t)));

        let backfiller =
            LogBackfiller::new(Arc::clone(&storage), Arc::new(provider), filters(), 100);
        backfiller.backfill(3, 7).await.unwrap();
        let once = storage.logs_in_range(0, 10).unwrap();
        backfiller.backfill(3, 7).await.unwrap();

        assert_eq!(storage.logs_in_range(0, 10).unwrap(), once);
    }

    #[tokio::test]
    async fn test_empty_range_is_noop() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let mut provider = MockLogProvider::new();
        provider.expect_logs_in_range().never();

        let backfiller = LogBackfiller::new(storage, Arc::new(provider), filters(), 100);
        assert_eq!(backfiller.backfill(8, 7).await, Ok(0));
    }

    #[tokio::test]
    async fn test_backfill_without_filters_skips_queries() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let mut provider = MockLogProvider::new();
        provider.expect_logs_in_range().never();

        let backfiller = LogBackfiller::new(
            Arc::clone(&storage),
            Arc::new(provider),
            Arc::new(FilterRegistry::default()),
            100,
        );
        assert_eq!(backfiller.backfill(3, 7).await, Ok(5));
        assert!(storage.logs_in_range(0, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_queries_merged_filter() {
        let storage = Arc::new(InMemoryHeadSaver::<BlockHead>::new(100));
        let filters = filters();
        let other = LogFilter::new([Address::with_last_byte(2)], [B256::with_last_byte(2)]);
        filters.register("other", other).unwrap();
        let merged = filters.merged().unwrap();

        let mut provider = MockLogProvider::new();
        provider
            .expect_logs_in_range()
            .with(eq(1), eq(2), eq(merged))
            .times(1)
            .returning(|f, t, _| Ok(logs(f, t)));

        let backfiller = LogBackfiller::new(storage, Arc::new(provider), filters, 100);
        assert_eq!(backfiller.backfill(1, 2).await, Ok(2));
    }
}
