//! Metrics sinks for the head tracker.

use alloy_primitives::ChainId;
use std::fmt::Debug;

/// Receives the observations made while tracking heads.
///
/// Implementations are injected into each component so tests and embedders can record or
/// discard them.
pub trait HeadTrackerMetrics: Debug + Send + Sync {
    /// A head was received from the subscription.
    fn record_head_received(&self, chain_id: ChainId);

    /// Subscribing failed or an active subscription broke down.
    fn record_connection_error(&self, chain_id: ChainId);

    /// A head far below the latest saved block was received.
    fn record_very_old_head(&self, chain_id: ChainId);

    /// A reorg was resolved, discarding `depth` saved blocks.
    fn record_reorg(&self, chain_id: ChainId, depth: u64);

    /// A reorg deeper than the finalized block was detected.
    fn record_finality_violation(&self, chain_id: ChainId);

    /// `blocks` blocks worth of logs were backfilled.
    fn record_backfill(&self, chain_id: ChainId, blocks: u64);
}

/// A [`HeadTrackerMetrics`] sink that discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl HeadTrackerMetrics for NoopMetrics {
    fn record_head_received(&self, _: ChainId) {}
    fn record_connection_error(&self, _: ChainId) {}
    fn record_very_old_head(&self, _: ChainId) {}
    fn record_reorg(&self, _: ChainId, _: u64) {}
    fn record_finality_violation(&self, _: ChainId) {}
    fn record_backfill(&self, _: ChainId, _: u64) {}
}

/// A [`HeadTrackerMetrics`] sink reporting through the [`metrics`] facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    /// Total heads received from the subscription.
    pub const HEADS_RECEIVED_TOTAL: &'static str = "kona_headtracker_heads_received_total";
    /// Total subscription failures.
    pub const CONNECTION_ERRORS_TOTAL: &'static str = "kona_headtracker_connection_errors_total";
    /// Total heads received far below the latest saved block.
    pub const VERY_OLD_HEADS_TOTAL: &'static str = "kona_headtracker_very_old_heads_total";
    /// Total resolved reorgs.
    pub const REORGS_TOTAL: &'static str = "kona_headtracker_reorgs_total";
    /// Number of saved blocks discarded per reorg.
    pub const REORG_DEPTH: &'static str = "kona_headtracker_reorg_depth";
    /// Total reorgs deeper than the finalized block.
    pub const FINALITY_VIOLATIONS_TOTAL: &'static str =
        "kona_headtracker_finality_violations_total";
    /// Total blocks backfilled.
    pub const BACKFILLED_BLOCKS_TOTAL: &'static str = "kona_headtracker_backfilled_blocks_total";

    /// Describes the metrics and initializes the series for the given chain to zero.
    pub fn init(chain_id: ChainId) -> Self {
        Self::describe();
        Self::zero(chain_id);
        Self
    }

    fn describe() {
        metrics::describe_counter!(
            Self::HEADS_RECEIVED_TOTAL,
            metrics::Unit::Count,
            "Total number of heads received from the new heads subscription",
        );
        metrics::describe_counter!(
            Self::CONNECTION_ERRORS_TOTAL,
            metrics::Unit::Count,
            "Total number of failed or dropped head subscriptions",
        );
        metrics::describe_counter!(
            Self::VERY_OLD_HEADS_TOTAL,
            metrics::Unit::Count,
            "Total number of heads received more than the finality depth below the latest saved block",
        );
        metrics::describe_counter!(
            Self::REORGS_TOTAL,
            metrics::Unit::Count,
            "Total number of resolved chain reorgs",
        );
        metrics::describe_histogram!(
            Self::REORG_DEPTH,
            metrics::Unit::Count,
            "Number of saved blocks discarded by a reorg",
        );
        metrics::describe_counter!(
            Self::FINALITY_VIOLATIONS_TOTAL,
            metrics::Unit::Count,
            "Total number of reorgs reaching below the finalized block",
        );
        metrics::describe_counter!(
            Self::BACKFILLED_BLOCKS_TOTAL,
            metrics::Unit::Count,
            "Total number of blocks whose logs were backfilled",
        );
    }

    fn zero(chain_id: ChainId) {
        for name in [
            Self::HEADS_RECEIVED_TOTAL,
            Self::CONNECTION_ERRORS_TOTAL,
            Self::VERY_OLD_HEADS_TOTAL,
            Self::REORGS_TOTAL,
            Self::FINALITY_VIOLATIONS_TOTAL,
            Self::BACKFILLED_BLOCKS_TOTAL,
        ] {
            metrics::counter!(name, "chain_id" => chain_id.to_string()).increment(0);
        }
    }
}

impl HeadTrackerMetrics for Metrics {
    fn record_head_received(&self, chain_id: ChainId) {
        metrics::counter!(Self::HEADS_RECEIVED_TOTAL, "chain_id" => chain_id.to_string())
            .increment(1);
    }

    fn record_connection_error(&self, chain_id: ChainId) {
        metrics::counter!(Self::CONNECTION_ERRORS_TOTAL, "chain_id" => chain_id.to_string())
            .increment(1);
    }

    fn record_very_old_head(&self, chain_id: ChainId) {
        metrics::counter!(Self::VERY_OLD_HEADS_TOTAL, "chain_id" => chain_id.to_string())
            .increment(1);
    }

    fn record_reorg(&self, chain_id: ChainId, depth: u64) {
        metrics::counter!(Self::REORGS_TOTAL, "chain_id" => chain_id.to_string()).increment(1);
        metrics::histogram!(Self::REORG_DEPTH, "chain_id" => chain_id.to_string())
            .record(depth as f64);
    }

    fn record_finality_violation(&self, chain_id: ChainId) {
        metrics::counter!(Self::FINALITY_VIOLATIONS_TOTAL, "chain_id" => chain_id.to_string())
            .increment(1);
    }

    fn record_backfill(&self, chain_id: ChainId, blocks: u64) {
        metrics::counter!(Self::BACKFILLED_BLOCKS_TOTAL, "chain_id" => chain_id.to_string())
            .increment(blocks);
    }
}
