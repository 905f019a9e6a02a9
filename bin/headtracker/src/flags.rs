//! Flags for the head tracker CLI.

use alloy_primitives::{Address, B256};
use clap::Parser;
use kona_headtracker::HeadTrackerConfig;
use kona_headtracker_types::LogFilter;
use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

/// Prometheus metrics arguments.
#[derive(Parser, Clone, Debug, PartialEq, Eq)]
pub struct MetricsArgs {
    /// Serve Prometheus metrics.
    #[arg(long = "metrics.enabled", env = "HEADTRACKER_METRICS_ENABLED")]
    pub enabled: bool,
    /// The address the metrics server listens on.
    #[arg(
        long = "metrics.addr",
        default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        env = "HEADTRACKER_METRICS_ADDR"
    )]
    pub addr: IpAddr,
    /// The port the metrics server listens on.
    #[arg(long = "metrics.port", default_value_t = 9090, env = "HEADTRACKER_METRICS_PORT")]
    pub port: u16,
}

impl Default for MetricsArgs {
    fn default() -> Self {
        Self { enabled: false, addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 9090 }
    }
}

/// Head tracking arguments.
#[derive(Parser, Clone, Debug, PartialEq, Eq)]
pub struct TrackerArgs {
    /// Number of most recent block heights kept in memory.
    #[arg(long, default_value_t = 100, env = "HEADTRACKER_HISTORY_DEPTH")]
    pub history_depth: u64,
    /// Number of processed heads buffered before the broadcaster drops the oldest.
    #[arg(long, default_value_t = 3, env = "HEADTRACKER_MAX_BUFFER_SIZE")]
    pub max_buffer_size: usize,
    /// Interval in milliseconds at which the latest head is broadcast. Zero broadcasts every
    /// head.
    #[arg(
        long = "sampling-interval-ms",
        default_value_t = 1000,
        env = "HEADTRACKER_SAMPLING_INTERVAL_MS"
    )]
    pub sampling_interval_ms: u64,
    /// Number of blocks after which a block is considered final.
    #[arg(long, default_value_t = 50, env = "HEADTRACKER_FINALITY_DEPTH")]
    pub finality_depth: u64,
    /// Use the node's `finalized` block instead of the finality depth.
    #[arg(long, env = "HEADTRACKER_FINALITY_TAG_ENABLED")]
    pub finality_tag_enabled: bool,
    /// Warn when no head arrives for this many seconds. Zero disables the warning.
    #[arg(
        long = "idle-threshold-secs",
        default_value_t = 0,
        env = "HEADTRACKER_IDLE_THRESHOLD_SECS"
    )]
    pub idle_threshold_secs: u64,
    /// Maximum time in milliseconds a subscriber may take to handle a head.
    #[arg(
        long = "callback-timeout-ms",
        default_value_t = 2000,
        env = "HEADTRACKER_CALLBACK_TIMEOUT_MS"
    )]
    pub callback_timeout_ms: u64,
    /// First resubscription delay in milliseconds.
    #[arg(
        long = "redial-backoff-min-ms",
        default_value_t = 1000,
        env = "HEADTRACKER_REDIAL_BACKOFF_MIN_MS"
    )]
    pub redial_backoff_min_ms: u64,
    /// Maximum resubscription delay in milliseconds.
    #[arg(
        long = "redial-backoff-max-ms",
        default_value_t = 15000,
        env = "HEADTRACKER_REDIAL_BACKOFF_MAX_MS"
    )]
    pub redial_backoff_max_ms: u64,
    /// Number of blocks requested per log query while backfilling.
    #[arg(long, default_value_t = 1000, env = "HEADTRACKER_BACKFILL_BATCH_SIZE")]
    pub backfill_batch_size: u64,
    /// Number of blocks below the finalized block for which logs are kept. Zero keeps every
    /// log.
    #[arg(long, default_value_t = 0, env = "HEADTRACKER_LOG_RETENTION")]
    pub log_retention: u64,
    /// Interval in seconds at which finalized logs are fetched again. Zero disables the backup
    /// poller.
    #[arg(
        long = "backup-poll-interval-secs",
        default_value_t = 60,
        env = "HEADTRACKER_BACKUP_POLL_INTERVAL_SECS"
    )]
    pub backup_poll_interval_secs: u64,
    /// Number of blocks below the latest saved block the first backup poll starts at.
    #[arg(long, default_value_t = 100, env = "HEADTRACKER_BACKUP_POLL_BLOCK_DELAY")]
    pub backup_poll_block_delay: u64,
}

impl From<&TrackerArgs> for HeadTrackerConfig {
    fn from(args: &TrackerArgs) -> Self {
        Self {
            history_depth: args.history_depth,
            max_buffer_size: args.max_buffer_size,
            sampling_interval: Duration::from_millis(args.sampling_interval_ms),
            finality_depth: args.finality_depth,
            finality_tag_enabled: args.finality_tag_enabled,
            block_emission_idle_warning_threshold: Duration::from_secs(args.idle_threshold_secs),
            callback_timeout: Duration::from_millis(args.callback_timeout_ms),
            redial_backoff_min: Duration::from_millis(args.redial_backoff_min_ms),
            redial_backoff_max: Duration::from_millis(args.redial_backoff_max_ms),
            backfill_batch_size: args.backfill_batch_size,
            log_retention: args.log_retention,
            backup_poll_interval: Duration::from_secs(args.backup_poll_interval_secs),
            backup_poll_block_delay: args.backup_poll_block_delay,
        }
    }
}

/// Log filter arguments.
#[derive(Parser, Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterArgs {
    /// Contracts whose logs are saved with each block.
    #[arg(long = "filter.address", value_delimiter = ',', env = "HEADTRACKER_FILTER_ADDRESS")]
    pub addresses: Vec<Address>,
    /// Event signatures whose logs are saved with each block.
    #[arg(long = "filter.event", value_delimiter = ',', env = "HEADTRACKER_FILTER_EVENT")]
    pub event_sigs: Vec<B256>,
}

impl FilterArgs {
    /// Returns the configured filter, or `None` if neither addresses nor events were given.
    pub fn to_filter(&self) -> Option<LogFilter> {
        if self.addresses.is_empty() && self.event_sigs.is_empty() {
            return None;
        }
        Some(LogFilter::new(self.addresses.iter().copied(), self.event_sigs.iter().copied()))
    }
}
