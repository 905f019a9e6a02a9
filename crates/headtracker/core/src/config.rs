//! Head tracker configuration.

use crate::ConfigError;
use std::time::Duration;

/// Configuration of the head tracking pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadTrackerConfig {
    /// Number of most recent block heights kept in the chain history.
    pub history_depth: u64,
    /// Capacity of the buffer between the tracker and the broadcaster. The oldest head is
    /// dropped when the buffer is full.
    pub max_buffer_size: usize,
    /// Interval at which buffered heads are forwarded to the broadcaster. Zero forwards every
    /// head as soon as it is processed.
    pub sampling_interval: Duration,
    /// Number of blocks after which a block is considered final when the finality tag is
    /// disabled. Also bounds the tolerated reorg depth.
    pub finality_depth: u64,
    /// Use the node's `finalized` block instead of [`Self::finality_depth`].
    pub finality_tag_enabled: bool,
    /// Warn when no head arrives for this long. Zero disables the alarm.
    pub block_emission_idle_warning_threshold: Duration,
    /// Maximum time a broadcaster callback may run for a single head.
    pub callback_timeout: Duration,
    /// First delay before resubscribing after a subscription failure.
    pub redial_backoff_min: Duration,
    /// Upper bound of the resubscription delay.
    pub redial_backoff_max: Duration,
    /// Number of blocks requested per log query during backfill.
    pub backfill_batch_size: u64,
    /// Number of blocks below the latest finalized block for which logs are kept. Zero keeps
    /// every log.
    pub log_retention: u64,
    /// Interval at which finalized logs are fetched again, guarding against nodes that served
    /// incomplete results. Zero disables the backup poller.
    pub backup_poll_interval: Duration,
    /// Number of blocks the first backup poll starts below the latest saved block. Zero
    /// disables the backup poller.
    pub backup_poll_block_delay: u64,
}

impl Default for HeadTrackerConfig {
    fn default() -> Self {
        Self {
            history_depth: 100,
            max_buffer_size: 3,
            sampling_interval: Duration::from_secs(1),
            finality_depth: 50,
            finality_tag_enabled: false,
            block_emission_idle_warning_threshold: Duration::ZERO,
            callback_timeout: Duration::from_secs(2),
            redial_backoff_min: Duration::from_secs(1),
            redial_backoff_max: Duration::from_secs(15),
            backfill_batch_size: 1000,
            log_retention: 0,
            backup_poll_interval: Duration::from_secs(60),
            backup_poll_block_delay: 100,
        }
    }
}

impl HeadTrackerConfig {
    /// Checks that the configuration can drive the tracker.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.backfill_batch_size == 0 {
            return Err(ConfigError::ZeroBackfillBatchSize);
        }
        if !self.finality_tag_enabled {
            if self.finality_depth == 0 {
                return Err(ConfigError::ZeroFinalityDepth);
            }
            if self.history_depth <= self.finality_depth {
                return Err(ConfigError::HistoryTooShallow {
                    history_depth: self.history_depth,
                    finality_depth: self.finality_depth,
                });
            }
        }
        if self.redial_backoff_min.as_nanos() > self.redial_backoff_max.as_nanos() {
            return Err(ConfigError::InvalidRedialBackoff {
                min: self.redial_backoff_min,
                max: self.redial_backoff_max,
            });
        }
        Ok(())
    }

    /// Returns `true` if the backup poller should run.
    pub const fn backup_poll_enabled(&self) -> bool {
        !self.backup_poll_interval.is_zero() && self.backup_poll_block_delay > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(HeadTrackerConfig::default().validate(), Ok(()));
    }

    #[rstest]
    #[case::zero_buffer(
        HeadTrackerConfig { max_buffer_size: 0, ..Default::default() },
        ConfigError::ZeroBufferSize
    )]
    #[case::zero_batch(
        HeadTrackerConfig { backfill_batch_size: 0, ..Default::default() },
        ConfigError::ZeroBackfillBatchSize
    )]
    #[case::zero_finality_depth(
        HeadTrackerConfig { finality_depth: 0, ..Default::default() },
        ConfigError::ZeroFinalityDepth
    )]
    #[case::shallow_history(
        HeadTrackerConfig { history_depth: 50, ..Default::default() },
        ConfigError::HistoryTooShallow { history_depth: 50, finality_depth: 50 }
    )]
    #[case::inverted_backoff(
        HeadTrackerConfig {
            redial_backoff_min: Duration::from_secs(20),
            ..Default::default()
        },
        ConfigError::InvalidRedialBackoff {
            min: Duration::from_secs(20),
            max: Duration::from_secs(15),
        }
    )]
    fn test_invalid_config(#[case] config: HeadTrackerConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }

    #[rstest]
    #[case::enabled(Duration::from_secs(1), 10, true)]
    #[case::no_interval(Duration::ZERO, 10, false)]
    #[case::no_delay(Duration::from_secs(1), 0, false)]
    fn test_backup_poll_enabled(
        #[case] backup_poll_interval: Duration,
        #[case] backup_poll_block_delay: u64,
        #[case] enabled: bool,
    ) {
        let config = HeadTrackerConfig {
            backup_poll_interval,
            backup_poll_block_delay,
            ..Default::default()
        };
        assert_eq!(config.backup_poll_enabled(), enabled);
    }

    #[test]
    fn test_finality_tag_ignores_depth() {
        let config = HeadTrackerConfig {
            finality_tag_enabled: true,
            finality_depth: 0,
            history_depth: 10,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }
}
