#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod backfill;
pub use backfill::LogBackfiller;

mod broadcaster;
pub use broadcaster::{HeadBroadcaster, HeadTrackable, Unsubscribe};

mod client;
#[cfg(test)]
pub use client::MockLogProvider;
pub use client::{ChainClient, HeadStream, LogProvider};

mod config;
pub use config::HeadTrackerConfig;

mod error;
pub use error::{ClientError, ConfigError, FilterError, HeadTrackerError, LogProviderError};

mod filter;
pub use filter::FilterRegistry;

mod health;
pub use health::{ErrorBuffer, HealthError, HealthReport};

mod listener;
pub use listener::{HeadListener, NewHeadHandler};

mod mailbox;
pub use mailbox::Mailbox;

mod metrics;
pub use metrics::{HeadTrackerMetrics, Metrics, NoopMetrics};

mod service;
pub use service::HeadTrackerService;

mod tracker;
pub use tracker::HeadTracker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
