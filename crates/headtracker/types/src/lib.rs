//! Core types shared across head tracker components.
//!
//! This crate defines the [`ChainHead`] capability every chain integration provides to the
//! tracker, the concrete [`BlockHead`] used for EVM chains, the [`Log`] record persisted
//! alongside saved heads and the [`LogFilter`] selecting which logs are persisted.
mod filter;
pub use filter::LogFilter;

mod head;
pub use head::{BlockHead, ChainHead};

mod log;
pub use log::Log;
