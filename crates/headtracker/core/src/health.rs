//! Health reporting.

use crate::HeadTrackerError;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, PoisonError},
};
use thiserror::Error;

/// Health of each component, keyed by component name.
pub type HealthReport = BTreeMap<String, Result<(), HealthError>>;

/// Reasons a component reports itself unhealthy.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HealthError {
    /// The listener has no live subscription.
    #[error("not connected to the node")]
    NotConnected,

    /// The listener has not seen a head within the idle threshold.
    #[error("not receiving heads")]
    NotReceivingHeads,

    /// A reorg deeper than the finalized block was detected and needs manual intervention.
    #[error("finality violated")]
    FinalityViolated,
}

/// Bounded buffer of errors reported for operator visibility.
///
/// When full, the oldest error is dropped.
#[derive(Debug)]
pub struct ErrorBuffer {
    capacity: usize,
    errors: Mutex<VecDeque<HeadTrackerError>>,
}

impl ErrorBuffer {
    /// Default capacity of the buffer.
    pub const DEFAULT_CAPACITY: usize = 20;

    /// Creates an empty buffer holding at most `capacity` errors.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, errors: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Appends an error, dropping the oldest one if the buffer is full.
    pub fn append(&self, err: HeadTrackerError) {
        let mut errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        if errors.len() == self.capacity {
            errors.pop_front();
        }
        errors.push_back(err);
    }

    /// Removes and returns all buffered errors, oldest first.
    pub fn flush(&self) -> Vec<HeadTrackerError> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }

    /// Returns the number of buffered errors.
    pub fn len(&self) -> usize {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no error is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_buffer_drops_oldest() {
        let buffer = ErrorBuffer::new(2);
        for block_number in 1..=3 {
            buffer.append(HeadTrackerError::FinalityViolated {
                block_number,
                finalized_block_number: 0,
            });
        }

        assert_eq!(buffer.len(), 2);
        let flushed = buffer.flush();
        assert_eq!(
            flushed,
            vec![
                HeadTrackerError::FinalityViolated { block_number: 2, finalized_block_number: 0 },
                HeadTrackerError::FinalityViolated { block_number: 3, finalized_block_number: 0 },
            ]
        );
        assert!(buffer.is_empty());
    }
}
