//! Log filters selecting the logs persisted alongside saved heads.

use crate::Log;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Selects logs emitted by any of `addresses` whose first topic is any of `event_sigs`.
///
/// Both lists are kept sorted and free of duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    /// Emitting contracts.
    pub addresses: Vec<Address>,
    /// Event signatures, matched against the first topic.
    pub event_sigs: Vec<B256>,
}

impl LogFilter {
    /// Creates a new filter.
    pub fn new(
        addresses: impl IntoIterator<Item = Address>,
        event_sigs: impl IntoIterator<Item = B256>,
    ) -> Self {
        let mut filter = Self {
            addresses: addresses.into_iter().collect(),
            event_sigs: event_sigs.into_iter().collect(),
        };
        filter.normalize();
        filter
    }

    fn normalize(&mut self) {
        self.addresses.sort_unstable();
        self.addresses.dedup();
        self.event_sigs.sort_unstable();
        self.event_sigs.dedup();
    }

    /// Returns `true` if every address and event signature of `other` is already selected.
    pub fn contains(&self, other: &Self) -> bool {
        other.addresses.iter().all(|address| self.addresses.binary_search(address).is_ok()) &&
            other.event_sigs.iter().all(|sig| self.event_sigs.binary_search(sig).is_ok())
    }

    /// Adds the addresses and event signatures of `other` to this filter.
    pub fn merge(&mut self, other: &Self) {
        self.addresses.extend_from_slice(&other.addresses);
        self.event_sigs.extend_from_slice(&other.event_sigs);
        self.normalize();
    }

    /// Returns `true` if the filter selects `log`.
    pub fn matches(&self, log: &Log) -> bool {
        self.addresses.binary_search(&log.address).is_ok() &&
            log.topics.first().is_some_and(|sig| self.event_sigs.binary_search(sig).is_ok())
    }
}
