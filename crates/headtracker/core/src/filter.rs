//! Registry of the log filters the tracker persists logs for.

use crate::FilterError;
use alloy_primitives::{Address, B256};
use kona_headtracker_types::LogFilter;
use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};
use tracing::{debug, warn};

/// Named [`LogFilter`]s whose union selects the logs fetched for every saved block.
///
/// With no filter registered no logs are requested at all. Registering a filter only affects
/// blocks processed afterwards; use [`HeadTracker::replay`](crate::HeadTracker::replay) to
/// fetch its logs for earlier blocks.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: RwLock<BTreeMap<String, LogFilter>>,
}

impl FilterRegistry {
    /// Registers `filter` under `name`.
    ///
    /// A filter already registered under `name` is replaced, unless it already selects every
    /// address and event of `filter`.
    pub fn register(&self, name: impl Into<String>, filter: LogFilter) -> Result<(), FilterError> {
        let name = name.into();
        if filter.addresses.is_empty() {
            return Err(FilterError::NoAddresses(name));
        }
        if filter.event_sigs.is_empty() {
            return Err(FilterError::NoEventSigs(name));
        }
        if filter.addresses.contains(&Address::ZERO) {
            return Err(FilterError::ZeroAddress(name));
        }
        if filter.event_sigs.contains(&B256::ZERO) {
            return Err(FilterError::ZeroEventSig(name));
        }

        let mut filters = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = filters.get(&name) {
            if existing.contains(&filter) {
                warn!(target: "headtracker::filter", %name, "Filter already present, no-op");
                return Ok(());
            }
            warn!(target: "headtracker::filter", %name, "Updating existing filter");
        }
        debug!(
            target: "headtracker::filter",
            %name,
            addresses = filter.addresses.len(),
            event_sigs = filter.event_sigs.len(),
            "Registered filter"
        );
        filters.insert(name, filter);
        Ok(())
    }

    /// Removes the filter registered under `name`. Returns `false` if there was none.
    pub fn unregister(&self, name: &str) -> bool {
        let removed =
            self.filters.write().unwrap_or_else(PoisonError::into_inner).remove(name).is_some();
        if !removed {
            warn!(target: "headtracker::filter", name, "Filter not found");
        }
        removed
    }

    /// Returns `true` if a filter is registered under `name`.
    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    /// Returns a copy of every registered filter.
    pub fn filters(&self) -> BTreeMap<String, LogFilter> {
        self.filters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the union of every registered filter, or `None` when nothing is registered.
    pub fn merged(&self) -> Option<LogFilter> {
        let filters = self.filters.read().unwrap_or_else(PoisonError::into_inner);
        let mut values = filters.values();
        let mut merged = values.next()?.clone();
        for filter in values {
            merged.merge(filter);
        }
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn filter(addresses: &[u8], sigs: &[u8]) -> LogFilter {
        LogFilter::new(
            addresses.iter().map(|b| Address::with_last_byte(*b)),
            sigs.iter().map(|b| B256::with_last_byte(*b)),
        )
    }

    #[rstest]
    #[case::no_addresses(filter(&[], &[1]), FilterError::NoAddresses("f".into()))]
    #[case::no_events(filter(&[1], &[]), FilterError::NoEventSigs("f".into()))]
    #[case::zero_address(filter(&[0, 1], &[1]), FilterError::ZeroAddress("f".into()))]
    #[case::zero_event(filter(&[1], &[0]), FilterError::ZeroEventSig("f".into()))]
    fn test_rejects_invalid_filter(#[case] invalid: LogFilter, #[case] expected: FilterError) {
        let registry = FilterRegistry::default();
        assert_eq!(registry.register("f", invalid), Err(expected));
        assert!(!registry.has_filter("f"));
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = FilterRegistry::default();
        assert_eq!(registry.merged(), None);

        registry.register("a", filter(&[1], &[1])).unwrap();
        registry.register("b", filter(&[2], &[2, 3])).unwrap();
        assert!(registry.has_filter("a"));
        assert_eq!(registry.filters().len(), 2);
        assert_eq!(registry.merged(), Some(filter(&[1, 2], &[1, 2, 3])));

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(!registry.has_filter("a"));
        assert_eq!(registry.merged(), Some(filter(&[2], &[2, 3])));
    }

    #[test]
    fn test_register_existing_name() {
        let registry = FilterRegistry::default();
        registry.register("a", filter(&[1, 2], &[1])).unwrap();

        // a subset is a no-op
        registry.register("a", filter(&[2], &[1])).unwrap();
        assert_eq!(registry.filters()["a"], filter(&[1, 2], &[1]));

        registry.register("a", filter(&[3], &[4])).unwrap();
        assert_eq!(registry.filters()["a"], filter(&[3], &[4]));
    }
}
