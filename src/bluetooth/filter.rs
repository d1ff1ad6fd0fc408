//! Discovery filters
//!
//! A scanner runs an ordered chain of filters over every candidate. The first
//! verdict other than [`FilterVerdict::Discover`] ends the chain.

use std::collections::HashSet;

use btleplug::api::BDAddr;
use uuid::Uuid;

/// Outcome of evaluating a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Report the candidate to the listener
    Discover,
    /// Drop this sighting only
    IgnoreOnce,
    /// Drop this address for the rest of the scan session
    IgnoreForever,
}

/// What filters can see of a discovered device
pub trait DiscoveryCandidate {
    fn address(&self) -> BDAddr;
    fn name(&self) -> Option<&str>;
    fn rssi(&self) -> Option<i16>;
    fn services(&self) -> &[Uuid];
}

/// Filter for discovered devices
pub trait DiscoveryFilter<D>: Send + Sync {
    /// Decide what to do with a candidate
    fn evaluate(&self, candidate: &D) -> FilterVerdict;
}

/// Boxed filter chain as stored by the scanners
pub type FilterChain<D> = Vec<Box<dyn DiscoveryFilter<D>>>;

/// Run a chain: the first non-`Discover` verdict wins, an empty chain discovers
pub fn evaluate_chain<D>(filters: &[Box<dyn DiscoveryFilter<D>>], candidate: &D) -> FilterVerdict {
    filters
        .iter()
        .map(|f| f.evaluate(candidate))
        .find(|verdict| *verdict != FilterVerdict::Discover)
        .unwrap_or(FilterVerdict::Discover)
}

/// Only let through devices on an allow-list; everything else is ignored for
/// the rest of the session
pub struct AddressFilter {
    /// Addresses to match
    addresses: HashSet<BDAddr>,
}

impl AddressFilter {
    /// Create a new address filter
    pub fn new(addresses: impl IntoIterator<Item = BDAddr>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }
}

impl<D: DiscoveryCandidate> DiscoveryFilter<D> for AddressFilter {
    fn evaluate(&self, candidate: &D) -> FilterVerdict {
        if self.addresses.contains(&candidate.address()) {
            FilterVerdict::Discover
        } else {
            FilterVerdict::IgnoreForever
        }
    }
}

/// Drop sightings weaker than a minimum RSSI
pub struct RssiFilter {
    /// Minimum RSSI value
    min_rssi: i16,
}

impl RssiFilter {
    /// Create a new RSSI filter
    pub fn new(min_rssi: i16) -> Self {
        Self { min_rssi }
    }
}

impl<D: DiscoveryCandidate> DiscoveryFilter<D> for RssiFilter {
    fn evaluate(&self, candidate: &D) -> FilterVerdict {
        match candidate.rssi() {
            Some(rssi) if rssi >= self.min_rssi => FilterVerdict::Discover,
            // A device may move closer, so this is never permanent
            _ => FilterVerdict::IgnoreOnce,
        }
    }
}

/// Require an advertised (BLE) or SDP-reported (Classic) service
pub struct ServiceFilter {
    service: Uuid,
}

impl ServiceFilter {
    pub fn new(service: Uuid) -> Self {
        Self { service }
    }
}

impl<D: DiscoveryCandidate> DiscoveryFilter<D> for ServiceFilter {
    fn evaluate(&self, candidate: &D) -> FilterVerdict {
        if candidate.services().contains(&self.service) {
            FilterVerdict::Discover
        } else {
            FilterVerdict::IgnoreOnce
        }
    }
}

/// Match devices whose name contains any of the given fragments
pub struct NameFilter {
    /// Fragments to match (case-insensitive)
    fragments: Vec<String>,
}

impl NameFilter {
    /// Create a new name filter
    pub fn new(fragments: impl IntoIterator<Item = String>) -> Self {
        Self {
            fragments: fragments.into_iter().map(|n| n.to_lowercase()).collect(),
        }
    }
}

impl<D: DiscoveryCandidate> DiscoveryFilter<D> for NameFilter {
    fn evaluate(&self, candidate: &D) -> FilterVerdict {
        let matched = candidate.name().map_or(false, |name| {
            let name = name.to_lowercase();
            self.fragments.iter().any(|f| name.contains(f.as_str()))
        });
        if matched {
            FilterVerdict::Discover
        } else {
            // Names often arrive in a later scan response
            FilterVerdict::IgnoreOnce
        }
    }
}

/// Function-based filter
pub struct FunctionFilter<D> {
    /// Filter function
    filter_fn: Box<dyn Fn(&D) -> FilterVerdict + Send + Sync>,
}

impl<D> FunctionFilter<D> {
    /// Create a new function filter
    pub fn new<F>(filter_fn: F) -> Self
    where
        F: Fn(&D) -> FilterVerdict + Send + Sync + 'static,
    {
        Self {
            filter_fn: Box::new(filter_fn),
        }
    }
}

impl<D> DiscoveryFilter<D> for FunctionFilter<D> {
    fn evaluate(&self, candidate: &D) -> FilterVerdict {
        (self.filter_fn)(candidate)
    }
}
