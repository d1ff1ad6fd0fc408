use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::address::parse_bdaddr;
use crate::bluetooth::filter::{
    AddressFilter, DiscoveryCandidate, DiscoveryFilter, FilterChain, NameFilter, RssiFilter, ServiceFilter,
};
use crate::config::duration_ms;

/// Configuration for the scanners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long the command line scan runs
    #[serde(with = "duration_ms")]
    pub scan_duration: Duration,
    /// Minimum RSSI (signal strength) filter
    /// Devices with lower RSSI are skipped for that sighting
    pub min_rssi: Option<i16>,
    /// Only report devices whose name contains this fragment
    pub name_filter: Option<String>,
    /// Only report devices that advertise this service
    pub service_filter: Option<Uuid>,
    /// Allow-list of addresses; empty means any address
    pub addresses: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            min_rssi: None,
            name_filter: None,
            service_filter: None,
            addresses: Vec::new(),
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for a one-time scan
    pub fn one_time_scan(duration: Duration) -> Self {
        Self {
            scan_duration: duration,
            ..Self::default()
        }
    }

    /// Set the scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set the minimum signal strength
    pub fn with_min_rssi(mut self, min_rssi: Option<i16>) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    /// Set the name fragment to match
    pub fn with_name_filter(mut self, name: Option<String>) -> Self {
        self.name_filter = name;
        self
    }

    /// Set the required service
    pub fn with_service_filter(mut self, service: Option<Uuid>) -> Self {
        self.service_filter = service;
        self
    }

    /// Restrict discovery to the given addresses
    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Build the filter chain described by this configuration
    ///
    /// Order: address allow-list, RSSI, service, name. Unparseable addresses
    /// are skipped with a warning.
    pub fn filters<D>(&self) -> FilterChain<D>
    where
        D: DiscoveryCandidate + 'static,
    {
        let mut chain: FilterChain<D> = Vec::new();

        if !self.addresses.is_empty() {
            let addresses = self.addresses.iter().filter_map(|text| match parse_bdaddr(text) {
                Ok(address) => Some(address),
                Err(e) => {
                    log::warn!("[ScanConfig::filters] skipping address: {}", e);
                    None
                }
            });
            chain.push(boxed(AddressFilter::new(addresses)));
        }
        if let Some(min_rssi) = self.min_rssi {
            chain.push(boxed(RssiFilter::new(min_rssi)));
        }
        if let Some(service) = self.service_filter {
            chain.push(boxed(ServiceFilter::new(service)));
        }
        if let Some(name) = &self.name_filter {
            chain.push(boxed(NameFilter::new(vec![name.clone()])));
        }

        chain
    }
}

fn boxed<D, F>(filter: F) -> Box<dyn DiscoveryFilter<D>>
where
    F: DiscoveryFilter<D> + 'static,
{
    Box::new(filter)
}
