//! Classic Bluetooth device model

use std::fmt;

use btleplug::api::BDAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::address::bdaddr_serde;
use crate::bluetooth::filter::DiscoveryCandidate;

/// Pairing state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// A Classic device found by inquiry or known from the bond list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassicDevice {
    #[serde(with = "bdaddr_serde")]
    pub address: BDAddr,
    pub name: Option<String>,
    pub bond_state: BondState,
    /// Service UUIDs from the last SDP query
    pub service_uuids: Vec<Uuid>,
    /// Inquiry RSSI, when the platform reports it
    pub rssi: Option<i16>,
    /// Class of device bits
    pub device_class: Option<u32>,
    pub discovered_at: DateTime<Utc>,
}

impl ClassicDevice {
    pub fn new(address: BDAddr, name: Option<String>) -> Self {
        Self {
            address,
            name,
            bond_state: BondState::None,
            service_uuids: Vec::new(),
            rssi: None,
            device_class: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_bond_state(mut self, bond_state: BondState) -> Self {
        self.bond_state = bond_state;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_services(mut self, service_uuids: Vec<Uuid>) -> Self {
        self.service_uuids = service_uuids;
        self
    }

    pub fn is_bonded(&self) -> bool {
        self.bond_state == BondState::Bonded
    }

    pub fn has_service(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }
}

impl fmt::Display for ClassicDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" ({:?})",
            self.address,
            self.name.as_deref().unwrap_or("<unnamed>"),
            self.bond_state
        )
    }
}

impl DiscoveryCandidate for ClassicDevice {
    fn address(&self) -> BDAddr {
        self.address
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    fn services(&self) -> &[Uuid] {
        &self.service_uuids
    }
}
