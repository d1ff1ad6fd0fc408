//! BLE peripheral model
//!
//! A [`Peripheral`] is a value built from one scan result. Every advertisement
//! from the same address produces a fresh value; nothing is merged. The kind
//! tag carries parsed payloads for specialised devices such as iBeacons, and
//! [`PeripheralFactory`] lets callers plug in their own parsers.

use std::fmt;

use btleplug::api::BDAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::address::bdaddr_serde;
use crate::bluetooth::advertisement::Advertisement;
use crate::bluetooth::attributes::GattService;
use crate::bluetooth::filter::DiscoveryCandidate;

/// Apple's company identifier, used by iBeacon frames
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Link state of a BLE peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(text)
    }
}

/// iBeacon payload carried in Apple manufacturer data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IBeacon {
    pub proximity_uuid: Uuid,
    pub major: u16,
    pub minor: u16,
    /// Calibrated RSSI at one metre
    pub measured_power: i8,
}

impl IBeacon {
    /// Parse an iBeacon frame from an advertisement
    pub fn parse(advertisement: &Advertisement) -> Option<Self> {
        let data = advertisement.manufacturer_data.get(&APPLE_COMPANY_ID)?;
        if data.len() < 23 || data[0] != 0x02 || data[1] != 0x15 {
            return None;
        }
        let proximity: [u8; 16] = data[2..18].try_into().ok()?;
        Some(Self {
            proximity_uuid: Uuid::from_bytes(proximity),
            major: u16::from_be_bytes([data[18], data[19]]),
            minor: u16::from_be_bytes([data[20], data[21]]),
            measured_power: data[22] as i8,
        })
    }
}

/// What kind of device an advertisement describes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum PeripheralKind {
    #[default]
    Generic,
    IBeacon(IBeacon),
}

/// A discovered BLE peripheral
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peripheral {
    /// Stable device address, the identity key
    #[serde(with = "bdaddr_serde")]
    pub address: BDAddr,
    /// Name reported by the platform, if any
    pub system_name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Parsed advertisement including the raw bytes
    pub advertisement: Advertisement,
    /// When this scan result was received
    pub discovered_at: DateTime<Utc>,
    /// Current link state
    pub connection_state: ConnectionState,
    /// GATT services, filled in after discovery
    #[serde(skip)]
    pub services: Vec<GattService>,
    /// Specialised payload
    pub kind: PeripheralKind,
}

impl Peripheral {
    /// Build a generic peripheral from a scan result
    pub fn new(address: BDAddr, system_name: Option<String>, rssi: i16, raw: &[u8]) -> Self {
        Self {
            address,
            system_name,
            rssi,
            advertisement: Advertisement::parse(raw),
            discovered_at: Utc::now(),
            connection_state: ConnectionState::Disconnected,
            services: Vec::new(),
            kind: PeripheralKind::Generic,
        }
    }

    /// Advertised local name, falling back to the platform name
    pub fn name(&self) -> Option<&str> {
        self.advertisement
            .local_name
            .as_deref()
            .or(self.system_name.as_deref())
    }

    /// Whether the peripheral advertises `service`
    pub fn advertises_service(&self, service: &Uuid) -> bool {
        self.advertisement.advertises_service(service)
    }

    /// The iBeacon payload, if this is one
    pub fn ibeacon(&self) -> Option<&IBeacon> {
        match &self.kind {
            PeripheralKind::IBeacon(beacon) => Some(beacon),
            PeripheralKind::Generic => None,
        }
    }

    /// Milliseconds since this scan result arrived
    pub fn age_millis(&self) -> i64 {
        (Utc::now() - self.discovered_at).num_milliseconds()
    }
}

impl fmt::Display for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" rssi={} ({})",
            self.address,
            self.name().unwrap_or("<unnamed>"),
            self.rssi,
            self.connection_state
        )
    }
}

impl DiscoveryCandidate for Peripheral {
    fn address(&self) -> BDAddr {
        self.address
    }

    fn name(&self) -> Option<&str> {
        Peripheral::name(self)
    }

    fn rssi(&self) -> Option<i16> {
        Some(self.rssi)
    }

    fn services(&self) -> &[Uuid] {
        &self.advertisement.service_uuids
    }
}

/// Parser that recognises a specialised peripheral kind
pub type KindParser = fn(&Advertisement) -> Option<PeripheralKind>;

/// Turns raw scan results into peripherals
pub trait PeripheralFactory: Send + Sync {
    fn from_scan_result(
        &self,
        address: BDAddr,
        system_name: Option<String>,
        rssi: i16,
        raw_advertisement: &[u8],
    ) -> Peripheral;
}

/// Factory that tries a list of kind parsers in order
#[derive(Debug, Clone)]
pub struct StandardPeripheralFactory {
    parsers: Vec<KindParser>,
}

impl StandardPeripheralFactory {
    /// Factory that only produces generic peripherals
    pub fn generic() -> Self {
        Self { parsers: Vec::new() }
    }

    /// Add a kind parser; earlier parsers win
    pub fn with_parser(mut self, parser: KindParser) -> Self {
        self.parsers.push(parser);
        self
    }
}

impl Default for StandardPeripheralFactory {
    fn default() -> Self {
        Self::generic().with_parser(|adv| IBeacon::parse(adv).map(PeripheralKind::IBeacon))
    }
}

impl PeripheralFactory for StandardPeripheralFactory {
    fn from_scan_result(
        &self,
        address: BDAddr,
        system_name: Option<String>,
        rssi: i16,
        raw_advertisement: &[u8],
    ) -> Peripheral {
        let mut peripheral = Peripheral::new(address, system_name, rssi, raw_advertisement);
        if let Some(kind) = self
            .parsers
            .iter()
            .find_map(|parse| parse(&peripheral.advertisement))
        {
            peripheral.kind = kind;
        }
        peripheral
    }
}
