//! Seams to the platform radio stack
//!
//! Each trait mirrors the primitive calls the core issues. Primitives return
//! `false` (or an error) when the platform rejects the request outright; their
//! real completion arrives later through the callback handle the core passed
//! in ([`GattCallbacks`], [`ScanResults`], [`DiscoveryEvents`]) or through the
//! public event methods on the session and power manager.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use btleplug::api::{BDAddr, WriteType};
use uuid::Uuid;

use crate::bluetooth::attributes::{GattCharacteristic, GattDescriptor};
use crate::bluetooth::classic_device::BondState;
use crate::bluetooth::classic_scanner::DiscoveryEvents;
use crate::bluetooth::gatt::GattCallbacks;
use crate::bluetooth::scanner::ScanResults;
use crate::error::BluetoothError;

/// Status code carried by GATT callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: Self = Self(0);
    /// Generic low-level failure that a fresh connect attempt often clears
    pub const ERROR_133: Self = Self(133);
    pub const FAILURE: Self = Self(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gatt status {}", self.0)
    }
}

/// Link state reported by a connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// GATT client primitives for one peripheral
pub trait GattLink: Send + Sync {
    /// Open the link; all later events for it go to `callbacks`
    fn connect(&self, auto_reconnect: bool, callbacks: GattCallbacks) -> bool;
    /// Retry the low-level connect on the existing link object
    fn reconnect(&self) -> bool;
    fn discover_services(&self) -> bool;
    fn read_characteristic(&self, characteristic: &GattCharacteristic) -> bool;
    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> bool;
    fn read_descriptor(&self, descriptor: &GattDescriptor) -> bool;
    fn write_descriptor(&self, descriptor: &GattDescriptor, data: &[u8]) -> bool;
    /// Turn local delivery of value changes on or off (no radio traffic)
    fn set_notification_registration(&self, characteristic: &GattCharacteristic, enabled: bool) -> bool;
    fn read_rssi(&self) -> bool;
    fn request_mtu(&self, mtu: u16) -> bool;
    /// Ask the remote side to drop the link
    fn disconnect(&self);
    /// Release the link object
    fn close(&self);
}

/// BLE advertisement scanning
pub trait BleScanPlatform: Send + Sync {
    fn start_scan(&self, results: ScanResults) -> Result<(), BluetoothError>;
    fn stop_scan(&self);
}

/// Classic inquiry
pub trait ClassicDiscoveryPlatform: Send + Sync {
    fn start_discovery(&self, events: DiscoveryEvents) -> bool;
    /// Request a stop; completion arrives as `discovery_finished`
    fn cancel_discovery(&self) -> bool;
}

/// Adapter power control
pub trait AdapterPower: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn request_enable(&self) -> bool;
    fn request_disable(&self) -> bool;
}

/// Classic link primitives for one remote device
pub trait ClassicLink: Send + Sync {
    fn bond_state(&self) -> BondState;
    fn create_bond(&self) -> bool;
    /// Start an SDP query; results arrive as `uuids_discovered`
    fn fetch_uuids_with_sdp(&self) -> bool;
    /// Create an RFCOMM socket for `service`; connecting is a separate step
    fn open_rfcomm_socket(&self, service: Uuid, secure: bool) -> Result<Box<dyn SppSocket>, BluetoothError>;
}

/// An RFCOMM stream socket
pub trait SppSocket: Read + Write + Send {
    /// Blocking connect
    fn connect(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
    /// Handle that closes this socket from another thread
    fn closer(&self) -> Arc<dyn SocketCloser>;
}

/// Closes a socket while another thread is blocked in it
///
/// Closing must make a pending `read`, `write` or `connect` on the socket
/// return with an error.
pub trait SocketCloser: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

/// Bond removal, which platforms usually keep behind a private API
pub trait BondRemover: Send + Sync {
    /// `Ok(false)` when the platform refused the request
    fn remove_bond(&self, address: BDAddr) -> Result<bool, BluetoothError>;
}
