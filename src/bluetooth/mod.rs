//! BLE and Classic scanning, GATT sequencing and SPP sessions

pub mod address;
pub mod advertisement;
pub mod attributes;
pub mod btleplug_backend;
pub mod classic_device;
pub mod classic_scanner;
pub mod filter;
pub mod gatt;
pub mod peripheral;
pub mod platform;
pub mod power;
pub mod scanner;
mod scanner_config;
pub mod session;
pub mod transaction;
pub mod uuids;

pub use advertisement::{Advertisement, AdvertisementBuilder};
pub use attributes::{GattCharacteristic, GattDescriptor, GattService};
pub use classic_device::{BondState, ClassicDevice};
pub use classic_scanner::{ClassicScanState, ClassicScanner, DiscoveryEvents};
pub use filter::{
    AddressFilter, DiscoveryCandidate, DiscoveryFilter, FilterChain, FilterVerdict, FunctionFilter, NameFilter,
    RssiFilter, ServiceFilter,
};
pub use gatt::{GattCallbacks, GattOptions, GattPhase, GattQuirks, GattSequencer, NotifyHandler};
pub use peripheral::{ConnectionState, Peripheral, PeripheralFactory, PeripheralKind, StandardPeripheralFactory};
pub use platform::{
    AdapterPower, BleScanPlatform, BondRemover, ClassicDiscoveryPlatform, ClassicLink, GattLink, GattStatus, LinkState,
    SocketCloser, SppSocket,
};
pub use power::{PowerManager, PowerState};
pub use scanner::{BleScanner, ScanResults, ScanStats};
pub use scanner_config::ScanConfig;
pub use session::{ClassicSession, SessionOptions};
pub use transaction::{TransactionInfo, TransactionKind};
