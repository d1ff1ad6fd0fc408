// Root module exports
pub mod bluetooth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod store;
pub mod timer;

// Re-exports for convenience
pub use bluetooth::{BleScanner, ClassicScanner, ClassicSession, GattSequencer, Peripheral, PowerManager};
pub use config::{BluetoothConfig, LogLevel};
pub use error::{BluetoothError, ErrorContext};
pub use logging::configure_logging;
pub use store::{JsonFileStore, MemoryStore, MetadataStore};
pub use timer::TimerRegistry;
