//! Error types for bluelink
//!
//! Every sequencer, scanner and session operation reports its outcome through
//! a completion delegate carrying an `Option<BluetoothError>`. The taxonomy is
//! intentionally flat: platform status codes are not wrapped, only mapped.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::bluetooth::TransactionKind;

/// Errors surfaced to callers of the Bluetooth core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BluetoothError {
    /// The operation needs a live link and there is none
    #[error("Not connected")]
    NotConnected,

    /// The watchdog fired before the platform reported completion
    #[error("Operation timed out")]
    Timeout,

    /// A platform primitive rejected the request or reported a failure status
    #[error("Platform call {method} failed")]
    OperationFailed { method: &'static str },

    /// The link could not be established
    #[error("Connection failed")]
    ConnectionFailed,

    /// The link went away; `reason` is `None` when the platform gave no cause
    #[error("Disconnected ({})", .reason.as_deref().unwrap_or("no reason reported"))]
    Disconnected { reason: Option<String> },

    /// Bonding ended in the not-bonded state or could not be requested
    #[error("Pairing failed")]
    PairingFailed,

    /// SDP discovery could not be started or the target profile is missing
    #[error("Service discovery failed")]
    ServiceDiscoveryFailed,

    /// Bond removal was rejected by the platform
    #[error("Unpairing failed")]
    UnpairingFailed,

    /// A transaction of the same kind is already pending on this link
    #[error("A {0} transaction is already in progress")]
    Busy(TransactionKind),

    /// The platform does not offer the named capability
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// No usable Bluetooth adapter
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
}

impl BluetoothError {
    /// Convenience constructor for `OperationFailed`
    pub fn failed(method: &'static str) -> Self {
        Self::OperationFailed { method }
    }

    /// Whether this error came from a watchdog
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<btleplug::Error> for BluetoothError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::NotConnected => Self::NotConnected,
            btleplug::Error::TimedOut(_) => Self::Timeout,
            btleplug::Error::NotSupported(_) => Self::Unsupported("btleplug operation"),
            other => Self::AdapterUnavailable(other.to_string()),
        }
    }
}

/// Result alias for fallible setup calls (adapter lookup, worker creation)
pub type Result<T> = std::result::Result<T, BluetoothError>;

/// Context attached to log lines: which component and operation produced them
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component name, e.g. `GattSequencer`
    pub component: String,
    /// Operation name, e.g. `connect`
    pub operation: String,
    /// Extra key/value pairs rendered after the prefix
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Create a new context
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}", self.component, self.operation)?;
        for (key, value) in &self.metadata {
            write!(f, " {}={}", key, value)?;
        }
        write!(f, "] ")
    }
}
