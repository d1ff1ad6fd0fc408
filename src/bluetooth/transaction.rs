//! Single-flight transaction bookkeeping shared by the GATT sequencer and the
//! Classic session
//!
//! Each link owns one [`TransactionTable`]. At most one transaction per
//! [`TransactionKind`] can be pending; a second request of the same kind is
//! handed back to the caller so it can be rejected with `Busy`. Removing an
//! entry from the table is the single point where a completion is claimed, so
//! the platform callback, the watchdog and link teardown can race safely. The
//! entry's watchdog is cancelled under the same lock, before a newer
//! transaction of that kind can re-arm the timer id.
//!
//! Platform completions carry no request token, so [`TransactionTable::take`]
//! and [`TransactionTable::take_for`] match on kind (and attribute) only. A
//! completion for a request that already timed out is dropped while nothing of
//! that kind is pending, but if a retry of the same kind was issued before the
//! late callback arrives, the callback completes the retry. Watchdogs and
//! completions produced in-process, which know their sequence, use
//! [`TransactionTable::take_matching`] instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use btleplug::api::BDAddr;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dispatch::invoke_safely;
use crate::error::BluetoothError;
use crate::timer::TimerRegistry;

/// Operation kinds; also the watchdog bucket names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionKind {
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    ToggleNotify,
    ReadRssi,
    RequestMtu,
    Pair,
    Unpair,
    SocketConnect,
    SocketDisconnect,
    SocketRead,
    SocketWrite,
}

impl TransactionKind {
    /// Snake case bucket name
    pub fn bucket(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::DiscoverServices => "discover_services",
            Self::ReadCharacteristic => "read_characteristic",
            Self::WriteCharacteristic => "write_characteristic",
            Self::ReadDescriptor => "read_descriptor",
            Self::WriteDescriptor => "write_descriptor",
            Self::ToggleNotify => "toggle_notify",
            Self::ReadRssi => "read_rssi",
            Self::RequestMtu => "request_mtu",
            Self::Pair => "pair",
            Self::Unpair => "unpair",
            Self::SocketConnect => "socket_connect",
            Self::SocketDisconnect => "socket_disconnect",
            Self::SocketRead => "socket_read",
            Self::SocketWrite => "socket_write",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.bucket())
    }
}

/// Watchdog timer id for a transaction on `address`
pub fn watchdog_id(address: &BDAddr, kind: TransactionKind) -> String {
    format!("{}__{}", address, kind.bucket())
}

/// Successful result of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionValue {
    Done,
    Bytes(Vec<u8>),
    Rssi(i16),
    Mtu(u16),
}

pub(crate) type Outcome = Result<TransactionValue, BluetoothError>;

/// Completion invoked with the link's device snapshot `C`
pub(crate) type Completion<C> = Box<dyn FnOnce(&C, Outcome) + Send + 'static>;

/// Public view of a pending transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    pub kind: TransactionKind,
    pub target: BDAddr,
    /// Characteristic or descriptor the transaction addresses
    pub attribute: Option<Uuid>,
    /// Platform primitive named in `OperationFailed`
    pub method: &'static str,
    pub timer_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

pub(crate) struct Transaction<C> {
    pub info: TransactionInfo,
    pub sequence: u64,
    completion: Completion<C>,
}

impl<C> Transaction<C> {
    /// Run the completion
    pub fn resolve(self, context: &C, outcome: Outcome) {
        let label = format!("{}::{}", self.info.target, self.info.kind);
        let completion = self.completion;
        invoke_safely(&label, move || completion(context, outcome));
    }

    /// Map a platform status onto this transaction's outcome
    pub fn resolve_status(self, context: &C, success: bool, value: TransactionValue) {
        let outcome = if success {
            Ok(value)
        } else {
            Err(BluetoothError::failed(self.info.method))
        };
        self.resolve(context, outcome);
    }
}

/// Request half of [`TransactionTable::begin`]
pub(crate) struct TransactionRequest {
    pub kind: TransactionKind,
    pub target: BDAddr,
    pub method: &'static str,
    pub attribute: Option<Uuid>,
    pub timer_id: Option<String>,
}

impl TransactionRequest {
    /// Request guarded by the standard watchdog id
    pub fn watched(kind: TransactionKind, target: BDAddr, method: &'static str) -> Self {
        Self {
            kind,
            target,
            method,
            attribute: None,
            timer_id: Some(watchdog_id(&target, kind)),
        }
    }

    /// Request without a watchdog of its own
    pub fn unwatched(kind: TransactionKind, target: BDAddr, method: &'static str) -> Self {
        Self {
            kind,
            target,
            method,
            attribute: None,
            timer_id: None,
        }
    }

    pub fn on_attribute(mut self, attribute: Uuid) -> Self {
        self.attribute = Some(attribute);
        self
    }
}

pub(crate) struct TransactionTable<C> {
    pending: Mutex<HashMap<TransactionKind, Transaction<C>>>,
    next_sequence: AtomicU64,
    timers: Arc<TimerRegistry>,
}

impl<C> TransactionTable<C> {
    pub fn new(timers: Arc<TimerRegistry>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
            timers,
        }
    }

    /// Register a transaction; hands the completion back when its kind is busy
    pub fn begin(&self, request: TransactionRequest, completion: Completion<C>) -> Result<u64, Completion<C>> {
        let TransactionRequest {
            kind,
            target,
            method,
            attribute,
            timer_id,
        } = request;
        let mut pending = self.lock();
        if pending.contains_key(&kind) {
            return Err(completion);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        pending.insert(
            kind,
            Transaction {
                info: TransactionInfo {
                    kind,
                    target,
                    attribute,
                    method,
                    timer_id,
                    started_at: Utc::now(),
                },
                sequence,
                completion,
            },
        );
        Ok(sequence)
    }

    /// Claim the pending transaction of `kind`
    pub fn take(&self, kind: TransactionKind) -> Option<Transaction<C>> {
        let mut pending = self.lock();
        let tx = pending.remove(&kind)?;
        self.cancel_watchdog(&tx);
        Some(tx)
    }

    /// Claim the pending transaction of `kind` only if it is `sequence`
    pub fn take_matching(&self, kind: TransactionKind, sequence: u64) -> Option<Transaction<C>> {
        self.take_if(kind, |tx| tx.sequence == sequence)
    }

    /// Claim the pending transaction of `kind` if it addresses `attribute`
    ///
    /// Transactions that were not started on a specific attribute match any.
    pub fn take_for(&self, kind: TransactionKind, attribute: &Uuid) -> Option<Transaction<C>> {
        self.take_if(kind, |tx| {
            tx.info.attribute.map_or(true, |expected| expected == *attribute)
        })
    }

    /// Claim everything, e.g. on link teardown
    pub fn drain(&self) -> Vec<Transaction<C>> {
        let mut pending = self.lock();
        let mut drained: Vec<_> = pending.drain().map(|(_, tx)| tx).collect();
        for tx in &drained {
            self.cancel_watchdog(tx);
        }
        drop(pending);
        drained.sort_by_key(|tx| tx.sequence);
        drained
    }

    fn take_if<P>(&self, kind: TransactionKind, predicate: P) -> Option<Transaction<C>>
    where
        P: FnOnce(&Transaction<C>) -> bool,
    {
        let mut pending = self.lock();
        if !pending.get(&kind).map_or(false, predicate) {
            return None;
        }
        let tx = pending.remove(&kind)?;
        self.cancel_watchdog(&tx);
        Some(tx)
    }

    fn cancel_watchdog(&self, tx: &Transaction<C>) {
        if let Some(timer_id) = &tx.info.timer_id {
            self.timers.cancel(timer_id);
        }
    }

    /// Arm a one-shot watchdog that calls `on_timeout`
    pub fn arm_watchdog<F>(&self, timer_id: &str, timeout: Duration, on_timeout: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.start(timer_id, timeout, false, None, move |_| on_timeout());
    }

    pub fn is_pending(&self, kind: TransactionKind) -> bool {
        self.lock().contains_key(&kind)
    }

    pub fn is_current(&self, kind: TransactionKind, sequence: u64) -> bool {
        self.lock()
            .get(&kind)
            .map_or(false, |tx| tx.sequence == sequence)
    }

    pub fn snapshot(&self) -> Vec<TransactionInfo> {
        let mut infos: Vec<_> = self.lock().values().map(|tx| tx.info.clone()).collect();
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionKind, Transaction<C>>> {
        match self.pending.lock() {
            Ok(pending) => pending,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
