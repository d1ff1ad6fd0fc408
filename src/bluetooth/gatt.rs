//! GATT connection and transaction sequencer
//!
//! [`GattSequencer`] drives one BLE link through
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
//! While connected it runs at most one transaction per kind; each is bounded
//! by a watchdog from the shared [`TimerRegistry`] and resolves its delegate
//! exactly once, from whichever of the platform callback, the watchdog or link
//! teardown gets there first.
//!
//! Platform events come back through [`GattCallbacks`], a cheap handle the
//! sequencer gives to [`GattLink::connect`]. Handles from an earlier link
//! attempt are ignored.
//!
//! Within one link attempt, callbacks identify their request only by kind and
//! attribute. A late callback for a request whose watchdog already fired is
//! discarded when nothing of that kind is pending, but completes a retry of
//! the same kind that was issued before it arrived.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use btleplug::api::{BDAddr, WriteType};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bluetooth::attributes::{find_characteristic, GattCharacteristic, GattDescriptor, GattService};
use crate::bluetooth::peripheral::{ConnectionState, Peripheral};
use crate::bluetooth::platform::{GattLink, GattStatus, LinkState};
use crate::bluetooth::transaction::{
    Completion, Outcome, TransactionInfo, TransactionKind, TransactionRequest, TransactionTable, TransactionValue,
};
use crate::bluetooth::uuids::{
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::dispatch::{invoke_safely, OnceDelegate};
use crate::error::{BluetoothError, ErrorContext};
use crate::timer::TimerRegistry;

/// Delegate for a link that ended, or a connect attempt that failed
pub type DisconnectedDelegate = Box<dyn FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static>;

/// Receives value changes for a subscribed characteristic
pub type NotifyHandler = Arc<dyn Fn(&Uuid, &[u8]) + Send + Sync + 'static>;

/// Platform workarounds that are not universally correct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GattQuirks {
    /// Retry the low-level connect once when it fails with status 133
    pub retry_on_status_133: bool,
}

/// Per-link settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattOptions {
    pub quirks: GattQuirks,
    /// Bound on the wait for a requested disconnect to be confirmed
    pub disconnect_timeout: Duration,
}

impl Default for GattOptions {
    fn default() -> Self {
        Self {
            quirks: GattQuirks::default(),
            disconnect_timeout: Duration::from_secs(5),
        }
    }
}

/// What a connected link is busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattPhase {
    Idle,
    DiscoveringServices,
    ReadingCharacteristic,
    WritingCharacteristic,
    ReadingDescriptor,
    WritingDescriptor,
    TogglingNotify,
    ReadingRssi,
    RequestingMtu,
}

impl fmt::Display for GattPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handle through which a [`GattLink`] reports events for one link attempt
#[derive(Clone)]
pub struct GattCallbacks {
    inner: Weak<Inner>,
    generation: u64,
}

impl GattCallbacks {
    fn live(&self) -> Option<Arc<Inner>> {
        let inner = self.inner.upgrade()?;
        if inner.generation.load(Ordering::SeqCst) != self.generation {
            trace!(
                "[GattCallbacks::live address={}] dropping event from link attempt {}",
                inner.address,
                self.generation
            );
            return None;
        }
        Some(inner)
    }

    pub fn connection_state_changed(&self, status: GattStatus, state: LinkState) {
        if let Some(inner) = self.live() {
            inner.on_connection_state_changed(status, state);
        }
    }

    pub fn services_discovered(&self, status: GattStatus, services: Vec<GattService>) {
        if let Some(inner) = self.live() {
            if status.is_success() {
                inner.lock_session().peripheral.services = services;
            }
            inner.finish(TransactionKind::DiscoverServices, None, status, TransactionValue::Done);
        }
    }

    pub fn characteristic_read(&self, characteristic: Uuid, value: Vec<u8>, status: GattStatus) {
        if let Some(inner) = self.live() {
            inner.finish(
                TransactionKind::ReadCharacteristic,
                Some(characteristic),
                status,
                TransactionValue::Bytes(value),
            );
        }
    }

    pub fn characteristic_written(&self, characteristic: Uuid, status: GattStatus) {
        if let Some(inner) = self.live() {
            inner.finish(
                TransactionKind::WriteCharacteristic,
                Some(characteristic),
                status,
                TransactionValue::Done,
            );
        }
    }

    pub fn descriptor_read(&self, descriptor: Uuid, value: Vec<u8>, status: GattStatus) {
        if let Some(inner) = self.live() {
            inner.finish(
                TransactionKind::ReadDescriptor,
                Some(descriptor),
                status,
                TransactionValue::Bytes(value),
            );
        }
    }

    pub fn descriptor_written(&self, descriptor: Uuid, status: GattStatus) {
        if let Some(inner) = self.live() {
            inner.finish(
                TransactionKind::WriteDescriptor,
                Some(descriptor),
                status,
                TransactionValue::Done,
            );
        }
    }

    /// A notification or indication arrived
    pub fn characteristic_changed(&self, characteristic: Uuid, value: &[u8]) {
        if let Some(inner) = self.live() {
            inner.on_characteristic_changed(characteristic, value);
        }
    }

    pub fn rssi_read(&self, rssi: i16, status: GattStatus) {
        if let Some(inner) = self.live() {
            if status.is_success() {
                inner.lock_session().peripheral.rssi = rssi;
            }
            inner.finish(TransactionKind::ReadRssi, None, status, TransactionValue::Rssi(rssi));
        }
    }

    pub fn mtu_changed(&self, mtu: u16, status: GattStatus) {
        if let Some(inner) = self.live() {
            inner.finish(TransactionKind::RequestMtu, None, status, TransactionValue::Mtu(mtu));
        }
    }
}

struct LinkSession {
    peripheral: Peripheral,
    /// Set by `disconnect()`; the next link drop is reported without error
    disconnect_expected: bool,
    retried_after_133: bool,
    notify_handlers: HashMap<Uuid, NotifyHandler>,
}

struct Inner {
    address: BDAddr,
    link: Arc<dyn GattLink>,
    options: GattOptions,
    transactions: TransactionTable<Peripheral>,
    session: Mutex<LinkSession>,
    on_disconnected: OnceDelegate<DisconnectedDelegate>,
    /// Current link attempt; bumped by every `connect`
    generation: AtomicU64,
    this: Weak<Inner>,
}

/// Connection and transaction state machine for one BLE peripheral
#[derive(Clone)]
pub struct GattSequencer {
    inner: Arc<Inner>,
}

impl GattSequencer {
    /// Create a sequencer for `peripheral` over `link`
    pub fn new(
        peripheral: Peripheral,
        link: Arc<dyn GattLink>,
        timers: Arc<TimerRegistry>,
        options: GattOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            address: peripheral.address,
            link,
            options,
            transactions: TransactionTable::new(timers),
            session: Mutex::new(LinkSession {
                peripheral: Peripheral {
                    connection_state: ConnectionState::Disconnected,
                    ..peripheral
                },
                disconnect_expected: false,
                retried_after_133: false,
                notify_handlers: HashMap::new(),
            }),
            on_disconnected: OnceDelegate::empty(),
            generation: AtomicU64::new(0),
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn address(&self) -> BDAddr {
        self.inner.address
    }

    /// Snapshot of the peripheral including its link state and services
    pub fn peripheral(&self) -> Peripheral {
        self.inner.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_session().peripheral.connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Services from the last successful discovery
    pub fn services(&self) -> Vec<GattService> {
        self.inner.lock_session().peripheral.services.clone()
    }

    /// Look up a discovered characteristic by UUID
    pub fn characteristic(&self, uuid: &Uuid) -> Option<GattCharacteristic> {
        let session = self.inner.lock_session();
        find_characteristic(&session.peripheral.services, uuid).cloned()
    }

    /// Sub-phase of a connected link, derived from the pending transactions
    pub fn phase(&self) -> GattPhase {
        let pending: Vec<TransactionKind> = self
            .inner
            .transactions
            .snapshot()
            .into_iter()
            .map(|info| info.kind)
            .collect();
        let busy = |kind| pending.contains(&kind);

        if busy(TransactionKind::ToggleNotify) {
            GattPhase::TogglingNotify
        } else if busy(TransactionKind::DiscoverServices) {
            GattPhase::DiscoveringServices
        } else if busy(TransactionKind::WriteDescriptor) {
            GattPhase::WritingDescriptor
        } else if busy(TransactionKind::WriteCharacteristic) {
            GattPhase::WritingCharacteristic
        } else if busy(TransactionKind::ReadCharacteristic) {
            GattPhase::ReadingCharacteristic
        } else if busy(TransactionKind::ReadDescriptor) {
            GattPhase::ReadingDescriptor
        } else if busy(TransactionKind::ReadRssi) {
            GattPhase::ReadingRssi
        } else if busy(TransactionKind::RequestMtu) {
            GattPhase::RequestingMtu
        } else {
            GattPhase::Idle
        }
    }

    pub fn pending_transactions(&self) -> Vec<TransactionInfo> {
        self.inner.transactions.snapshot()
    }

    /// Establish the link
    ///
    /// Exactly one of `on_connected` and `on_disconnected` resolves the
    /// attempt. After a successful connect, `on_disconnected` is kept and
    /// fires once more when the link ends: with `None` for a requested
    /// disconnect, `Disconnected { reason }` for a drop.
    pub fn connect<C, D>(&self, auto_reconnect: bool, timeout: Duration, on_connected: C, on_disconnected: D)
    where
        C: FnOnce(&Peripheral) + Send + 'static,
        D: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("GattSequencer", "connect").with_metadata("address", inner.address.to_string());

        let (previous, snapshot) = {
            let mut session = inner.lock_session();
            let previous = session.peripheral.connection_state;
            if previous == ConnectionState::Disconnected {
                session.peripheral.connection_state = ConnectionState::Connecting;
                session.disconnect_expected = false;
                session.retried_after_133 = false;
            }
            (previous, session.peripheral.clone())
        };

        match previous {
            ConnectionState::Disconnected => {}
            ConnectionState::Connected => {
                debug!("{}already connected", ctx);
                inner.on_disconnected.replace(Box::new(on_disconnected));
                invoke_safely("GattSequencer::on_connected", || on_connected(&snapshot));
                return;
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                let kind = if previous == ConnectionState::Connecting {
                    TransactionKind::Connect
                } else {
                    TransactionKind::Disconnect
                };
                warn!("{}rejected while {}", ctx, previous);
                invoke_safely("GattSequencer::on_disconnected", || {
                    on_disconnected(&snapshot, Some(BluetoothError::Busy(kind)))
                });
                return;
            }
        }

        inner.on_disconnected.replace(Box::new(on_disconnected));
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let request = TransactionRequest::watched(TransactionKind::Connect, inner.address, "connect");
        let timer_id = request.timer_id.clone().unwrap_or_default();
        let completion: Completion<Peripheral> = Box::new(move |peripheral: &Peripheral, outcome: Outcome| {
            if outcome.is_ok() {
                on_connected(peripheral);
            }
        });
        let Ok(sequence) = inner.transactions.begin(request, completion) else {
            warn!("{}connect transaction already pending", ctx);
            return;
        };
        inner.arm_watchdog(TransactionKind::Connect, sequence, &timer_id, timeout);

        info!("{}connecting (auto_reconnect: {})", ctx, auto_reconnect);
        let callbacks = GattCallbacks {
            inner: inner.this.clone(),
            generation,
        };
        if !inner.link.connect(auto_reconnect, callbacks) {
            warn!("{}platform rejected connect", ctx);
            inner.teardown(Some(BluetoothError::failed("connect")));
        }
    }

    /// Drop the link; idempotent
    ///
    /// The stored disconnect delegate fires with `None` once the platform
    /// confirms, or once the disconnect watchdog gives up waiting.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let ctx = ErrorContext::new("GattSequencer", "disconnect").with_metadata("address", inner.address.to_string());

        let previous = {
            let mut session = inner.lock_session();
            let previous = session.peripheral.connection_state;
            if matches!(previous, ConnectionState::Connected | ConnectionState::Connecting) {
                session.peripheral.connection_state = ConnectionState::Disconnecting;
                session.disconnect_expected = true;
            }
            previous
        };

        match previous {
            ConnectionState::Disconnected => {
                debug!("{}already disconnected", ctx);
                return;
            }
            ConnectionState::Disconnecting => {
                debug!("{}disconnect already in progress", ctx);
                return;
            }
            ConnectionState::Connected | ConnectionState::Connecting => {}
        }

        let request = TransactionRequest::watched(TransactionKind::Disconnect, inner.address, "disconnect");
        let timer_id = request.timer_id.clone().unwrap_or_default();
        if let Ok(sequence) = inner.transactions.begin(request, Box::new(|_: &Peripheral, _: Outcome| {})) {
            inner.arm_watchdog(
                TransactionKind::Disconnect,
                sequence,
                &timer_id,
                inner.options.disconnect_timeout,
            );
        }

        info!("{}disconnecting (was {})", ctx, previous);
        inner.link.disconnect();
    }

    /// Discover the peripheral's GATT services
    pub fn discover_services<F>(&self, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::DiscoverServices, self.inner.address, "discover_services"),
            timeout,
            error_completion(on_complete),
            |link| link.discover_services(),
        );
    }

    pub fn read_characteristic<F>(&self, characteristic: &GattCharacteristic, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&Peripheral, Option<Vec<u8>>, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::ReadCharacteristic, self.inner.address, "read_characteristic")
                .on_attribute(characteristic.uuid),
            timeout,
            bytes_completion(on_complete),
            |link| link.read_characteristic(characteristic),
        );
    }

    /// Write with response
    pub fn write_characteristic<F>(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        timeout: Duration,
        on_complete: F,
    ) where
        F: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::WriteCharacteristic, self.inner.address, "write_characteristic")
                .on_attribute(characteristic.uuid),
            timeout,
            error_completion(on_complete),
            |link| link.write_characteristic(characteristic, data, WriteType::WithResponse),
        );
    }

    /// Write command; still completes through the platform's write callback
    pub fn write_characteristic_without_response<F>(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        timeout: Duration,
        on_complete: F,
    ) where
        F: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(
                TransactionKind::WriteCharacteristic,
                self.inner.address,
                "write_characteristic_without_response",
            )
            .on_attribute(characteristic.uuid),
            timeout,
            error_completion(on_complete),
            |link| link.write_characteristic(characteristic, data, WriteType::WithoutResponse),
        );
    }

    pub fn read_descriptor<F>(&self, descriptor: &GattDescriptor, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&Peripheral, Option<Vec<u8>>, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::ReadDescriptor, self.inner.address, "read_descriptor")
                .on_attribute(descriptor.uuid),
            timeout,
            bytes_completion(on_complete),
            |link| link.read_descriptor(descriptor),
        );
    }

    pub fn write_descriptor<F>(&self, descriptor: &GattDescriptor, data: &[u8], timeout: Duration, on_complete: F)
    where
        F: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::WriteDescriptor, self.inner.address, "write_descriptor")
                .on_attribute(descriptor.uuid),
            timeout,
            error_completion(on_complete),
            |link| link.write_descriptor(descriptor, data),
        );
    }

    /// Subscribe to or unsubscribe from a characteristic
    ///
    /// Registers (or removes) local delivery first, then writes the client
    /// characteristic configuration descriptor. The descriptor is only written
    /// when local registration succeeded. `on_notify` receives incoming values
    /// while the subscription is active.
    pub fn toggle_notify_state<F>(
        &self,
        characteristic: &GattCharacteristic,
        enable: bool,
        timeout: Duration,
        on_notify: Option<NotifyHandler>,
        on_complete: F,
    ) where
        F: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("GattSequencer", "toggle_notify_state")
            .with_metadata("characteristic", characteristic.uuid.to_string())
            .with_metadata("enable", enable.to_string());

        let snapshot = inner.snapshot();
        if snapshot.connection_state != ConnectionState::Connected {
            invoke_safely("GattSequencer::toggle_notify_state", || {
                on_complete(&snapshot, Some(BluetoothError::NotConnected))
            });
            return;
        }

        let request = TransactionRequest::unwatched(
            TransactionKind::ToggleNotify,
            inner.address,
            "set_notification_registration",
        )
        .on_attribute(characteristic.uuid);
        let sequence = match inner.transactions.begin(request, error_completion(on_complete)) {
            Ok(sequence) => sequence,
            Err(completion) => {
                warn!("{}notify toggle already pending", ctx);
                invoke_safely("GattSequencer::toggle_notify_state", || {
                    completion(&snapshot, Err(BluetoothError::Busy(TransactionKind::ToggleNotify)))
                });
                return;
            }
        };

        if !inner.link.set_notification_registration(characteristic, enable) {
            warn!("{}local registration rejected", ctx);
            inner.resolve_matching(
                TransactionKind::ToggleNotify,
                sequence,
                Err(BluetoothError::failed("set_notification_registration")),
            );
            return;
        }

        {
            let mut session = inner.lock_session();
            if !enable {
                session.notify_handlers.remove(&characteristic.uuid);
            } else if let Some(handler) = on_notify {
                session.notify_handlers.insert(characteristic.uuid, handler);
            }
        }

        let Some(cccd) = characteristic.cccd().cloned() else {
            warn!("{}characteristic has no configuration descriptor", ctx);
            inner.resolve_matching(
                TransactionKind::ToggleNotify,
                sequence,
                Err(BluetoothError::failed("write_descriptor")),
            );
            return;
        };

        let value = if !enable {
            DISABLE_NOTIFICATION_VALUE
        } else if characteristic.indicate_only() {
            ENABLE_INDICATION_VALUE
        } else {
            ENABLE_NOTIFICATION_VALUE
        };
        debug!("{}writing {:02X?} to configuration descriptor", ctx, value);

        let weak = inner.this.clone();
        self.write_descriptor(&cccd, &value, timeout, move |_, error| {
            if let Some(inner) = weak.upgrade() {
                let outcome = match error {
                    Some(error) => Err(error),
                    None => Ok(TransactionValue::Done),
                };
                inner.resolve_matching(TransactionKind::ToggleNotify, sequence, outcome);
            }
        });
    }

    pub fn read_rssi<F>(&self, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&Peripheral, Option<i16>, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::ReadRssi, self.inner.address, "read_rssi"),
            timeout,
            Box::new(move |peripheral: &Peripheral, outcome: Outcome| match outcome {
                Ok(TransactionValue::Rssi(rssi)) => on_complete(peripheral, Some(rssi), None),
                Ok(_) => on_complete(peripheral, None, None),
                Err(error) => on_complete(peripheral, None, Some(error)),
            }),
            |link| link.read_rssi(),
        );
    }

    pub fn request_mtu<F>(&self, mtu: u16, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&Peripheral, Option<u16>, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run(
            TransactionRequest::watched(TransactionKind::RequestMtu, self.inner.address, "request_mtu"),
            timeout,
            Box::new(move |peripheral: &Peripheral, outcome: Outcome| match outcome {
                Ok(TransactionValue::Mtu(mtu)) => on_complete(peripheral, Some(mtu), None),
                Ok(_) => on_complete(peripheral, None, None),
                Err(error) => on_complete(peripheral, None, Some(error)),
            }),
            |link| link.request_mtu(mtu),
        );
    }
}

fn error_completion<F>(on_complete: F) -> Completion<Peripheral>
where
    F: FnOnce(&Peripheral, Option<BluetoothError>) + Send + 'static,
{
    Box::new(move |peripheral: &Peripheral, outcome: Outcome| on_complete(peripheral, outcome.err()))
}

fn bytes_completion<F>(on_complete: F) -> Completion<Peripheral>
where
    F: FnOnce(&Peripheral, Option<Vec<u8>>, Option<BluetoothError>) + Send + 'static,
{
    Box::new(move |peripheral: &Peripheral, outcome: Outcome| match outcome {
        Ok(TransactionValue::Bytes(bytes)) => on_complete(peripheral, Some(bytes), None),
        Ok(_) => on_complete(peripheral, None, None),
        Err(error) => on_complete(peripheral, None, Some(error)),
    })
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, LinkSession> {
        match self.session.lock() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> Peripheral {
        self.lock_session().peripheral.clone()
    }

    /// Shared shape of every connected-link operation
    fn run<P>(&self, request: TransactionRequest, timeout: Duration, completion: Completion<Peripheral>, primitive: P)
    where
        P: FnOnce(&dyn GattLink) -> bool,
    {
        let kind = request.kind;
        let method = request.method;
        let ctx = ErrorContext::new("GattSequencer", method).with_metadata("address", self.address.to_string());

        let snapshot = self.snapshot();
        if snapshot.connection_state != ConnectionState::Connected {
            debug!("{}not connected ({})", ctx, snapshot.connection_state);
            invoke_safely(method, || completion(&snapshot, Err(BluetoothError::NotConnected)));
            return;
        }

        let timer_id = request.timer_id.clone().unwrap_or_default();
        let sequence = match self.transactions.begin(request, completion) {
            Ok(sequence) => sequence,
            Err(completion) => {
                warn!("{}{} transaction already pending", ctx, kind);
                invoke_safely(method, || completion(&snapshot, Err(BluetoothError::Busy(kind))));
                return;
            }
        };
        self.arm_watchdog(kind, sequence, &timer_id, timeout);

        debug!("{}issuing primitive", ctx);
        if !primitive(self.link.as_ref()) {
            warn!("{}platform rejected the request", ctx);
            self.resolve_matching(kind, sequence, Err(BluetoothError::failed(method)));
        }
    }

    fn arm_watchdog(&self, kind: TransactionKind, sequence: u64, timer_id: &str, timeout: Duration) {
        let weak = self.this.clone();
        self.transactions.arm_watchdog(timer_id, timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_watchdog(kind, sequence);
            }
        });
    }

    fn on_watchdog(&self, kind: TransactionKind, sequence: u64) {
        let ctx = ErrorContext::new("GattSequencer", "watchdog")
            .with_metadata("address", self.address.to_string())
            .with_metadata("kind", kind.bucket());

        match kind {
            TransactionKind::Connect => {
                if self.transactions.is_current(kind, sequence) {
                    warn!("{}connect timed out", ctx);
                    // Resolve first; the platform may report the drop from inside disconnect()
                    self.teardown(Some(BluetoothError::Timeout));
                    self.link.disconnect();
                }
            }
            TransactionKind::Disconnect => {
                if self.transactions.is_current(kind, sequence) {
                    warn!("{}disconnect not confirmed, forcing teardown", ctx);
                    self.teardown(None);
                }
            }
            _ => {
                if let Some(tx) = self.transactions.take_matching(kind, sequence) {
                    warn!("{}timed out", ctx);
                    tx.resolve(&self.snapshot(), Err(BluetoothError::Timeout));
                }
            }
        }
    }

    /// Resolve a pending transaction from a platform completion
    fn finish(&self, kind: TransactionKind, attribute: Option<Uuid>, status: GattStatus, value: TransactionValue) {
        let tx = match attribute {
            Some(attribute) => self.transactions.take_for(kind, &attribute),
            None => self.transactions.take(kind),
        };
        match tx {
            Some(tx) => {
                if !status.is_success() {
                    warn!(
                        "[GattSequencer::{} address={}] completed with {}",
                        kind, self.address, status
                    );
                }
                tx.resolve_status(&self.snapshot(), status.is_success(), value);
            }
            None => debug!(
                "[GattSequencer::{} address={}] no matching transaction, ignoring late callback",
                kind, self.address
            ),
        }
    }

    fn resolve_matching(&self, kind: TransactionKind, sequence: u64, outcome: Outcome) {
        if let Some(tx) = self.transactions.take_matching(kind, sequence) {
            tx.resolve(&self.snapshot(), outcome);
        }
    }

    fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]) {
        let handler = self.lock_session().notify_handlers.get(&characteristic).cloned();
        match handler {
            Some(handler) => invoke_safely("GattSequencer::on_notify", || handler(&characteristic, value)),
            None => trace!(
                "[GattSequencer::notify address={}] no handler for {}",
                self.address,
                characteristic
            ),
        }
    }

    fn on_connection_state_changed(&self, status: GattStatus, state: LinkState) {
        let ctx = ErrorContext::new("GattSequencer", "connection_state_changed")
            .with_metadata("address", self.address.to_string())
            .with_metadata("status", status.0.to_string());

        if state == LinkState::Connected && status.is_success() {
            let connected = {
                let mut session = self.lock_session();
                if session.peripheral.connection_state == ConnectionState::Connecting {
                    session.peripheral.connection_state = ConnectionState::Connected;
                    Some(session.peripheral.clone())
                } else {
                    None
                }
            };
            match connected {
                Some(snapshot) => {
                    info!("{}connected", ctx);
                    if let Some(tx) = self.transactions.take(TransactionKind::Connect) {
                        tx.resolve(&snapshot, Ok(TransactionValue::Done));
                    }
                }
                None => debug!("{}ignoring link up outside of a connect attempt", ctx),
            }
            return;
        }

        let (previous, expected, retry) = {
            let mut session = self.lock_session();
            let previous = session.peripheral.connection_state;
            let expected = session.disconnect_expected;
            let retry = previous == ConnectionState::Connecting
                && !expected
                && status == GattStatus::ERROR_133
                && self.options.quirks.retry_on_status_133
                && !session.retried_after_133;
            if retry {
                session.retried_after_133 = true;
            }
            (previous, expected, retry)
        };

        if previous == ConnectionState::Disconnected {
            debug!("{}ignoring link down while disconnected", ctx);
            return;
        }

        if retry {
            warn!("{}connect failed with status 133, retrying once", ctx);
            if self.link.reconnect() {
                return;
            }
            warn!("{}platform rejected reconnect", ctx);
        }

        let error = if expected {
            None
        } else if previous == ConnectionState::Connecting {
            Some(BluetoothError::ConnectionFailed)
        } else if status.is_success() {
            Some(BluetoothError::Disconnected { reason: None })
        } else {
            Some(BluetoothError::Disconnected {
                reason: Some(status.to_string()),
            })
        };
        self.teardown(error);
    }

    /// End the link: release the platform object, fail pending transactions
    /// and fire the disconnect delegate
    fn teardown(&self, error: Option<BluetoothError>) {
        let ctx = ErrorContext::new("GattSequencer", "teardown").with_metadata("address", self.address.to_string());

        let (snapshot, expected) = {
            let mut session = self.lock_session();
            session.peripheral.connection_state = ConnectionState::Disconnected;
            session.notify_handlers.clear();
            let expected = mem::take(&mut session.disconnect_expected);
            (session.peripheral.clone(), expected)
        };

        let pending = self.transactions.drain();
        self.link.close();

        let pending_error = match &error {
            Some(error @ BluetoothError::Disconnected { .. }) => error.clone(),
            _ => BluetoothError::Disconnected { reason: None },
        };

        let mut connect_pending = false;
        for tx in pending {
            match tx.info.kind {
                // The attempt is resolved through the disconnect delegate
                TransactionKind::Connect => connect_pending = true,
                TransactionKind::Disconnect => tx.resolve(&snapshot, Ok(TransactionValue::Done)),
                _ => tx.resolve(&snapshot, Err(pending_error.clone())),
            }
        }

        let reported = if expected {
            None
        } else if connect_pending {
            Some(error.unwrap_or(BluetoothError::ConnectionFailed))
        } else {
            error
        };

        match &reported {
            Some(error) => info!("{}link ended: {}", ctx, error),
            None => info!("{}link closed", ctx),
        }

        if let Some(delegate) = self.on_disconnected.take() {
            invoke_safely("GattSequencer::on_disconnected", move || delegate(&snapshot, reported));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Cancels outstanding watchdogs; completions are dropped unrun
        self.transactions.drain();
    }
}
