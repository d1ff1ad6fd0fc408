//! Classic Bluetooth SPP session
//!
//! A [`ClassicSession`] pairs with one remote device, checks its SDP records
//! for the target profile and holds the RFCOMM socket. Every step is a
//! transaction bounded by a watchdog. Blocking socket calls run on the
//! session's own worker thread, one at a time; the socket is checked out of
//! its slot for the duration of a call. While checked out, the slot keeps the
//! socket's close handle so a disconnect can interrupt the blocked call.

use std::io::{Read, Write};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use btleplug::api::BDAddr;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::bluetooth::classic_device::{BondState, ClassicDevice};
use crate::bluetooth::platform::{BondRemover, ClassicLink, SocketCloser, SppSocket};
use crate::bluetooth::transaction::{
    Completion, Outcome, TransactionInfo, TransactionKind, TransactionRequest, TransactionTable, TransactionValue,
};
use crate::bluetooth::uuids::SERIAL_PORT_PROFILE;
use crate::dispatch::{invoke_safely, Worker};
use crate::error::{BluetoothError, ErrorContext};
use crate::timer::TimerRegistry;

/// Session settings
#[derive(Clone)]
pub struct SessionOptions {
    /// Profile the session connects to; SPP unless overridden
    pub target_service: Uuid,
    /// Bond removal capability, when the platform has one
    pub bond_remover: Option<Arc<dyn BondRemover>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            target_service: SERIAL_PORT_PROFILE,
            bond_remover: None,
        }
    }
}

impl SessionOptions {
    pub fn with_target_service(mut self, service: Uuid) -> Self {
        self.target_service = service;
        self
    }

    pub fn with_bond_remover(mut self, remover: Arc<dyn BondRemover>) -> Self {
        self.bond_remover = Some(remover);
        self
    }
}

enum SocketSlot {
    Empty,
    Idle(Box<dyn SppSocket>),
    /// Checked out by the running worker job
    Busy(Arc<dyn SocketCloser>),
}

struct Inner {
    address: BDAddr,
    link: Arc<dyn ClassicLink>,
    options: SessionOptions,
    transactions: TransactionTable<ClassicDevice>,
    device: Mutex<ClassicDevice>,
    socket: Mutex<SocketSlot>,
    worker: Worker,
    this: Weak<Inner>,
}

/// Pairing, SDP and RFCOMM socket handling for one Classic device
#[derive(Clone)]
pub struct ClassicSession {
    inner: Arc<Inner>,
}

impl ClassicSession {
    pub fn new(
        device: ClassicDevice,
        link: Arc<dyn ClassicLink>,
        timers: Arc<TimerRegistry>,
        options: SessionOptions,
    ) -> Result<Self, BluetoothError> {
        let worker = Worker::spawn(format!("spp-{}", device.address))?;
        let inner = Arc::new_cyclic(|this| Inner {
            address: device.address,
            link,
            options,
            transactions: TransactionTable::new(timers),
            device: Mutex::new(device),
            socket: Mutex::new(SocketSlot::Empty),
            worker,
            this: this.clone(),
        });
        Ok(Self { inner })
    }

    pub fn address(&self) -> BDAddr {
        self.inner.address
    }

    pub fn device(&self) -> ClassicDevice {
        self.inner.snapshot()
    }

    pub fn target_service(&self) -> Uuid {
        self.inner.options.target_service
    }

    /// Whether an RFCOMM socket is open
    pub fn is_connected(&self) -> bool {
        !matches!(*self.inner.lock_socket(), SocketSlot::Empty)
    }

    pub fn pending_transactions(&self) -> Vec<TransactionInfo> {
        self.inner.transactions.snapshot()
    }

    /// Bond with the device; resolves immediately when already bonded
    pub fn pair<F>(&self, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("ClassicSession", "pair").with_metadata("address", inner.address.to_string());

        let bond_state = inner.link.bond_state();
        inner.lock_device().bond_state = bond_state;
        if bond_state == BondState::Bonded {
            debug!("{}already bonded", ctx);
            let snapshot = inner.snapshot();
            invoke_safely("ClassicSession::pair", || on_complete(&snapshot, None));
            return;
        }

        let Some(sequence) = inner.begin(
            TransactionRequest::watched(TransactionKind::Pair, inner.address, "create_bond"),
            timeout,
            error_completion(on_complete),
        ) else {
            return;
        };

        info!("{}requesting bond", ctx);
        if !inner.link.create_bond() {
            warn!("{}platform rejected bonding", ctx);
            inner.resolve_matching(TransactionKind::Pair, sequence, Err(BluetoothError::PairingFailed));
        }
    }

    /// Remove the bond through the platform's bond removal capability
    pub fn unpair<F>(&self, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("ClassicSession", "unpair").with_metadata("address", inner.address.to_string());

        let Some(remover) = inner.options.bond_remover.clone() else {
            warn!("{}no bond removal capability", ctx);
            let snapshot = inner.snapshot();
            invoke_safely("ClassicSession::unpair", || {
                on_complete(&snapshot, Some(BluetoothError::Unsupported("remove_bond")))
            });
            return;
        };

        let bond_state = inner.link.bond_state();
        inner.lock_device().bond_state = bond_state;
        if bond_state == BondState::None {
            debug!("{}not bonded", ctx);
            let snapshot = inner.snapshot();
            invoke_safely("ClassicSession::unpair", || on_complete(&snapshot, None));
            return;
        }

        let Some(sequence) = inner.begin(
            TransactionRequest::watched(TransactionKind::Unpair, inner.address, "remove_bond"),
            timeout,
            error_completion(on_complete),
        ) else {
            return;
        };

        info!("{}removing bond", ctx);
        match remover.remove_bond(inner.address) {
            Ok(true) => {}
            Ok(false) => {
                warn!("{}platform rejected bond removal", ctx);
                inner.resolve_matching(TransactionKind::Unpair, sequence, Err(BluetoothError::UnpairingFailed));
            }
            Err(e) => {
                warn!("{}bond removal failed: {}", ctx, e);
                inner.resolve_matching(TransactionKind::Unpair, sequence, Err(e));
            }
        }
    }

    /// Query SDP; resolves once the target profile shows up in the records
    pub fn discover_services<F>(&self, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("ClassicSession", "discover_services")
            .with_metadata("address", inner.address.to_string());

        let Some(sequence) = inner.begin(
            TransactionRequest::watched(TransactionKind::DiscoverServices, inner.address, "fetch_uuids_with_sdp"),
            timeout,
            error_completion(on_complete),
        ) else {
            return;
        };

        debug!("{}starting SDP query", ctx);
        if !inner.link.fetch_uuids_with_sdp() {
            warn!("{}platform rejected SDP query", ctx);
            inner.resolve_matching(
                TransactionKind::DiscoverServices,
                sequence,
                Err(BluetoothError::ServiceDiscoveryFailed),
            );
        }
    }

    /// Open and connect the RFCOMM socket for the target profile
    pub fn connect_spp<F>(&self, timeout: Duration, secure: bool, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("ClassicSession", "connect_spp")
            .with_metadata("address", inner.address.to_string())
            .with_metadata("secure", secure.to_string());

        if self.is_connected() {
            debug!("{}socket already open", ctx);
            let snapshot = inner.snapshot();
            invoke_safely("ClassicSession::connect_spp", || on_complete(&snapshot, None));
            return;
        }

        let Some(sequence) = inner.begin(
            TransactionRequest::watched(TransactionKind::SocketConnect, inner.address, "connect_spp"),
            timeout,
            error_completion(on_complete),
        ) else {
            return;
        };

        let socket = match inner.link.open_rfcomm_socket(inner.options.target_service, secure) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{}could not create socket: {}", ctx, e);
                inner.resolve_matching(TransactionKind::SocketConnect, sequence, Err(e));
                return;
            }
        };

        let weak = inner.this.clone();
        let submitted = inner.worker.submit(move || {
            let mut socket = socket;
            let result = socket.connect();
            match weak.upgrade() {
                Some(inner) => inner.on_socket_connected(sequence, socket, result),
                None => {
                    let _ = socket.close();
                }
            }
        });
        if !submitted {
            inner.resolve_matching(
                TransactionKind::SocketConnect,
                sequence,
                Err(BluetoothError::failed("connect_spp")),
            );
        }
    }

    /// Close the socket; always succeeds
    pub fn disconnect_spp<F>(&self, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        let inner = &self.inner;
        let ctx = ErrorContext::new("ClassicSession", "disconnect_spp").with_metadata("address", inner.address.to_string());

        let previous = mem::replace(&mut *inner.lock_socket(), SocketSlot::Empty);
        let mut socket = match previous {
            SocketSlot::Idle(socket) => socket,
            SocketSlot::Busy(closer) => {
                // The worker is blocked in the socket; closing here releases it
                match closer.close() {
                    Ok(()) => info!("{}socket closed under a running job", ctx),
                    Err(e) => debug!("{}close failed: {}", ctx, e),
                }
                let snapshot = inner.snapshot();
                invoke_safely("ClassicSession::disconnect_spp", || on_complete(&snapshot, None));
                return;
            }
            SocketSlot::Empty => {
                debug!("{}no socket to close", ctx);
                let snapshot = inner.snapshot();
                invoke_safely("ClassicSession::disconnect_spp", || on_complete(&snapshot, None));
                return;
            }
        };

        // A close that never gets its turn still counts as done
        let completion: Completion<ClassicDevice> = Box::new(move |device: &ClassicDevice, _: Outcome| {
            on_complete(device, None)
        });
        let Some(sequence) = inner.begin(
            TransactionRequest::watched(TransactionKind::SocketDisconnect, inner.address, "disconnect_spp"),
            timeout,
            completion,
        ) else {
            let _ = socket.close();
            return;
        };

        let weak = inner.this.clone();
        inner.worker.submit(move || {
            if let Err(e) = socket.close() {
                debug!("[ClassicSession::disconnect_spp] close failed: {}", e);
            }
            if let Some(inner) = weak.upgrade() {
                info!("[ClassicSession::disconnect_spp address={}] socket closed", inner.address);
                inner.resolve_matching(TransactionKind::SocketDisconnect, sequence, Ok(TransactionValue::Done));
            }
        });
    }

    /// Write all of `data` to the socket
    pub fn write_bytes<F>(&self, data: Vec<u8>, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        self.inner.run_socket_job(
            TransactionRequest::watched(TransactionKind::SocketWrite, self.inner.address, "socket_write"),
            timeout,
            error_completion(on_complete),
            move |socket| socket.write_all(&data).and_then(|_| socket.flush()).map(|_| TransactionValue::Done),
        );
    }

    /// Read up to `max_len` bytes; a closed stream ends the session
    ///
    /// A zero-length read resolves at once with no bytes and leaves the
    /// socket alone.
    pub fn read_bytes<F>(&self, max_len: usize, timeout: Duration, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<Vec<u8>>, Option<BluetoothError>) + Send + 'static,
    {
        if max_len == 0 {
            let error = (!self.is_connected()).then_some(BluetoothError::NotConnected);
            let bytes = error.is_none().then(Vec::new);
            let snapshot = self.inner.snapshot();
            invoke_safely("ClassicSession::read_bytes", || on_complete(&snapshot, bytes, error));
            return;
        }

        self.inner.run_socket_job(
            TransactionRequest::watched(TransactionKind::SocketRead, self.inner.address, "socket_read"),
            timeout,
            Box::new(move |device: &ClassicDevice, outcome: Outcome| match outcome {
                Ok(TransactionValue::Bytes(bytes)) => on_complete(device, Some(bytes), None),
                Ok(_) => on_complete(device, None, None),
                Err(error) => on_complete(device, None, Some(error)),
            }),
            move |socket| {
                let mut buffer = vec![0u8; max_len];
                let read = socket.read(&mut buffer)?;
                buffer.truncate(read);
                Ok(TransactionValue::Bytes(buffer))
            },
        );
    }

    /// Pair, check SDP for the target profile, then connect the socket
    ///
    /// Stops at the first failing step; `on_complete` fires once.
    pub fn start_spp_session<F>(&self, timeout: Duration, secure: bool, on_complete: F)
    where
        F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
    {
        info!("[ClassicSession::start_spp_session address={}] starting", self.inner.address);
        let weak = Arc::downgrade(&self.inner);
        self.pair(timeout, move |device, error| {
            if let Some(error) = error {
                on_complete(device, Some(error));
                return;
            }
            let Some(inner) = weak.upgrade() else {
                on_complete(device, Some(BluetoothError::NotConnected));
                return;
            };
            let session = ClassicSession { inner };
            let target = session.target_service();
            let next = session.clone();
            session.discover_services(timeout, move |device, error| {
                if let Some(error) = error {
                    on_complete(device, Some(error));
                    return;
                }
                if !device.has_service(&target) {
                    warn!("[ClassicSession::start_spp_session] {} does not offer {}", device.address, target);
                    on_complete(device, Some(BluetoothError::ServiceDiscoveryFailed));
                    return;
                }
                next.connect_spp(timeout, secure, on_complete);
            });
        });
    }

    /// Platform notification that the bond state changed
    pub fn bond_state_changed(&self, state: BondState) {
        let inner = &self.inner;
        debug!("[ClassicSession::bond_state_changed address={}] {:?}", inner.address, state);
        inner.lock_device().bond_state = state;
        match state {
            BondState::Bonded => inner.finish(TransactionKind::Pair, Ok(TransactionValue::Done)),
            BondState::None => {
                inner.finish(TransactionKind::Pair, Err(BluetoothError::PairingFailed));
                inner.finish(TransactionKind::Unpair, Ok(TransactionValue::Done));
            }
            BondState::Bonding => {}
        }
    }

    /// Platform notification carrying the device's SDP service UUIDs
    pub fn uuids_discovered(&self, uuids: Vec<Uuid>) {
        let inner = &self.inner;
        let found = uuids.contains(&inner.options.target_service);
        inner.lock_device().service_uuids = uuids;
        if found {
            inner.finish(TransactionKind::DiscoverServices, Ok(TransactionValue::Done));
        } else {
            debug!(
                "[ClassicSession::uuids_discovered address={}] target profile not listed yet",
                inner.address
            );
        }
    }
}

fn error_completion<F>(on_complete: F) -> Completion<ClassicDevice>
where
    F: FnOnce(&ClassicDevice, Option<BluetoothError>) + Send + 'static,
{
    Box::new(move |device: &ClassicDevice, outcome: Outcome| on_complete(device, outcome.err()))
}

impl Inner {
    fn lock_device(&self) -> MutexGuard<'_, ClassicDevice> {
        match self.device.lock() {
            Ok(device) => device,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_socket(&self) -> MutexGuard<'_, SocketSlot> {
        match self.socket.lock() {
            Ok(socket) => socket,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> ClassicDevice {
        self.lock_device().clone()
    }

    /// Register a transaction and arm its watchdog; rejects a busy kind
    fn begin(&self, request: TransactionRequest, timeout: Duration, completion: Completion<ClassicDevice>) -> Option<u64> {
        let kind = request.kind;
        let timer_id = request.timer_id.clone();
        match self.transactions.begin(request, completion) {
            Ok(sequence) => {
                if let Some(timer_id) = timer_id {
                    let weak = self.this.clone();
                    self.transactions.arm_watchdog(&timer_id, timeout, move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_watchdog(kind, sequence);
                        }
                    });
                }
                Some(sequence)
            }
            Err(completion) => {
                warn!("[ClassicSession::{} address={}] already in progress", kind, self.address);
                let snapshot = self.snapshot();
                invoke_safely("ClassicSession::busy", || completion(&snapshot, Err(BluetoothError::Busy(kind))));
                None
            }
        }
    }

    fn on_watchdog(&self, kind: TransactionKind, sequence: u64) {
        if let Some(tx) = self.transactions.take_matching(kind, sequence) {
            let outcome = if kind == TransactionKind::SocketDisconnect {
                Ok(TransactionValue::Done)
            } else {
                warn!("[ClassicSession::watchdog address={}] {} timed out", self.address, kind);
                Err(BluetoothError::Timeout)
            };
            tx.resolve(&self.snapshot(), outcome);
        }
    }

    fn finish(&self, kind: TransactionKind, outcome: Outcome) {
        if let Some(tx) = self.transactions.take(kind) {
            tx.resolve(&self.snapshot(), outcome);
        }
    }

    fn resolve_matching(&self, kind: TransactionKind, sequence: u64, outcome: Outcome) {
        if let Some(tx) = self.transactions.take_matching(kind, sequence) {
            tx.resolve(&self.snapshot(), outcome);
        }
    }

    /// Runs on the worker thread
    fn on_socket_connected(&self, sequence: u64, mut socket: Box<dyn SppSocket>, result: std::io::Result<()>) {
        let ctx = ErrorContext::new("ClassicSession", "connect_spp").with_metadata("address", self.address.to_string());

        let Some(tx) = self.transactions.take_matching(TransactionKind::SocketConnect, sequence) else {
            warn!("{}socket finished after its watchdog, closing it", ctx);
            let _ = socket.close();
            return;
        };

        match result {
            Ok(()) => {
                info!("{}socket connected", ctx);
                *self.lock_socket() = SocketSlot::Idle(socket);
                tx.resolve(&self.snapshot(), Ok(TransactionValue::Done));
            }
            Err(e) => {
                warn!("{}socket connect failed: {}", ctx, e);
                let _ = socket.close();
                tx.resolve(&self.snapshot(), Err(BluetoothError::ConnectionFailed));
            }
        }
    }

    /// Run a blocking socket call on the worker as a watchdog-bounded transaction
    fn run_socket_job<J>(&self, request: TransactionRequest, timeout: Duration, completion: Completion<ClassicDevice>, job: J)
    where
        J: FnOnce(&mut Box<dyn SppSocket>) -> std::io::Result<TransactionValue> + Send + 'static,
    {
        let kind = request.kind;
        let method = request.method;

        if matches!(*self.lock_socket(), SocketSlot::Empty) {
            let snapshot = self.snapshot();
            invoke_safely(method, || completion(&snapshot, Err(BluetoothError::NotConnected)));
            return;
        }

        let Some(sequence) = self.begin(request, timeout, completion) else {
            return;
        };

        let weak = self.this.clone();
        let submitted = self.worker.submit(move || {
            if let Some(inner) = weak.upgrade() {
                inner.socket_job(kind, method, sequence, job);
            }
        });
        if !submitted {
            self.resolve_matching(kind, sequence, Err(BluetoothError::failed(method)));
        }
    }

    /// Runs on the worker thread
    fn socket_job<J>(&self, kind: TransactionKind, method: &'static str, sequence: u64, job: J)
    where
        J: FnOnce(&mut Box<dyn SppSocket>) -> std::io::Result<TransactionValue>,
    {
        let checked_out = {
            let mut slot = self.lock_socket();
            match mem::replace(&mut *slot, SocketSlot::Empty) {
                SocketSlot::Idle(socket) => {
                    *slot = SocketSlot::Busy(socket.closer());
                    Some(socket)
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        let Some(mut socket) = checked_out else {
            self.resolve_matching(kind, sequence, Err(BluetoothError::NotConnected));
            return;
        };

        let result = job(&mut socket);
        let end_of_stream = matches!(&result, Ok(TransactionValue::Bytes(bytes)) if bytes.is_empty());

        // Jobs run one at a time, so a Busy slot is still ours; anything else
        // means the socket was disconnected while the job ran
        let to_close = {
            let mut slot = self.lock_socket();
            let still_ours = matches!(*slot, SocketSlot::Busy(_));
            if !still_ours {
                Some(socket)
            } else if end_of_stream || result.is_err() {
                *slot = SocketSlot::Empty;
                Some(socket)
            } else {
                *slot = SocketSlot::Idle(socket);
                None
            }
        };

        if let Some(mut socket) = to_close {
            debug!("[ClassicSession::{} address={}] closing socket", method, self.address);
            let _ = socket.close();
        }

        let outcome = match result {
            Ok(_) if end_of_stream => Err(BluetoothError::Disconnected {
                reason: Some("end of stream".to_string()),
            }),
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("[ClassicSession::{} address={}] socket error: {}", kind, self.address, e);
                Err(BluetoothError::Disconnected {
                    reason: Some(e.to_string()),
                })
            }
        };
        self.resolve_matching(kind, sequence, outcome);
    }
}
