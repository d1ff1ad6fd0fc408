//! Fake platforms for headless testing
//!
//! The fakes record which primitives were called and hand the test the
//! callback handle the core passed in, so a test plays the radio stack.

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use btleplug::api::{BDAddr, CharPropFlags, WriteType};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mockall::mock;
use uuid::Uuid;

use bluelink::bluetooth::uuids::{expand_uuid16, CLIENT_CHARACTERISTIC_CONFIGURATION};
use bluelink::bluetooth::{
    AdapterPower, BleScanPlatform, BondRemover, BondState, ClassicDiscoveryPlatform, ClassicLink, DiscoveryEvents,
    GattCallbacks, GattCharacteristic, GattDescriptor, GattLink, GattStatus, LinkState, Peripheral, ScanResults,
    SocketCloser, SppSocket,
};
use bluelink::BluetoothError;

mock! {
    pub Power {}

    impl AdapterPower for Power {
        fn is_enabled(&self) -> bool;
        fn request_enable(&self) -> bool;
        fn request_disable(&self) -> bool;
    }
}

mock! {
    pub Remover {}

    impl BondRemover for Remover {
        fn remove_bond(&self, address: BDAddr) -> Result<bool, BluetoothError>;
    }
}

pub fn test_address(last: u8) -> BDAddr {
    BDAddr::from([0x00, 0x11, 0x22, 0x33, 0x44, last])
}

/// Advertisement bytes carrying just a complete local name
pub fn named_advertisement(name: &str) -> Vec<u8> {
    let mut raw = vec![(name.len() + 1) as u8, 0x09];
    raw.extend_from_slice(name.as_bytes());
    raw
}

pub fn test_peripheral(last: u8) -> Peripheral {
    Peripheral::new(test_address(last), Some("fake".to_string()), -50, &[])
}

/// Heart rate measurement, notify only, with a configuration descriptor
pub fn notify_characteristic() -> GattCharacteristic {
    GattCharacteristic::new(expand_uuid16(0x2A37), expand_uuid16(0x180D), CharPropFlags::NOTIFY)
        .with_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION)
}

pub fn readable_characteristic() -> GattCharacteristic {
    GattCharacteristic::new(
        expand_uuid16(0x2A19),
        expand_uuid16(0x180F),
        CharPropFlags::READ | CharPropFlags::WRITE,
    )
}

/// Poll `condition` until it holds; worker threads run in real time
pub fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Collects delegate results across threads
pub struct Recorder<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    /// Wait for the next value delivered from a worker thread
    pub fn next(&self) -> T {
        self.receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("no value recorded within 5s")
    }

    /// Everything recorded so far, without waiting
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    /// Give worker threads a moment, then check nothing more arrived
    pub fn assert_quiet(&self) {
        std::thread::sleep(Duration::from_millis(100));
        let extra = self.drain();
        assert!(extra.is_empty(), "{} unexpected deliveries", extra.len());
    }
}

#[derive(Default)]
struct GattLinkState {
    callbacks: Option<GattCallbacks>,
    calls: Vec<String>,
    rejected: HashSet<&'static str>,
    /// `disconnect` reports the link down before returning
    reports_disconnect: bool,
}

/// Scriptable GATT link
#[derive(Default)]
pub struct FakeGattLink {
    state: Mutex<GattLinkState>,
}

impl FakeGattLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `primitive` return false
    pub fn reject(&self, primitive: &'static str) {
        self.state.lock().unwrap().rejected.insert(primitive);
    }

    /// Report the link down from inside `disconnect`, as some stacks do
    pub fn report_disconnect_synchronously(&self) {
        self.state.lock().unwrap().reports_disconnect = true;
    }

    /// The handle from the latest `connect`
    pub fn callbacks(&self) -> GattCallbacks {
        self.state
            .lock()
            .unwrap()
            .callbacks
            .clone()
            .expect("connect was never called")
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, primitive: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(primitive)).count()
    }

    fn record(&self, primitive: &'static str, detail: String) -> bool {
        let mut state = self.state.lock().unwrap();
        state.calls.push(if detail.is_empty() {
            primitive.to_string()
        } else {
            format!("{} {}", primitive, detail)
        });
        !state.rejected.contains(primitive)
    }
}

impl GattLink for FakeGattLink {
    fn connect(&self, auto_reconnect: bool, callbacks: GattCallbacks) -> bool {
        self.state.lock().unwrap().callbacks = Some(callbacks);
        self.record("connect", format!("auto={}", auto_reconnect))
    }

    fn reconnect(&self) -> bool {
        self.record("reconnect", String::new())
    }

    fn discover_services(&self) -> bool {
        self.record("discover_services", String::new())
    }

    fn read_characteristic(&self, characteristic: &GattCharacteristic) -> bool {
        self.record("read_characteristic", characteristic.uuid.to_string())
    }

    fn write_characteristic(&self, characteristic: &GattCharacteristic, data: &[u8], write_type: WriteType) -> bool {
        self.record(
            "write_characteristic",
            format!("{} {:02X?} {:?}", characteristic.uuid, data, write_type),
        )
    }

    fn read_descriptor(&self, descriptor: &GattDescriptor) -> bool {
        self.record("read_descriptor", descriptor.uuid.to_string())
    }

    fn write_descriptor(&self, descriptor: &GattDescriptor, data: &[u8]) -> bool {
        self.record("write_descriptor", format!("{} {:02X?}", descriptor.uuid, data))
    }

    fn set_notification_registration(&self, characteristic: &GattCharacteristic, enabled: bool) -> bool {
        self.record(
            "set_notification_registration",
            format!("{} {}", characteristic.uuid, enabled),
        )
    }

    fn read_rssi(&self) -> bool {
        self.record("read_rssi", String::new())
    }

    fn request_mtu(&self, mtu: u16) -> bool {
        self.record("request_mtu", mtu.to_string())
    }

    fn disconnect(&self) {
        self.record("disconnect", String::new());
        let callbacks = {
            let state = self.state.lock().unwrap();
            if state.reports_disconnect {
                state.callbacks.clone()
            } else {
                None
            }
        };
        if let Some(callbacks) = callbacks {
            callbacks.connection_state_changed(GattStatus::SUCCESS, LinkState::Disconnected);
        }
    }

    fn close(&self) {
        self.record("close", String::new());
    }
}

/// BLE scan platform that lets the test deliver results
#[derive(Default)]
pub struct FakeScanPlatform {
    results: Mutex<Option<ScanResults>>,
    starts: Mutex<usize>,
    stops: Mutex<usize>,
    fail_start: Mutex<bool>,
}

impl FakeScanPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_start(&self) {
        *self.fail_start.lock().unwrap() = true;
    }

    pub fn results(&self) -> ScanResults {
        self.results.lock().unwrap().clone().expect("scan never started")
    }

    pub fn starts(&self) -> usize {
        *self.starts.lock().unwrap()
    }

    pub fn stops(&self) -> usize {
        *self.stops.lock().unwrap()
    }
}

impl BleScanPlatform for FakeScanPlatform {
    fn start_scan(&self, results: ScanResults) -> Result<(), BluetoothError> {
        if std::mem::take(&mut *self.fail_start.lock().unwrap()) {
            return Err(BluetoothError::AdapterUnavailable("radio off".to_string()));
        }
        *self.results.lock().unwrap() = Some(results);
        *self.starts.lock().unwrap() += 1;
        Ok(())
    }

    fn stop_scan(&self) {
        *self.stops.lock().unwrap() += 1;
    }
}

/// Classic inquiry platform that lets the test report devices
#[derive(Default)]
pub struct FakeDiscoveryPlatform {
    events: Mutex<Option<DiscoveryEvents>>,
    starts: Mutex<usize>,
    cancels: Mutex<usize>,
}

impl FakeDiscoveryPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> DiscoveryEvents {
        self.events.lock().unwrap().clone().expect("discovery never started")
    }

    pub fn starts(&self) -> usize {
        *self.starts.lock().unwrap()
    }

    pub fn cancels(&self) -> usize {
        *self.cancels.lock().unwrap()
    }
}

impl ClassicDiscoveryPlatform for FakeDiscoveryPlatform {
    fn start_discovery(&self, events: DiscoveryEvents) -> bool {
        *self.events.lock().unwrap() = Some(events);
        *self.starts.lock().unwrap() += 1;
        true
    }

    fn cancel_discovery(&self) -> bool {
        *self.cancels.lock().unwrap() += 1;
        true
    }
}

/// Shared view of the sockets a [`FakeClassicLink`] hands out
#[derive(Default)]
pub struct SocketState {
    pub connected: bool,
    pub closed: bool,
    pub written: Vec<u8>,
    pub to_read: VecDeque<Vec<u8>>,
    pub fail_connect: bool,
    /// `read` waits for data or a close instead of reporting end of stream
    pub block_reads: bool,
    /// `connect` waits until cleared or closed
    pub block_connect: bool,
    /// Number of `read` calls that reached the socket
    pub reads: usize,
}

pub struct FakeSocket {
    state: Arc<Mutex<SocketState>>,
}

impl Read for FakeSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.lock().unwrap().reads += 1;
        let mut state = loop {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed"));
            }
            if !state.block_reads || !state.to_read.is_empty() {
                break state;
            }
            drop(state);
            thread::sleep(Duration::from_millis(5));
        };
        let Some(mut chunk) = state.to_read.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.to_read.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for FakeSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SppSocket for FakeSocket {
    fn connect(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().closed = false;
        let mut state = loop {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed"));
            }
            if !state.block_connect {
                break state;
            }
            drop(state);
            thread::sleep(Duration::from_millis(5));
        };
        if state.fail_connect {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        state.connected = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closer().close()
    }

    fn closer(&self) -> Arc<dyn SocketCloser> {
        Arc::new(FakeCloser {
            state: self.state.clone(),
        })
    }
}

struct FakeCloser {
    state: Arc<Mutex<SocketState>>,
}

impl SocketCloser for FakeCloser {
    fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.closed = true;
        Ok(())
    }
}

/// Classic link with a scripted bond state and socket
pub struct FakeClassicLink {
    pub bond_state: Mutex<BondState>,
    pub accept_bond: Mutex<bool>,
    pub accept_sdp: Mutex<bool>,
    pub socket: Arc<Mutex<SocketState>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl FakeClassicLink {
    pub fn new(bond_state: BondState) -> Arc<Self> {
        Arc::new(Self {
            bond_state: Mutex::new(bond_state),
            accept_bond: Mutex::new(true),
            accept_sdp: Mutex::new(true),
            socket: Arc::new(Mutex::new(SocketState::default())),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn socket(&self) -> std::sync::MutexGuard<'_, SocketState> {
        self.socket.lock().unwrap()
    }

    /// Sockets handed out so far
    pub fn sockets_opened(&self) -> usize {
        self.calls().iter().filter(|call| **call == "open_rfcomm_socket").count()
    }
}

impl ClassicLink for FakeClassicLink {
    fn bond_state(&self) -> BondState {
        *self.bond_state.lock().unwrap()
    }

    fn create_bond(&self) -> bool {
        self.calls.lock().unwrap().push("create_bond");
        *self.accept_bond.lock().unwrap()
    }

    fn fetch_uuids_with_sdp(&self) -> bool {
        self.calls.lock().unwrap().push("fetch_uuids_with_sdp");
        *self.accept_sdp.lock().unwrap()
    }

    fn open_rfcomm_socket(&self, _service: Uuid, _secure: bool) -> Result<Box<dyn SppSocket>, BluetoothError> {
        self.calls.lock().unwrap().push("open_rfcomm_socket");
        Ok(Box::new(FakeSocket {
            state: self.socket.clone(),
        }))
    }
}
