//! btleplug-backed implementations of the BLE platform traits
//!
//! btleplug is async; the traits are not. Every primitive spawns a task on the
//! runtime it was built with and reports back through the callback handle,
//! which is exactly the shape the sequencer expects from a radio stack.

use std::sync::{Arc, Mutex, MutexGuard};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::bluetooth::advertisement::AdvertisementBuilder;
use crate::bluetooth::attributes::{GattCharacteristic, GattDescriptor, GattService};
use crate::bluetooth::gatt::GattCallbacks;
use crate::bluetooth::platform::{BleScanPlatform, GattLink, GattStatus, LinkState};
use crate::bluetooth::scanner::ScanResults;
use crate::bluetooth::uuids::{short_code, CLIENT_CHARACTERISTIC_CONFIGURATION, DISABLE_NOTIFICATION_VALUE};
use crate::error::{BluetoothError, ErrorContext};

/// RSSI reported when the platform gives none
const UNKNOWN_RSSI: i16 = -127;

/// The first adapter the system reports
pub async fn first_adapter() -> Result<Adapter, BluetoothError> {
    let ctx = ErrorContext::new("btleplug", "first_adapter");
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| BluetoothError::AdapterUnavailable("no Bluetooth adapter found".to_string()))?;
    match adapter.adapter_info().await {
        Ok(info) => info!("{}using adapter {}", ctx, info),
        Err(e) => debug!("{}adapter info unavailable: {}", ctx, e),
    }
    Ok(adapter)
}

fn to_gatt_characteristic(characteristic: &Characteristic) -> GattCharacteristic {
    GattCharacteristic {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        properties: characteristic.properties,
        descriptors: characteristic
            .descriptors
            .iter()
            .map(|d| GattDescriptor {
                uuid: d.uuid,
                service_uuid: d.service_uuid,
                characteristic_uuid: d.characteristic_uuid,
            })
            .collect(),
    }
}

fn to_btleplug_characteristic(characteristic: &GattCharacteristic) -> Characteristic {
    Characteristic {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        properties: characteristic.properties,
        descriptors: characteristic.descriptors.iter().map(to_btleplug_descriptor).collect(),
    }
}

fn to_btleplug_descriptor(descriptor: &GattDescriptor) -> Descriptor {
    Descriptor {
        uuid: descriptor.uuid,
        service_uuid: descriptor.service_uuid,
        characteristic_uuid: descriptor.characteristic_uuid,
    }
}

fn status_of<T>(result: &Result<T, btleplug::Error>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::SUCCESS,
        Err(_) => GattStatus::FAILURE,
    }
}

/// [`GattLink`] over a btleplug peripheral
pub struct BtleplugGattLink {
    adapter: Adapter,
    peripheral: Peripheral,
    runtime: Handle,
    callbacks: Mutex<Option<GattCallbacks>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugGattLink {
    pub fn new(adapter: Adapter, peripheral: Peripheral, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            peripheral,
            runtime,
            callbacks: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Option<GattCallbacks>> {
        match self.callbacks.lock() {
            Ok(callbacks) => callbacks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `op` on the runtime with the current callbacks; false without any
    fn spawn_op<F, Fut>(&self, op: F) -> bool
    where
        F: FnOnce(Peripheral, GattCallbacks) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let Some(callbacks) = self.lock_callbacks().clone() else {
            return false;
        };
        self.runtime.spawn(op(self.peripheral.clone(), callbacks));
        true
    }

    fn open(&self) -> bool {
        self.spawn_op(|peripheral, callbacks| async move {
            match peripheral.connect().await {
                Ok(()) => callbacks.connection_state_changed(GattStatus::SUCCESS, LinkState::Connected),
                Err(e) => {
                    warn!("[BtleplugGattLink::connect address={}] {}", peripheral.address(), e);
                    callbacks.connection_state_changed(GattStatus::FAILURE, LinkState::Disconnected);
                }
            }
        })
    }

    /// Forward value notifications and adapter-reported drops
    fn start_event_tasks(&self, callbacks: &GattCallbacks) {
        let peripheral = self.peripheral.clone();
        let notify_callbacks = callbacks.clone();
        let notifications = self.runtime.spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[BtleplugGattLink::notifications] no notification stream: {}", e);
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                notify_callbacks.characteristic_changed(notification.uuid, &notification.value);
            }
        });

        let adapter = self.adapter.clone();
        let id = self.peripheral.id();
        let drop_callbacks = callbacks.clone();
        let drops = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("[BtleplugGattLink::events] no adapter event stream: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        drop_callbacks.connection_state_changed(GattStatus::FAILURE, LinkState::Disconnected);
                    }
                }
            }
        });

        self.lock_tasks().extend([notifications, drops]);
    }
}

impl GattLink for BtleplugGattLink {
    fn connect(&self, _auto_reconnect: bool, callbacks: GattCallbacks) -> bool {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.start_event_tasks(&callbacks);
        *self.lock_callbacks() = Some(callbacks);
        self.open()
    }

    fn reconnect(&self) -> bool {
        self.open()
    }

    fn discover_services(&self) -> bool {
        self.spawn_op(|peripheral, callbacks| async move {
            let result = peripheral.discover_services().await;
            let status = status_of(&result);
            let services = peripheral
                .services()
                .iter()
                .map(|service| GattService {
                    uuid: service.uuid,
                    primary: service.primary,
                    characteristics: service.characteristics.iter().map(to_gatt_characteristic).collect(),
                })
                .collect();
            callbacks.services_discovered(status, services);
        })
    }

    fn read_characteristic(&self, characteristic: &GattCharacteristic) -> bool {
        let characteristic = to_btleplug_characteristic(characteristic);
        self.spawn_op(|peripheral, callbacks| async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => callbacks.characteristic_read(characteristic.uuid, value, GattStatus::SUCCESS),
                Err(e) => {
                    debug!("[BtleplugGattLink::read_characteristic] {}", e);
                    callbacks.characteristic_read(characteristic.uuid, Vec::new(), GattStatus::FAILURE);
                }
            }
        })
    }

    fn write_characteristic(&self, characteristic: &GattCharacteristic, data: &[u8], write_type: WriteType) -> bool {
        let characteristic = to_btleplug_characteristic(characteristic);
        let data = data.to_vec();
        self.spawn_op(|peripheral, callbacks| async move {
            let result = peripheral.write(&characteristic, &data, write_type).await;
            if let Err(e) = &result {
                debug!("[BtleplugGattLink::write_characteristic] {}", e);
            }
            callbacks.characteristic_written(characteristic.uuid, status_of(&result));
        })
    }

    fn read_descriptor(&self, descriptor: &GattDescriptor) -> bool {
        let descriptor = to_btleplug_descriptor(descriptor);
        self.spawn_op(|peripheral, callbacks| async move {
            match peripheral.read_descriptor(&descriptor).await {
                Ok(value) => callbacks.descriptor_read(descriptor.uuid, value, GattStatus::SUCCESS),
                Err(e) => {
                    debug!("[BtleplugGattLink::read_descriptor] {}", e);
                    callbacks.descriptor_read(descriptor.uuid, Vec::new(), GattStatus::FAILURE);
                }
            }
        })
    }

    /// CCCD writes go through subscribe and unsubscribe, which btleplug owns
    fn write_descriptor(&self, descriptor: &GattDescriptor, data: &[u8]) -> bool {
        let btle_descriptor = to_btleplug_descriptor(descriptor);
        let data = data.to_vec();

        if descriptor.uuid != CLIENT_CHARACTERISTIC_CONFIGURATION {
            return self.spawn_op(|peripheral, callbacks| async move {
                let result = peripheral.write_descriptor(&btle_descriptor, &data).await;
                callbacks.descriptor_written(btle_descriptor.uuid, status_of(&result));
            });
        }

        let owner = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == descriptor.characteristic_uuid && c.service_uuid == descriptor.service_uuid);
        let Some(characteristic) = owner else {
            warn!(
                "[BtleplugGattLink::write_descriptor] characteristic {} not discovered",
                descriptor.characteristic_uuid
            );
            return false;
        };

        let enable = data.as_slice() != DISABLE_NOTIFICATION_VALUE;
        self.spawn_op(|peripheral, callbacks| async move {
            let result = if enable {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            if let Err(e) = &result {
                debug!("[BtleplugGattLink::write_descriptor] subscription change failed: {}", e);
            }
            callbacks.descriptor_written(CLIENT_CHARACTERISTIC_CONFIGURATION, status_of(&result));
        })
    }

    fn set_notification_registration(&self, _characteristic: &GattCharacteristic, _enabled: bool) -> bool {
        // The notification stream carries every characteristic
        true
    }

    fn read_rssi(&self) -> bool {
        self.spawn_op(|peripheral, callbacks| async move {
            match peripheral.properties().await {
                Ok(properties) => match properties.and_then(|p| p.rssi) {
                    Some(rssi) => callbacks.rssi_read(rssi, GattStatus::SUCCESS),
                    None => callbacks.rssi_read(UNKNOWN_RSSI, GattStatus::FAILURE),
                },
                Err(e) => {
                    debug!("[BtleplugGattLink::read_rssi] {}", e);
                    callbacks.rssi_read(UNKNOWN_RSSI, GattStatus::FAILURE);
                }
            }
        })
    }

    fn request_mtu(&self, _mtu: u16) -> bool {
        // btleplug negotiates the MTU itself
        false
    }

    fn disconnect(&self) {
        self.spawn_op(|peripheral, callbacks| async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("[BtleplugGattLink::disconnect] {}", e);
            }
            callbacks.connection_state_changed(GattStatus::SUCCESS, LinkState::Disconnected);
        });
    }

    fn close(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        *self.lock_callbacks() = None;
    }
}

/// [`BleScanPlatform`] over a btleplug adapter
pub struct BtleplugScanPlatform {
    adapter: Adapter,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugScanPlatform {
    pub fn new(adapter: Adapter, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            runtime,
            task: Mutex::new(None),
        })
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Re-encode the properties btleplug parsed into advertisement bytes
async fn encode_advertisement(peripheral: &Peripheral) -> Option<(Option<String>, i16, Vec<u8>)> {
    let properties = peripheral.properties().await.ok()??;
    Some((
        properties.local_name.clone(),
        properties.rssi.unwrap_or(UNKNOWN_RSSI),
        advertisement_bytes(&properties),
    ))
}

/// Rebuild an advertisement payload from the fields btleplug already parsed
fn advertisement_bytes(properties: &PeripheralProperties) -> Vec<u8> {
    let mut builder = AdvertisementBuilder::new();
    if let Some(name) = &properties.local_name {
        builder = builder.local_name(name);
    }
    if let Some(tx_power) = properties.tx_power_level {
        builder = builder.tx_power(tx_power.clamp(i8::MIN as i16, i8::MAX as i16) as i8);
    }
    for (company, payload) in &properties.manufacturer_data {
        builder = builder.manufacturer_data(*company, payload);
    }

    let codes: Vec<u16> = properties.services.iter().filter_map(short_code).collect();
    if !codes.is_empty() {
        builder = builder.services16(&codes);
    }
    let long: Vec<_> = properties
        .services
        .iter()
        .filter(|uuid| short_code(uuid).is_none())
        .copied()
        .collect();
    if !long.is_empty() {
        builder = builder.services128(&long);
    }
    for (uuid, payload) in &properties.service_data {
        builder = builder.service_data(uuid, payload);
    }

    builder.build()
}

impl BleScanPlatform for BtleplugScanPlatform {
    fn start_scan(&self, results: ScanResults) -> Result<(), BluetoothError> {
        let adapter = self.adapter.clone();
        let task = self.runtime.spawn(async move {
            let ctx = ErrorContext::new("BtleplugScanPlatform", "scan_task");
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("{}failed to get event stream: {}", ctx, e);
                    return;
                }
            };
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("{}failed to start scan: {}", ctx, e);
                return;
            }
            debug!("{}scan running", ctx);

            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                match encode_advertisement(&peripheral).await {
                    Some((name, rssi, raw)) => results.deliver(peripheral.address(), name, rssi, raw),
                    None => trace!("{}no properties for {}", ctx, peripheral.address()),
                }
            }
        });

        if let Some(previous) = self.lock_task().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("[BtleplugScanPlatform::stop_scan] {}", e);
            }
        });
    }
}
