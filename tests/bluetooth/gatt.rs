use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use uuid::Uuid;

use bluelink::bluetooth::uuids::CLIENT_CHARACTERISTIC_CONFIGURATION;
use bluelink::bluetooth::{
    ConnectionState, GattOptions, GattQuirks, GattSequencer, GattService, GattStatus, LinkState, NotifyHandler,
    TransactionKind,
};
use bluelink::{BluetoothError, TimerRegistry};

use super::mocks::{notify_characteristic, readable_characteristic, test_peripheral, FakeGattLink, Recorder};

const TIMEOUT: Duration = Duration::from_millis(1000);

type LinkEvents = Recorder<Result<(), Option<BluetoothError>>>;

fn sequencer(link: &Arc<FakeGattLink>, options: GattOptions) -> GattSequencer {
    GattSequencer::new(test_peripheral(1), link.clone(), TimerRegistry::current(), options)
}

/// Start a connect whose outcomes land in the returned recorder:
/// `Ok(())` for link up, `Err(error)` for every disconnect delegate call
fn start_connect(gatt: &GattSequencer) -> LinkEvents {
    let events = Recorder::new();
    let up = events.sender();
    let down = events.sender();
    gatt.connect(
        false,
        TIMEOUT,
        move |_| {
            let _ = up.send(Ok(()));
        },
        move |_, error| {
            let _ = down.send(Err(error));
        },
    );
    events
}

fn connected(link: &Arc<FakeGattLink>, options: GattOptions) -> (GattSequencer, LinkEvents) {
    let gatt = sequencer(link, options);
    let events = start_connect(&gatt);
    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Connected);
    assert_eq!(events.drain(), vec![Ok(())]);
    (gatt, events)
}

#[tokio::test(start_paused = true)]
async fn test_connect_success_fires_once_without_watchdog() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);
    assert_eq!(gatt.connection_state(), ConnectionState::Connecting);
    assert_eq!(link.calls(), vec!["connect auto=false"]);

    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Connected);
    assert!(gatt.is_connected());

    tokio::time::sleep(TIMEOUT * 2).await;
    assert_eq!(events.drain(), vec![Ok(())]);
    assert!(gatt.pending_transactions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_watchdog_reports_timeout() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    tokio::time::sleep(TIMEOUT - Duration::from_millis(1)).await;
    assert!(events.drain().is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(events.drain(), vec![Err(Some(BluetoothError::Timeout))]);
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnected);
    assert_eq!(link.call_count("disconnect"), 1);
    assert_eq!(link.call_count("close"), 1);

    // A late link up from the abandoned attempt changes nothing
    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Connected);
    assert!(events.drain().is_empty());
    assert!(!gatt.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_survives_synchronous_drop_report() {
    let link = FakeGattLink::new();
    link.report_disconnect_synchronously();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
    assert_eq!(events.drain(), vec![Err(Some(BluetoothError::Timeout))]);
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnected);
    assert_eq!(link.call_count("disconnect"), 1);
    assert_eq!(link.call_count("close"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reports_connection_failed() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    link.callbacks()
        .connection_state_changed(GattStatus::FAILURE, LinkState::Disconnected);
    assert_eq!(events.drain(), vec![Err(Some(BluetoothError::ConnectionFailed))]);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_connect_primitive() {
    let link = FakeGattLink::new();
    link.reject("connect");
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    assert_eq!(
        events.drain(),
        vec![Err(Some(BluetoothError::OperationFailed { method: "connect" }))]
    );
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_status_133_retried_once_with_quirk() {
    let link = FakeGattLink::new();
    let options = GattOptions {
        quirks: GattQuirks {
            retry_on_status_133: true,
        },
        ..GattOptions::default()
    };
    let gatt = sequencer(&link, options);
    let events = start_connect(&gatt);

    link.callbacks()
        .connection_state_changed(GattStatus::ERROR_133, LinkState::Disconnected);
    assert_eq!(link.call_count("reconnect"), 1);
    assert!(events.drain().is_empty());

    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Connected);
    assert_eq!(events.drain(), vec![Ok(())]);
}

#[tokio::test(start_paused = true)]
async fn test_status_133_without_quirk_fails() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    link.callbacks()
        .connection_state_changed(GattStatus::ERROR_133, LinkState::Disconnected);
    assert_eq!(link.call_count("reconnect"), 0);
    assert_eq!(events.drain(), vec![Err(Some(BluetoothError::ConnectionFailed))]);
}

#[tokio::test(start_paused = true)]
async fn test_events_from_previous_attempt_are_ignored() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let first = start_connect(&gatt);
    let stale = link.callbacks();
    stale.connection_state_changed(GattStatus::FAILURE, LinkState::Disconnected);
    assert_eq!(first.drain(), vec![Err(Some(BluetoothError::ConnectionFailed))]);

    let second = start_connect(&gatt);
    stale.connection_state_changed(GattStatus::SUCCESS, LinkState::Connected);
    assert_eq!(gatt.connection_state(), ConnectionState::Connecting);

    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Connected);
    assert_eq!(second.drain(), vec![Ok(())]);
}

#[tokio::test(start_paused = true)]
async fn test_operations_require_a_link() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let errors: Recorder<Option<BluetoothError>> = Recorder::new();

    let tx = errors.sender();
    gatt.discover_services(TIMEOUT, move |_, error| {
        let _ = tx.send(error);
    });
    assert_eq!(errors.drain(), vec![Some(BluetoothError::NotConnected)]);
    assert!(link.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_service_discovery_fills_peripheral() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let errors: Recorder<Option<BluetoothError>> = Recorder::new();

    let tx = errors.sender();
    gatt.discover_services(TIMEOUT, move |peripheral, error| {
        assert_eq!(peripheral.services.len(), 1);
        let _ = tx.send(error);
    });

    let characteristic = readable_characteristic();
    link.callbacks().services_discovered(
        GattStatus::SUCCESS,
        vec![GattService {
            uuid: characteristic.service_uuid,
            primary: true,
            characteristics: vec![characteristic.clone()],
        }],
    );
    assert_eq!(errors.drain(), vec![None]);
    assert_eq!(gatt.characteristic(&characteristic.uuid), Some(characteristic));
}

#[tokio::test(start_paused = true)]
async fn test_read_completes_with_value() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let characteristic = readable_characteristic();
    let reads = Recorder::new();
    let tx = reads.sender();

    gatt.read_characteristic(&characteristic, TIMEOUT, move |_, value, error| {
        let _ = tx.send((value, error));
    });
    assert_eq!(gatt.pending_transactions()[0].kind, TransactionKind::ReadCharacteristic);

    link.callbacks()
        .characteristic_read(characteristic.uuid, vec![0x64], GattStatus::SUCCESS);
    assert_eq!(reads.drain(), vec![(Some(vec![0x64]), None)]);
    assert!(gatt.pending_transactions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_status_maps_to_operation_failed() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let characteristic = readable_characteristic();
    let errors: Recorder<Option<BluetoothError>> = Recorder::new();

    let tx = errors.sender();
    gatt.write_characteristic(&characteristic, &[1, 2, 3], TIMEOUT, move |_, error| {
        let _ = tx.send(error);
    });
    link.callbacks()
        .characteristic_written(characteristic.uuid, GattStatus(3));

    assert_eq!(
        errors.drain(),
        vec![Some(BluetoothError::OperationFailed {
            method: "write_characteristic"
        })]
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_transaction_of_a_kind_is_rejected() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let characteristic = readable_characteristic();
    let first = Recorder::new();
    let second = Recorder::new();

    let tx = first.sender();
    gatt.read_characteristic(&characteristic, TIMEOUT, move |_, value, error| {
        let _ = tx.send((value, error));
    });
    let tx = second.sender();
    gatt.read_characteristic(&characteristic, TIMEOUT, move |_, value, error| {
        let _ = tx.send((value, error));
    });

    assert_eq!(
        second.drain(),
        vec![(None, Some(BluetoothError::Busy(TransactionKind::ReadCharacteristic)))]
    );
    assert_eq!(link.call_count("read_characteristic"), 1);

    link.callbacks()
        .characteristic_read(characteristic.uuid, vec![7], GattStatus::SUCCESS);
    assert_eq!(first.drain(), vec![(Some(vec![7]), None)]);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_and_late_completion_resolve_once() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let errors: Recorder<Option<BluetoothError>> = Recorder::new();

    let tx = errors.sender();
    gatt.read_rssi(TIMEOUT, move |_, _, error| {
        let _ = tx.send(error);
    });
    tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
    link.callbacks().rssi_read(-40, GattStatus::SUCCESS);

    assert_eq!(errors.drain(), vec![Some(BluetoothError::Timeout)]);
    assert!(gatt.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_completion_cancels_watchdog() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let mtus = Recorder::new();
    let tx = mtus.sender();

    gatt.request_mtu(247, TIMEOUT, move |_, mtu, error| {
        let _ = tx.send((mtu, error));
    });
    link.callbacks().mtu_changed(185, GattStatus::SUCCESS);
    tokio::time::sleep(TIMEOUT * 2).await;

    assert_eq!(mtus.drain(), vec![(Some(185), None)]);
}

#[tokio::test(start_paused = true)]
async fn test_requested_disconnect_reports_no_error() {
    let link = FakeGattLink::new();
    let (gatt, events) = connected(&link, GattOptions::default());

    gatt.disconnect();
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnecting);
    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Disconnected);

    assert_eq!(events.drain(), vec![Err(None)]);
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_disconnect_is_forced_after_timeout() {
    let link = FakeGattLink::new();
    let (gatt, events) = connected(&link, GattOptions::default());

    gatt.disconnect();
    tokio::time::sleep(GattOptions::default().disconnect_timeout + Duration::from_millis(1)).await;

    assert_eq!(events.drain(), vec![Err(None)]);
    assert_eq!(link.call_count("close"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    gatt.disconnect();
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnecting);
    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Disconnected);
    assert_eq!(events.drain(), vec![Err(None)]);

    // Neither the connect nor the disconnect watchdog fires afterwards
    tokio::time::sleep(GattOptions::default().disconnect_timeout * 2).await;
    assert!(events.drain().is_empty());
    assert!(gatt.pending_transactions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_disconnect_while_connecting_resolves_once() {
    let link = FakeGattLink::new();
    let gatt = sequencer(&link, GattOptions::default());
    let events = start_connect(&gatt);

    gatt.disconnect();
    tokio::time::sleep(GattOptions::default().disconnect_timeout + Duration::from_secs(1)).await;

    assert_eq!(events.drain(), vec![Err(None)]);
    assert_eq!(gatt.connection_state(), ConnectionState::Disconnected);
    assert_eq!(link.call_count("close"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_drop_fails_pending_operations() {
    let link = FakeGattLink::new();
    let (gatt, events) = connected(&link, GattOptions::default());
    let reads = Recorder::new();
    let tx = reads.sender();
    gatt.read_characteristic(&readable_characteristic(), TIMEOUT, move |_, value, error| {
        let _ = tx.send((value, error));
    });

    link.callbacks()
        .connection_state_changed(GattStatus(8), LinkState::Disconnected);

    let dropped = BluetoothError::Disconnected {
        reason: Some("gatt status 8".to_string()),
    };
    assert_eq!(reads.drain(), vec![(None, Some(dropped.clone()))]);
    assert_eq!(events.drain(), vec![Err(Some(dropped))]);
}

#[tokio::test(start_paused = true)]
async fn test_drop_without_status_has_no_reason() {
    let link = FakeGattLink::new();
    let (_gatt, events) = connected(&link, GattOptions::default());

    link.callbacks()
        .connection_state_changed(GattStatus::SUCCESS, LinkState::Disconnected);
    assert_eq!(events.drain(), vec![Err(Some(BluetoothError::Disconnected { reason: None }))]);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_notify_stops_when_registration_fails() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    link.reject("set_notification_registration");
    let errors: Recorder<Option<BluetoothError>> = Recorder::new();

    let tx = errors.sender();
    gatt.toggle_notify_state(&notify_characteristic(), true, TIMEOUT, None, move |_, error| {
        let _ = tx.send(error);
    });

    assert_eq!(
        errors.drain(),
        vec![Some(BluetoothError::OperationFailed {
            method: "set_notification_registration"
        })]
    );
    assert_eq!(link.call_count("write_descriptor"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_notify_writes_descriptor_and_routes_values() {
    let link = FakeGattLink::new();
    let (gatt, _events) = connected(&link, GattOptions::default());
    let characteristic = notify_characteristic();
    let errors: Recorder<Option<BluetoothError>> = Recorder::new();
    let values = Recorder::new();
    let value_tx = values.sender();
    let handler: NotifyHandler = Arc::new(move |uuid: &Uuid, value: &[u8]| {
        let _ = value_tx.send((*uuid, value.to_vec()));
    });

    let tx = errors.sender();
    gatt.toggle_notify_state(&characteristic, true, TIMEOUT, Some(handler), move |_, error| {
        let _ = tx.send(error);
    });
    assert_eq!(
        link.calls().last().cloned(),
        Some(format!("write_descriptor {} [01, 00]", CLIENT_CHARACTERISTIC_CONFIGURATION))
    );
    assert!(errors.drain().is_empty());

    link.callbacks()
        .descriptor_written(CLIENT_CHARACTERISTIC_CONFIGURATION, GattStatus::SUCCESS);
    assert_eq!(errors.drain(), vec![None]);

    link.callbacks().characteristic_changed(characteristic.uuid, &[0x16, 0x48]);
    assert_eq!(values.drain(), vec![(characteristic.uuid, vec![0x16, 0x48])]);
}
