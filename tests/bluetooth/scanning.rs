use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use btleplug::api::BDAddr;
use pretty_assertions::assert_eq;

use bluelink::bluetooth::{
    BleScanner, ClassicDevice, ClassicScanState, ClassicScanner, DiscoveryFilter, FilterChain, FilterVerdict,
    FunctionFilter, Peripheral, ScanConfig, ScanStats,
};
use bluelink::BluetoothError;

use super::mocks::{named_advertisement, test_address, FakeDiscoveryPlatform, FakeScanPlatform, Recorder};

fn ignore_forever(address: BDAddr, evaluations: &Arc<AtomicUsize>) -> Box<dyn DiscoveryFilter<Peripheral>> {
    let evaluations = evaluations.clone();
    Box::new(FunctionFilter::new(move |peripheral: &Peripheral| {
        if peripheral.address == address {
            evaluations.fetch_add(1, Ordering::SeqCst);
            FilterVerdict::IgnoreForever
        } else {
            FilterVerdict::Discover
        }
    }))
}

#[test]
fn test_delivers_parsed_peripherals() {
    let platform = FakeScanPlatform::new();
    let scanner = BleScanner::new(platform.clone()).unwrap();
    let found = Recorder::new();
    let sender = found.sender();

    scanner
        .start_scanning(Vec::new(), move |_, peripheral| {
            let _ = sender.send(peripheral.clone());
        })
        .unwrap();
    assert!(scanner.is_scanning());
    assert_eq!(platform.starts(), 1);

    platform
        .results()
        .deliver(test_address(1), None, -42, named_advertisement("Sensor"));

    let peripheral = found.next();
    assert_eq!(peripheral.address, test_address(1));
    assert_eq!(peripheral.name(), Some("Sensor"));
    assert_eq!(peripheral.rssi, -42);
}

#[test]
fn test_ignored_address_is_not_reevaluated() {
    let platform = FakeScanPlatform::new();
    let scanner = BleScanner::new(platform.clone()).unwrap();
    let evaluations = Arc::new(AtomicUsize::new(0));
    let found = Recorder::new();
    let sender = found.sender();

    let chain: FilterChain<Peripheral> = vec![ignore_forever(test_address(1), &evaluations)];
    scanner
        .start_scanning(chain, move |_, peripheral| {
            let _ = sender.send(peripheral.address);
        })
        .unwrap();

    let results = platform.results();
    results.deliver(test_address(1), None, -50, Vec::new());
    results.deliver(test_address(1), None, -50, Vec::new());
    results.deliver(test_address(1), None, -50, Vec::new());
    results.deliver(test_address(2), None, -50, Vec::new());

    // Results are processed in order, so the first three are done
    assert_eq!(found.next(), test_address(2));
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    assert!(scanner.is_ignored(&test_address(1)));
    assert_eq!(scanner.stats(), ScanStats { discovered: 1, ignored: 3 });

    scanner.clear_ignore_list();
    results.deliver(test_address(1), None, -50, Vec::new());
    results.deliver(test_address(2), None, -50, Vec::new());
    assert_eq!(found.next(), test_address(2));
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    found.assert_quiet();
}

#[test]
fn test_restart_clears_ignore_list_and_swaps_filters() {
    let platform = FakeScanPlatform::new();
    let scanner = BleScanner::new(platform.clone()).unwrap();
    let evaluations = Arc::new(AtomicUsize::new(0));

    scanner
        .start_scanning(vec![ignore_forever(test_address(1), &evaluations)], |_, _| {})
        .unwrap();
    platform.results().deliver(test_address(1), None, -50, Vec::new());

    let found = Recorder::new();
    let sender = found.sender();
    // Wait until the first result went through before re-arming
    while !scanner.is_ignored(&test_address(1)) {
        std::thread::yield_now();
    }
    scanner
        .start_scanning(Vec::new(), move |_, peripheral| {
            let _ = sender.send(peripheral.address);
        })
        .unwrap();

    assert!(!scanner.is_ignored(&test_address(1)));
    assert_eq!(platform.starts(), 1, "platform scan keeps running");
    platform.results().deliver(test_address(1), None, -50, Vec::new());
    assert_eq!(found.next(), test_address(1));
}

#[test]
fn test_rssi_filter_from_config_ignores_one_sighting() {
    let platform = FakeScanPlatform::new();
    let scanner = BleScanner::new(platform.clone()).unwrap();
    let found = Recorder::new();
    let sender = found.sender();

    let chain = ScanConfig::new().with_min_rssi(Some(-70)).filters::<Peripheral>();
    scanner
        .start_scanning(chain, move |_, peripheral| {
            let _ = sender.send(peripheral.rssi);
        })
        .unwrap();

    let results = platform.results();
    results.deliver(test_address(1), None, -90, Vec::new());
    results.deliver(test_address(1), None, -60, Vec::new());

    assert_eq!(found.next(), -60);
    assert!(!scanner.is_ignored(&test_address(1)));
}

#[test]
fn test_stop_scanning_stops_delivery() {
    let platform = FakeScanPlatform::new();
    let scanner = BleScanner::new(platform.clone()).unwrap();
    let found = Recorder::new();
    let sender = found.sender();

    scanner
        .start_scanning(Vec::new(), move |_, peripheral| {
            let _ = sender.send(peripheral.address);
        })
        .unwrap();
    let results = platform.results();
    scanner.stop_scanning();
    scanner.stop_scanning();

    results.deliver(test_address(1), None, -50, Vec::new());
    assert!(!scanner.is_scanning());
    assert_eq!(platform.stops(), 1);
    found.assert_quiet();
}

#[test]
fn test_start_failure_is_reported() {
    let platform = FakeScanPlatform::new();
    platform.fail_next_start();
    let scanner = BleScanner::new(platform.clone()).unwrap();

    let result = scanner.start_scanning(Vec::new(), |_, _| {});
    assert!(matches!(result, Err(BluetoothError::AdapterUnavailable(_))));
    assert!(!scanner.is_scanning());
}

#[test]
fn test_panicking_listener_does_not_stop_the_scanner() {
    let platform = FakeScanPlatform::new();
    let scanner = BleScanner::new(platform.clone()).unwrap();
    let found = Recorder::new();
    let sender = found.sender();

    scanner
        .start_scanning(Vec::new(), move |_, peripheral| {
            if peripheral.address == test_address(1) {
                panic!("listener bug");
            }
            let _ = sender.send(peripheral.address);
        })
        .unwrap();

    let results = platform.results();
    results.deliver(test_address(1), None, -50, Vec::new());
    results.deliver(test_address(2), None, -50, Vec::new());
    assert_eq!(found.next(), test_address(2));
}

#[test]
fn test_classic_discovery_delivers_devices() {
    let platform = FakeDiscoveryPlatform::new();
    let scanner = ClassicScanner::new(platform.clone()).unwrap();
    let found = Recorder::new();
    let sender = found.sender();

    scanner
        .start_scanning(Vec::new(), move |_, device| {
            let _ = sender.send(device.clone());
        })
        .unwrap();
    assert_eq!(scanner.state(), ClassicScanState::Discovering);

    platform
        .events()
        .device_found(ClassicDevice::new(test_address(7), Some("Printer".to_string())).with_rssi(-55));

    let device = found.next();
    assert_eq!(device.address, test_address(7));
    assert_eq!(device.rssi, Some(-55));
}

#[test]
fn test_classic_discovery_restarts_until_stopped() {
    let platform = FakeDiscoveryPlatform::new();
    let scanner = ClassicScanner::new(platform.clone()).unwrap();
    scanner.start_scanning(Vec::new(), |_, _| {}).unwrap();

    // Inquiry ended on its own while armed
    platform.events().discovery_finished();
    assert_eq!(platform.starts(), 2);
    assert_eq!(scanner.state(), ClassicScanState::Discovering);

    scanner.stop_scanning();
    assert_eq!(platform.cancels(), 1);
    assert_eq!(scanner.state(), ClassicScanState::StoppingDiscovery);
    assert!(!scanner.is_scanning());

    platform.events().discovery_finished();
    assert_eq!(scanner.state(), ClassicScanState::Idle);
    assert_eq!(platform.starts(), 2);
}

#[test]
fn test_classic_start_while_stopping_restarts_after_stop() {
    let platform = FakeDiscoveryPlatform::new();
    let scanner = ClassicScanner::new(platform.clone()).unwrap();
    scanner.start_scanning(Vec::new(), |_, _| {}).unwrap();
    scanner.stop_scanning();

    scanner.start_scanning(Vec::new(), |_, _| {}).unwrap();
    assert_eq!(scanner.state(), ClassicScanState::StoppingDiscovery);
    assert_eq!(platform.starts(), 1);

    platform.events().discovery_finished();
    assert_eq!(scanner.state(), ClassicScanState::Discovering);
    assert_eq!(platform.starts(), 2);
}
