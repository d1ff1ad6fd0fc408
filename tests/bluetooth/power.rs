use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use bluelink::bluetooth::{PowerManager, PowerState};
use bluelink::TimerRegistry;

use super::mocks::{MockPower, Recorder};

/// Mock adapter whose enabled flag the test controls
fn adapter(enabled: &Arc<AtomicBool>) -> MockPower {
    let mut power = MockPower::new();
    let flag = enabled.clone();
    power
        .expect_is_enabled()
        .returning(move || flag.load(Ordering::SeqCst));
    power
}

#[test]
fn test_turn_on_waits_for_confirmation() {
    let enabled = Arc::new(AtomicBool::new(false));
    let mut power = adapter(&enabled);
    power.expect_request_enable().times(1).returning(|| true);
    let manager = PowerManager::new(Arc::new(power));
    let results = Recorder::new();
    let tx = results.sender();

    manager.turn_on(move |success| {
        let _ = tx.send(success);
    });
    assert_eq!(manager.state(), PowerState::WaitingForPowerOn);
    assert!(results.drain().is_empty());

    // Reports for the other direction are not the awaited one
    manager.power_state_changed(false);
    assert!(results.drain().is_empty());

    enabled.store(true, Ordering::SeqCst);
    manager.power_state_changed(true);
    assert_eq!(results.drain(), vec![true]);
    assert_eq!(manager.state(), PowerState::Idle);
    assert!(manager.is_on());
}

#[test]
fn test_already_in_requested_state() {
    let enabled = Arc::new(AtomicBool::new(true));
    let mut power = adapter(&enabled);
    power.expect_request_enable().never();
    let manager = PowerManager::new(Arc::new(power));
    let results = Recorder::new();
    let tx = results.sender();

    manager.turn_on(move |success| {
        let _ = tx.send(success);
    });
    assert_eq!(results.drain(), vec![true]);
    assert_eq!(manager.state(), PowerState::Idle);
}

#[test]
fn test_second_toggle_rejected_while_waiting() {
    let enabled = Arc::new(AtomicBool::new(true));
    let mut power = adapter(&enabled);
    power.expect_request_disable().times(1).returning(|| true);
    let manager = PowerManager::new(Arc::new(power));
    let results = Recorder::new();

    let tx = results.sender();
    manager.turn_off(move |success| {
        let _ = tx.send(("first", success));
    });
    let tx = results.sender();
    manager.turn_on(move |success| {
        let _ = tx.send(("second", success));
    });
    assert_eq!(results.drain(), vec![("second", false)]);

    manager.power_state_changed(false);
    assert_eq!(results.drain(), vec![("first", true)]);
}

#[test]
fn test_platform_rejection_fails_the_toggle() {
    let enabled = Arc::new(AtomicBool::new(false));
    let mut power = adapter(&enabled);
    power.expect_request_enable().returning(|| false);
    let manager = PowerManager::new(Arc::new(power));
    let results = Recorder::new();
    let tx = results.sender();

    manager.turn_on(move |success| {
        let _ = tx.send(success);
    });
    assert_eq!(results.drain(), vec![false]);
    assert_eq!(manager.state(), PowerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fails_unconfirmed_toggle() {
    let enabled = Arc::new(AtomicBool::new(false));
    let mut power = adapter(&enabled);
    power.expect_request_enable().returning(|| true);
    let timeout = Duration::from_secs(10);
    let manager = PowerManager::with_watchdog(Arc::new(power), TimerRegistry::current(), timeout);
    let results = Recorder::new();
    let tx = results.sender();

    manager.turn_on(move |success| {
        let _ = tx.send(success);
    });
    tokio::time::sleep(timeout + Duration::from_millis(1)).await;
    assert_eq!(results.drain(), vec![false]);

    // The late confirmation has nothing left to resolve
    manager.power_state_changed(true);
    assert!(results.drain().is_empty());
    assert_eq!(manager.state(), PowerState::Idle);
}

#[test]
fn test_power_cycle_turns_off_then_on() {
    let enabled = Arc::new(AtomicBool::new(true));
    let mut power = adapter(&enabled);
    power.expect_request_disable().times(1).returning(|| true);
    power.expect_request_enable().times(1).returning(|| true);
    let manager = PowerManager::new(Arc::new(power));
    let results = Recorder::new();
    let tx = results.sender();

    manager.power_cycle(move |success| {
        let _ = tx.send(success);
    });
    assert_eq!(manager.state(), PowerState::WaitingForPowerOff);

    enabled.store(false, Ordering::SeqCst);
    manager.power_state_changed(false);
    assert_eq!(manager.state(), PowerState::WaitingForPowerOn);
    assert!(results.drain().is_empty());

    enabled.store(true, Ordering::SeqCst);
    manager.power_state_changed(true);
    assert_eq!(results.drain(), vec![true]);
}

#[test]
fn test_power_cycle_stops_when_off_fails() {
    let enabled = Arc::new(AtomicBool::new(true));
    let mut power = adapter(&enabled);
    power.expect_request_disable().returning(|| false);
    power.expect_request_enable().never();
    let manager = PowerManager::new(Arc::new(power));
    let results = Recorder::new();
    let tx = results.sender();

    manager.power_cycle(move |success| {
        let _ = tx.send(success);
    });
    assert_eq!(results.drain(), vec![false]);
}
