//! Adapter power manager
//!
//! `Idle → WaitingForPowerOn → Idle` and `Idle → WaitingForPowerOff → Idle`.
//! A toggle resolves when the platform reports the awaited power state through
//! [`PowerManager::power_state_changed`]. Without a watchdog a toggle the
//! platform never confirms stays pending.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use crate::bluetooth::platform::AdapterPower;
use crate::dispatch::invoke_safely;
use crate::error::ErrorContext;
use crate::timer::TimerRegistry;

/// Receives whether a power toggle succeeded
pub type PowerDelegate = Box<dyn FnOnce(bool) + Send + 'static>;

const WATCHDOG_ID: &str = "adapter__power_toggle";

/// Power toggle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Idle,
    WaitingForPowerOn,
    WaitingForPowerOff,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Toggle {
    state: PowerState,
    /// Identifies the toggle a watchdog belongs to
    sequence: u64,
    delegate: Option<PowerDelegate>,
}

struct Watchdog {
    timers: Arc<TimerRegistry>,
    timeout: Duration,
}

struct Inner {
    adapter: Arc<dyn AdapterPower>,
    toggle: Mutex<Toggle>,
    watchdog: Option<Watchdog>,
    this: Weak<Inner>,
}

/// Turns the adapter on and off
#[derive(Clone)]
pub struct PowerManager {
    inner: Arc<Inner>,
}

impl PowerManager {
    pub fn new(adapter: Arc<dyn AdapterPower>) -> Self {
        Self::build(adapter, None)
    }

    /// Power manager whose toggles fail after `timeout` without confirmation
    pub fn with_watchdog(adapter: Arc<dyn AdapterPower>, timers: Arc<TimerRegistry>, timeout: Duration) -> Self {
        Self::build(adapter, Some(Watchdog { timers, timeout }))
    }

    fn build(adapter: Arc<dyn AdapterPower>, watchdog: Option<Watchdog>) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            adapter,
            toggle: Mutex::new(Toggle {
                state: PowerState::Idle,
                sequence: 0,
                delegate: None,
            }),
            watchdog,
            this: this.clone(),
        });
        Self { inner }
    }

    pub fn is_on(&self) -> bool {
        self.inner.adapter.is_enabled()
    }

    pub fn is_off(&self) -> bool {
        !self.is_on()
    }

    pub fn state(&self) -> PowerState {
        self.inner.lock_toggle().state
    }

    pub fn turn_on<F>(&self, delegate: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.inner.toggle(true, Box::new(delegate));
    }

    pub fn turn_off<F>(&self, delegate: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.inner.toggle(false, Box::new(delegate));
    }

    /// Turn the adapter off and, if that worked, back on
    pub fn power_cycle<F>(&self, delegate: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        self.turn_off(move |off| {
            if !off {
                warn!("[PowerManager::power_cycle] power off failed");
                delegate(false);
                return;
            }
            match weak.upgrade() {
                Some(inner) => inner.toggle(true, Box::new(delegate)),
                None => delegate(false),
            }
        });
    }

    /// Platform notification of the adapter's new power state
    pub fn power_state_changed(&self, enabled: bool) {
        let awaited = if enabled {
            PowerState::WaitingForPowerOn
        } else {
            PowerState::WaitingForPowerOff
        };
        debug!("[PowerManager::power_state_changed] adapter enabled: {}", enabled);
        self.inner.resolve(awaited, None, true);
    }
}

impl Inner {
    fn lock_toggle(&self) -> MutexGuard<'_, Toggle> {
        match self.toggle.lock() {
            Ok(toggle) => toggle,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn toggle(&self, on: bool, delegate: PowerDelegate) {
        let ctx = ErrorContext::new("PowerManager", if on { "turn_on" } else { "turn_off" });
        let awaited = if on {
            PowerState::WaitingForPowerOn
        } else {
            PowerState::WaitingForPowerOff
        };

        let already = self.adapter.is_enabled() == on;
        let (sequence, immediate) = {
            let mut toggle = self.lock_toggle();
            if toggle.state != PowerState::Idle {
                warn!("{}rejected while {}", ctx, toggle.state);
                (0, Some((delegate, false)))
            } else if already {
                debug!("{}already in the requested state", ctx);
                (0, Some((delegate, true)))
            } else {
                toggle.state = awaited;
                toggle.sequence += 1;
                toggle.delegate = Some(delegate);
                (toggle.sequence, None)
            }
        };

        if let Some((delegate, success)) = immediate {
            invoke_safely("PowerManager::delegate", || delegate(success));
            return;
        }

        if let Some(watchdog) = &self.watchdog {
            let weak = self.this.clone();
            watchdog.timers.start(WATCHDOG_ID, watchdog.timeout, false, None, move |_| {
                if let Some(inner) = weak.upgrade() {
                    warn!("[PowerManager::watchdog] power toggle not confirmed in time");
                    inner.resolve(awaited, Some(sequence), false);
                }
            });
        }

        let accepted = if on {
            self.adapter.request_enable()
        } else {
            self.adapter.request_disable()
        };
        if accepted {
            info!("{}waiting for the adapter", ctx);
        } else {
            warn!("{}platform rejected the request", ctx);
            self.resolve(awaited, Some(sequence), false);
        }
    }

    /// Finish the toggle waiting for `awaited`; `sequence` pins a specific one
    fn resolve(&self, awaited: PowerState, sequence: Option<u64>, success: bool) {
        let delegate = {
            let mut toggle = self.lock_toggle();
            if toggle.state != awaited || sequence.map_or(false, |s| s != toggle.sequence) {
                return;
            }
            toggle.state = PowerState::Idle;
            if let Some(watchdog) = &self.watchdog {
                watchdog.timers.cancel(WATCHDOG_ID);
            }
            toggle.delegate.take()
        };
        if let Some(delegate) = delegate {
            invoke_safely("PowerManager::delegate", || delegate(success));
        }
    }
}
