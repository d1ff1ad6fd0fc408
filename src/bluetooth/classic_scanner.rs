//! Classic (inquiry) scanner
//!
//! `Idle → Discovering → StoppingDiscovery → Idle`. Stopping is asynchronous:
//! the platform confirms through [`DiscoveryEvents::discovery_finished`].
//! Inquiry that ends on its own while the scanner is still armed is restarted,
//! so discovery stays continuous until `stop_scanning`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use btleplug::api::BDAddr;
use log::{debug, info, trace, warn};

use crate::bluetooth::classic_device::ClassicDevice;
use crate::bluetooth::filter::{evaluate_chain, FilterChain, FilterVerdict};
use crate::bluetooth::platform::ClassicDiscoveryPlatform;
use crate::dispatch::{call_safely, invoke_safely, Worker};
use crate::error::{BluetoothError, ErrorContext};

/// Listener for discovered Classic devices
pub type DiscoveryListener = Arc<dyn Fn(&ClassicScanner, &ClassicDevice) + Send + Sync + 'static>;

/// Discovery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassicScanState {
    Idle,
    Discovering,
    StoppingDiscovery,
}

impl fmt::Display for ClassicScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handle through which a [`ClassicDiscoveryPlatform`] reports inquiry events
#[derive(Clone)]
pub struct DiscoveryEvents {
    inner: Weak<Inner>,
}

impl DiscoveryEvents {
    pub fn device_found(&self, device: ClassicDevice) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.armed.load(Ordering::SeqCst) {
            trace!("[ClassicScanner::device_found] not scanning, dropping {}", device.address);
            return;
        }
        let weak = self.inner.clone();
        inner.worker.submit(move || {
            if let Some(inner) = weak.upgrade() {
                inner.process(device);
            }
        });
    }

    /// The platform ended an inquiry, on request or on its own
    pub fn discovery_finished(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_discovery_finished();
        }
    }
}

struct DiscoverySession {
    filters: Arc<FilterChain<ClassicDevice>>,
    listener: DiscoveryListener,
}

struct Inner {
    platform: Arc<dyn ClassicDiscoveryPlatform>,
    worker: Worker,
    state: Mutex<ClassicScanState>,
    /// True from `start_scanning` until `stop_scanning`
    armed: AtomicBool,
    session: Mutex<Option<DiscoverySession>>,
    ignored: Mutex<HashSet<BDAddr>>,
    this: Weak<Inner>,
}

/// Classic Bluetooth discovery with the same filter model as [`BleScanner`]
///
/// [`BleScanner`]: crate::bluetooth::BleScanner
#[derive(Clone)]
pub struct ClassicScanner {
    inner: Arc<Inner>,
}

impl ClassicScanner {
    pub fn new(platform: Arc<dyn ClassicDiscoveryPlatform>) -> Result<Self, BluetoothError> {
        let worker = Worker::spawn("classic-scanner")?;
        let inner = Arc::new_cyclic(|this| Inner {
            platform,
            worker,
            state: Mutex::new(ClassicScanState::Idle),
            armed: AtomicBool::new(false),
            session: Mutex::new(None),
            ignored: Mutex::new(HashSet::new()),
            this: this.clone(),
        });
        Ok(Self { inner })
    }

    /// Start continuous discovery
    pub fn start_scanning<L>(&self, filters: FilterChain<ClassicDevice>, listener: L) -> Result<(), BluetoothError>
    where
        L: Fn(&ClassicScanner, &ClassicDevice) + Send + Sync + 'static,
    {
        let ctx = ErrorContext::new("ClassicScanner", "start_scanning");

        self.clear_ignore_list();
        *self.inner.lock_session() = Some(DiscoverySession {
            filters: Arc::new(filters),
            listener: Arc::new(listener),
        });

        {
            let mut state = self.inner.lock_state();
            self.inner.armed.store(true, Ordering::SeqCst);
            match *state {
                ClassicScanState::Discovering => {
                    debug!("{}already discovering, re-armed with new filters", ctx);
                    return Ok(());
                }
                ClassicScanState::StoppingDiscovery => {
                    debug!("{}stop in progress, discovery restarts once it finishes", ctx);
                    return Ok(());
                }
                ClassicScanState::Idle => *state = ClassicScanState::Discovering,
            }
        }

        if !self.inner.platform.start_discovery(self.inner.events()) {
            warn!("{}platform rejected discovery", ctx);
            self.inner.armed.store(false, Ordering::SeqCst);
            *self.inner.lock_state() = ClassicScanState::Idle;
            *self.inner.lock_session() = None;
            return Err(BluetoothError::failed("start_discovery"));
        }

        info!("{}discovery started", ctx);
        Ok(())
    }

    /// Stop discovery; delivery stops immediately, the platform confirms later
    pub fn stop_scanning(&self) {
        let ctx = ErrorContext::new("ClassicScanner", "stop_scanning");
        if !self.inner.armed.swap(false, Ordering::SeqCst) {
            debug!("{}not scanning", ctx);
            return;
        }
        *self.inner.lock_session() = None;

        let cancel = {
            let mut state = self.inner.lock_state();
            if *state == ClassicScanState::Discovering {
                *state = ClassicScanState::StoppingDiscovery;
                true
            } else {
                false
            }
        };

        if cancel && !self.inner.platform.cancel_discovery() {
            warn!("{}platform rejected cancel, treating discovery as stopped", ctx);
            *self.inner.lock_state() = ClassicScanState::Idle;
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ClassicScanState {
        *self.inner.lock_state()
    }

    pub fn clear_ignore_list(&self) {
        self.inner.lock_ignored().clear();
    }

    pub fn is_ignored(&self, address: &BDAddr) -> bool {
        self.inner.lock_ignored().contains(address)
    }
}

impl Inner {
    fn events(&self) -> DiscoveryEvents {
        DiscoveryEvents {
            inner: self.this.clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ClassicScanState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<DiscoverySession>> {
        match self.session.lock() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_ignored(&self) -> MutexGuard<'_, HashSet<BDAddr>> {
        match self.ignored.lock() {
            Ok(ignored) => ignored,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn on_discovery_finished(&self) {
        let ctx = ErrorContext::new("ClassicScanner", "discovery_finished");
        let restart = {
            let mut state = self.lock_state();
            let armed = self.armed.load(Ordering::SeqCst);
            match (*state, armed) {
                (ClassicScanState::Idle, _) => {
                    debug!("{}ignored while idle", ctx);
                    false
                }
                (_, false) => {
                    *state = ClassicScanState::Idle;
                    info!("{}discovery stopped", ctx);
                    false
                }
                (_, true) => {
                    *state = ClassicScanState::Discovering;
                    true
                }
            }
        };

        if restart {
            debug!("{}still armed, restarting inquiry", ctx);
            if !self.platform.start_discovery(self.events()) {
                warn!("{}platform rejected restart, scanner is now idle", ctx);
                self.armed.store(false, Ordering::SeqCst);
                *self.lock_state() = ClassicScanState::Idle;
                *self.lock_session() = None;
            }
        }
    }

    /// Runs on the worker thread
    fn process(&self, device: ClassicDevice) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }
        if self.lock_ignored().contains(&device.address) {
            trace!("[ClassicScanner::process] {} is on the ignore list", device.address);
            return;
        }

        let (filters, listener) = match self.lock_session().as_ref() {
            Some(session) => (session.filters.clone(), session.listener.clone()),
            None => return,
        };

        let Some(verdict) = call_safely("ClassicScanner::filters", || evaluate_chain(&filters, &device)) else {
            return;
        };

        match verdict {
            FilterVerdict::Discover => {
                let Some(inner) = self.this.upgrade() else {
                    return;
                };
                if !self.armed.load(Ordering::SeqCst) {
                    return;
                }
                let scanner = ClassicScanner { inner };
                invoke_safely("ClassicScanner::listener", || listener(&scanner, &device));
            }
            FilterVerdict::IgnoreOnce => {}
            FilterVerdict::IgnoreForever => {
                debug!("[ClassicScanner::process] ignoring {} for this scan", device.address);
                self.lock_ignored().insert(device.address);
            }
        }
    }
}
