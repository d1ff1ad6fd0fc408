//! BLE scanner
//!
//! Raw scan results arrive on any platform thread through [`ScanResults`].
//! They are handed to the scanner's worker thread, turned into
//! [`Peripheral`] values by the configured [`PeripheralFactory`], run through
//! the filter chain and finally passed to the listener. Addresses that get an
//! `IgnoreForever` verdict are dropped without evaluation until the ignore
//! list is cleared or a new scan starts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use btleplug::api::BDAddr;
use log::{debug, info, trace, warn};

use crate::bluetooth::filter::{evaluate_chain, FilterChain, FilterVerdict};
use crate::bluetooth::peripheral::{Peripheral, PeripheralFactory, StandardPeripheralFactory};
use crate::bluetooth::platform::BleScanPlatform;
use crate::dispatch::{call_safely, invoke_safely, Worker};
use crate::error::{BluetoothError, ErrorContext};

/// Listener for discovered peripherals
pub type ScanListener = Arc<dyn Fn(&BleScanner, &Peripheral) + Send + Sync + 'static>;

/// Handle through which a [`BleScanPlatform`] delivers raw scan results
#[derive(Clone)]
pub struct ScanResults {
    inner: Weak<Inner>,
}

impl ScanResults {
    /// Deliver one advertisement; cheap, never blocks on filters
    pub fn deliver(&self, address: BDAddr, system_name: Option<String>, rssi: i16, raw_advertisement: Vec<u8>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.scanning.load(Ordering::SeqCst) {
            trace!("[BleScanner::deliver] not scanning, dropping {}", address);
            return;
        }

        let weak = self.inner.clone();
        inner.worker.submit(move || {
            if let Some(inner) = weak.upgrade() {
                inner.process(address, system_name, rssi, &raw_advertisement);
            }
        });
    }
}

/// Counters for one scanner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Sightings handed to the listener
    pub discovered: u64,
    /// Sightings dropped by a filter or the ignore list
    pub ignored: u64,
}

struct ScanSession {
    filters: Arc<FilterChain<Peripheral>>,
    listener: ScanListener,
}

struct Inner {
    platform: Arc<dyn BleScanPlatform>,
    factory: Arc<dyn PeripheralFactory>,
    worker: Worker,
    scanning: AtomicBool,
    session: Mutex<Option<ScanSession>>,
    ignored: Mutex<HashSet<BDAddr>>,
    discovered_count: AtomicU64,
    ignored_count: AtomicU64,
    this: Weak<Inner>,
}

/// BLE scanner
#[derive(Clone)]
pub struct BleScanner {
    inner: Arc<Inner>,
}

impl BleScanner {
    /// Create a scanner that builds peripherals with the standard factory
    pub fn new(platform: Arc<dyn BleScanPlatform>) -> Result<Self, BluetoothError> {
        Self::with_factory(platform, Arc::new(StandardPeripheralFactory::default()))
    }

    /// Create a scanner with a custom peripheral factory
    pub fn with_factory(
        platform: Arc<dyn BleScanPlatform>,
        factory: Arc<dyn PeripheralFactory>,
    ) -> Result<Self, BluetoothError> {
        let worker = Worker::spawn("ble-scanner")?;
        let inner = Arc::new_cyclic(|this| Inner {
            platform,
            factory,
            worker,
            scanning: AtomicBool::new(false),
            session: Mutex::new(None),
            ignored: Mutex::new(HashSet::new()),
            discovered_count: AtomicU64::new(0),
            ignored_count: AtomicU64::new(0),
            this: this.clone(),
        });
        Ok(Self { inner })
    }

    /// Start scanning
    ///
    /// Clears the ignore list. When a scan is already running, the new filters
    /// and listener take over without restarting the platform scan.
    pub fn start_scanning<L>(&self, filters: FilterChain<Peripheral>, listener: L) -> Result<(), BluetoothError>
    where
        L: Fn(&BleScanner, &Peripheral) + Send + Sync + 'static,
    {
        let ctx = ErrorContext::new("BleScanner", "start_scanning").with_metadata("filters", filters.len().to_string());

        self.clear_ignore_list();
        *self.inner.lock_session() = Some(ScanSession {
            filters: Arc::new(filters),
            listener: Arc::new(listener),
        });

        if self.inner.scanning.swap(true, Ordering::SeqCst) {
            debug!("{}already scanning, re-armed with new filters", ctx);
            return Ok(());
        }

        let results = ScanResults {
            inner: self.inner.this.clone(),
        };
        if let Err(e) = self.inner.platform.start_scan(results) {
            warn!("{}platform scan failed to start: {}", ctx, e);
            self.inner.scanning.store(false, Ordering::SeqCst);
            *self.inner.lock_session() = None;
            return Err(e);
        }

        info!("{}scan started", ctx);
        Ok(())
    }

    /// Stop scanning; delivery to the listener stops immediately
    pub fn stop_scanning(&self) {
        let ctx = ErrorContext::new("BleScanner", "stop_scanning");
        if !self.inner.scanning.swap(false, Ordering::SeqCst) {
            debug!("{}not scanning", ctx);
            return;
        }
        *self.inner.lock_session() = None;
        self.inner.platform.stop_scan();
        info!("{}scan stopped", ctx);
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Forget every address that was ignored for the session
    pub fn clear_ignore_list(&self) {
        self.inner.lock_ignored().clear();
    }

    pub fn is_ignored(&self, address: &BDAddr) -> bool {
        self.inner.lock_ignored().contains(address)
    }

    pub fn stats(&self) -> ScanStats {
        ScanStats {
            discovered: self.inner.discovered_count.load(Ordering::Relaxed),
            ignored: self.inner.ignored_count.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<ScanSession>> {
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

    /// Runs on the worker thread
    fn process(&self, address: BDAddr, system_name: Option<String>, rssi: i16, raw: &[u8]) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        if self.lock_ignored().contains(&address) {
            trace!("[BleScanner::process] {} is on the ignore list", address);
            self.ignored_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(peripheral) = call_safely("BleScanner::factory", || {
            self.factory.from_scan_result(address, system_name, rssi, raw)
        }) else {
            return;
        };

        let (filters, listener) = match self.lock_session().as_ref() {
            Some(session) => (session.filters.clone(), session.listener.clone()),
            None => return,
        };

        let Some(verdict) = call_safely("BleScanner::filters", || evaluate_chain(&filters, &peripheral)) else {
            return;
        };

        match verdict {
            FilterVerdict::Discover => {
                let Some(inner) = self.this.upgrade() else {
                    return;
                };
                if !self.scanning.load(Ordering::SeqCst) {
                    return;
                }
                self.discovered_count.fetch_add(1, Ordering::Relaxed);
                let scanner = BleScanner { inner };
                invoke_safely("BleScanner::listener", || listener(&scanner, &peripheral));
            }
            FilterVerdict::IgnoreOnce => {
                self.ignored_count.fetch_add(1, Ordering::Relaxed);
            }
            FilterVerdict::IgnoreForever => {
                debug!("[BleScanner::process] ignoring {} for this scan", address);
                self.ignored_count.fetch_add(1, Ordering::Relaxed);
                self.lock_ignored().insert(address);
            }
        }
    }
}
