use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use log::{info, warn};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use bluelink::bluetooth::address::parse_bdaddr;
use bluelink::bluetooth::btleplug_backend::{first_adapter, BtleplugGattLink, BtleplugScanPlatform};
use bluelink::bluetooth::{BleScanner, GattSequencer, Peripheral};
use bluelink::config::BluetoothConfig;
use bluelink::dispatch::OnceDelegate;
use bluelink::logging::{configure_logging, set_debug_flags, PerformanceLogger};
use bluelink::store::{record_peripheral, JsonFileStore, MetadataStore};
use bluelink::{BluetoothError, TimerRegistry};

/// Comma separated debug categories, e.g. `gatt,timers`
const DEBUG_ENV: &str = "BLUELINK_DEBUG";

#[tokio::main]
async fn main() -> Result<()> {
    let config = BluetoothConfig::load_or_default();

    let mut flags = config.debug;
    if let Ok(categories) = std::env::var(DEBUG_ENV) {
        for unknown in flags.enable(categories.split(',')) {
            eprintln!("Unknown debug category: {}", unknown);
        }
    }
    set_debug_flags(flags);
    configure_logging(config.log_level, config.log_file.clone(), true)?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("scan") => {
            let duration = match args.get(2) {
                Some(seconds) => Duration::from_secs(seconds.parse().context("scan duration must be whole seconds")?),
                None => config.scan.scan_duration,
            };
            scan(&config, duration).await
        }
        Some("connect") => {
            let Some(address) = args.get(2) else {
                print_usage();
                bail!("connect needs a device address");
            };
            connect(&config, address).await
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("\nUsage:");
    println!("  bluelink scan [seconds]    - Scan for BLE peripherals and record them");
    println!("  bluelink connect <address> - Connect and list the GATT services");
    println!("\nSet {}=gatt,scanner,... to enable debug categories", DEBUG_ENV);
}

async fn scan(config: &BluetoothConfig, duration: Duration) -> Result<()> {
    let perf = PerformanceLogger::new("bluelink", "scan");
    let adapter = first_adapter().await?;
    let scanner = BleScanner::new(BtleplugScanPlatform::new(adapter, Handle::current()))?;

    let store = Arc::new(JsonFileStore::open(JsonFileStore::default_path())?);
    let listener_store = store.clone();
    scanner.start_scanning(config.scan.filters::<Peripheral>(), move |_, peripheral| {
        println!("{}", peripheral);
        if let Err(e) = record_peripheral(listener_store.as_ref(), peripheral) {
            warn!("[bluelink::scan] could not record {}: {}", peripheral.address, e);
        }
    })?;

    println!("Scanning for {:?} (Ctrl+C to stop)...", duration);
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }
    scanner.stop_scanning();

    let stats = scanner.stats();
    println!(
        "Done: {} sightings reported, {} ignored, {} devices recorded in {}",
        stats.discovered,
        stats.ignored,
        store.keys().len(),
        store.path().display()
    );
    perf.finish();
    Ok(())
}

/// Scan until btleplug knows the peripheral with `address`
async fn find_peripheral(
    adapter: &Adapter,
    address: btleplug::api::BDAddr,
    timeout: Duration,
) -> Result<btleplug::platform::Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let found = tokio::time::timeout(timeout, async {
        loop {
            for peripheral in adapter.peripherals().await.unwrap_or_default() {
                if peripheral.address() == address {
                    return peripheral;
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await;
    if let Err(e) = adapter.stop_scan().await {
        warn!("[bluelink::connect] failed to stop scan: {}", e);
    }
    found.map_err(|_| anyhow!("{} not found within {:?}", address, timeout))
}

async fn connect(config: &BluetoothConfig, address: &str) -> Result<()> {
    let address = parse_bdaddr(address).map_err(|e| anyhow!(e))?;
    let timeouts = &config.timeouts;

    let adapter = first_adapter().await?;
    let platform_peripheral = find_peripheral(&adapter, address, config.scan.scan_duration).await?;
    let rssi = match platform_peripheral.properties().await? {
        Some(properties) => properties.rssi.unwrap_or_default(),
        None => 0,
    };

    let link = BtleplugGattLink::new(adapter, platform_peripheral, Handle::current());
    let gatt = GattSequencer::new(
        Peripheral::new(address, None, rssi, &[]),
        link,
        TimerRegistry::current(),
        config.gatt_options(),
    );

    let (connected_tx, connected_rx) = oneshot::channel::<Option<BluetoothError>>();
    let (closed_tx, closed_rx) = oneshot::channel::<Option<BluetoothError>>();
    let connected = Arc::new(OnceDelegate::new(connected_tx));
    let on_link_down = connected.clone();
    let closed = OnceDelegate::new(closed_tx);

    info!("[bluelink::connect] connecting to {}", address);
    gatt.connect(
        false,
        timeouts.connect,
        move |_| {
            if let Some(tx) = connected.take() {
                let _ = tx.send(None);
            }
        },
        move |_, error| {
            // Before link up this resolves the attempt, afterwards it reports the close
            if let Some(tx) = on_link_down.take() {
                let _ = tx.send(Some(error.unwrap_or(BluetoothError::ConnectionFailed)));
            } else if let Some(tx) = closed.take() {
                let _ = tx.send(error);
            }
        },
    );

    if let Some(error) = connected_rx.await.context("connect attempt abandoned")? {
        bail!("could not connect to {}: {}", address, error);
    }
    println!("Connected to {}", address);

    let (discovered_tx, discovered_rx) = oneshot::channel();
    gatt.discover_services(timeouts.discover_services, move |peripheral, error| {
        let _ = discovered_tx.send(error.map(Err).unwrap_or_else(|| Ok(peripheral.services.clone())));
    });
    match discovered_rx.await.context("service discovery abandoned")? {
        Ok(services) => {
            for service in services {
                println!("Service {}{}", service.uuid, if service.primary { " (primary)" } else { "" });
                for characteristic in &service.characteristics {
                    println!("  Characteristic {} {:?}", characteristic.uuid, characteristic.properties);
                }
            }
        }
        Err(e) => warn!("[bluelink::connect] service discovery failed: {}", e),
    }

    gatt.disconnect();
    match tokio::time::timeout(timeouts.disconnect + Duration::from_secs(1), closed_rx).await {
        Ok(Ok(None)) => println!("Disconnected"),
        Ok(Ok(Some(e))) => println!("Link ended: {}", e),
        _ => warn!("[bluelink::connect] no disconnect confirmation"),
    }
    Ok(())
}
