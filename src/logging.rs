//! Logging for bluelink
//!
//! A `log::Log` implementation with timestamps, colored console output, an
//! optional log file and per-category debug flags. Warnings and errors always
//! pass the level check; debug lines additionally need their category enabled.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, Once, RwLock};
use std::time::Instant;

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LogLevel;

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Global initialization guard
static INIT_LOGGER: Once = Once::new();

/// Debug flag categories for selective logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    pub timers: bool,  // Timer registry, watchdog arming and firing
    pub scanner: bool, // BLE and Classic scanning, filters, advertisement parsing
    pub gatt: bool,    // GATT sequencer, transactions, btleplug backend
    pub session: bool, // Classic pairing, SDP, SPP sockets
    pub power: bool,   // Adapter power toggles
    pub config: bool,  // Configuration and metadata store
    pub all: bool,     // Enable all debug output
}

impl DebugFlags {
    /// Flags with every category enabled
    pub fn everything() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Enable categories from names such as `gatt` or `session`
    ///
    /// Unknown names are returned so the caller can report them.
    pub fn enable<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        let mut unknown = Vec::new();
        for name in names {
            match name.trim() {
                "timers" => self.timers = true,
                "scanner" => self.scanner = true,
                "gatt" => self.gatt = true,
                "session" => self.session = true,
                "power" => self.power = true,
                "config" => self.config = true,
                "all" => self.all = true,
                "" => {}
                _ => unknown.push(name),
            }
        }
        unknown
    }
}

/// Global debug flags storage
static DEBUG_FLAGS: RwLock<DebugFlags> = RwLock::new(DebugFlags {
    timers: false,
    scanner: false,
    gatt: false,
    session: false,
    power: false,
    config: false,
    all: false,
});

/// Errors from logger setup
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    CreateDirectory(#[source] io::Error),

    #[error("Failed to open log file: {0}")]
    OpenFile(#[source] io::Error),

    #[error("Failed to set logger: {0}")]
    SetLogger(#[from] log::SetLoggerError),
}

/// The crate's logger
pub struct BluelinkLogger {
    /// File output for logs
    file: Option<Mutex<File>>,
    /// Log level filter
    level: LevelFilter,
    /// Whether to output to stderr
    console_output: bool,
}

impl log::Log for BluelinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() <= Level::Warn {
            return metadata.level() <= self.level;
        }

        if metadata.level() > self.level {
            return false;
        }

        if metadata.level() == Level::Debug {
            return should_log_debug(metadata.target());
        }

        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format(TIMESTAMP_FORMAT);

        let level_str = match record.level() {
            Level::Error => "\x1B[31mERROR\x1B[0m", // Red
            Level::Warn => "\x1B[33mWARN \x1B[0m",  // Yellow
            Level::Info => "\x1B[32mINFO \x1B[0m",  // Green
            Level::Debug => "\x1B[36mDEBUG\x1B[0m", // Cyan
            Level::Trace => "\x1B[90mTRACE\x1B[0m", // Gray
        };

        let module = record.module_path().unwrap_or("<unknown>");
        let file_info = format!(
            "{}:{}",
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0)
        );

        if self.console_output {
            let console_entry = format!(
                "[{}] {} [{}] [{}] {}\n",
                timestamp,
                level_str,
                module,
                file_info,
                record.args()
            );
            let _ = io::stderr().write_all(console_entry.as_bytes());
        }

        if let Some(file) = &self.file {
            let file_entry = format!(
                "[{}] {} [{}] [{}] {}\n",
                timestamp,
                record.level(),
                module,
                file_info,
                record.args()
            );
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(file_entry.as_bytes());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Configure logging with the specified level and optionally a log file
///
/// Only the first call installs a logger; later calls return `Ok(())`.
pub fn configure_logging(
    level: LogLevel,
    log_file: Option<PathBuf>,
    console_output: bool,
) -> Result<(), LoggingError> {
    let mut result = Ok(());

    INIT_LOGGER.call_once(|| {
        let level_filter = LevelFilter::from(level);

        let file = match &log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            result = Err(LoggingError::CreateDirectory(e));
                            return;
                        }
                    }
                }

                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => Some(Mutex::new(file)),
                    Err(e) => {
                        result = Err(LoggingError::OpenFile(e));
                        return;
                    }
                }
            }
            None => None,
        };

        let logger = Box::new(BluelinkLogger {
            file,
            level: level_filter,
            console_output,
        });

        if let Err(e) = log::set_boxed_logger(logger) {
            result = Err(e.into());
            return;
        }

        log::set_max_level(level_filter);

        log::info!("Logging initialized at level: {}", level);
        if let Some(path) = log_file {
            log::info!("Log file: {}", path.display());
        }
    });

    result
}

/// Set global debug flags for selective logging
pub fn set_debug_flags(flags: DebugFlags) {
    if let Ok(mut debug_flags) = DEBUG_FLAGS.write() {
        *debug_flags = flags;
    }
}

/// Whether debug lines from `module_path` are enabled
pub fn should_log_debug(module_path: &str) -> bool {
    let Ok(flags) = DEBUG_FLAGS.read() else {
        return false;
    };
    if flags.all {
        return true;
    }

    let component = module_path.rsplit("::").next().unwrap_or(module_path);
    match component {
        "timer" => flags.timers,
        "scanner" | "classic_scanner" | "filter" | "peripheral" | "advertisement" | "scanner_config" => {
            flags.scanner
        }
        "gatt" | "transaction" | "btleplug_backend" => flags.gatt,
        "session" => flags.session,
        "power" => flags.power,
        "config" | "bluetooth_config" | "store" => flags.config,
        _ => false,
    }
}

/// Times an operation and logs the elapsed time at debug level
pub struct PerformanceLogger {
    /// Operation being timed
    operation: String,
    /// Component performing the operation
    component: String,
    /// Start time
    start_time: Instant,
}

impl PerformanceLogger {
    /// Start timing
    pub fn new<S: Into<String>>(component: S, operation: S) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            start_time: Instant::now(),
        }
    }

    /// Finish timing and log result
    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        log::debug!(
            "[{}::{}] Operation completed in {:?}",
            self.component,
            self.operation,
            duration
        );
    }

    /// Finish timing with additional context
    pub fn finish_with_context(self, context: &str) {
        let duration = self.start_time.elapsed();
        log::debug!(
            "[{}::{}] Operation '{}' completed in {:?}",
            self.component,
            self.operation,
            context,
            duration
        );
    }
}
