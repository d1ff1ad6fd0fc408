//! Execution helpers shared by scanners, sequencers and the timer registry
//!
//! - [`Worker`]: one dedicated background thread fed by a crossbeam queue
//! - [`OnceDelegate`]: a completion slot that can be taken exactly once
//! - [`invoke_safely`] / [`call_safely`]: run caller-supplied code and swallow panics

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use log::{debug, error, warn};

use crate::error::BluetoothError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Run `f`, catching and logging any panic it raises
///
/// Delegates, filters and timer callbacks are application code; a panic in
/// one of them must never unwind into a platform callback or kill a worker.
pub fn invoke_safely<F: FnOnce()>(context: &str, f: F) {
    call_safely(context, f);
}

/// Like [`invoke_safely`], returning `None` when `f` panicked
pub fn call_safely<R, F: FnOnce() -> R>(context: &str, f: F) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!("[{}] callback panicked: {}", context, panic_message(panic.as_ref()));
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// A single background thread that runs submitted jobs in order
pub struct Worker {
    /// Thread name, also used as log context
    name: String,
    /// Job queue; dropped to stop the thread
    sender: Option<Sender<Job>>,
    /// Handle kept so the thread is not reported as leaked
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a named worker thread
    pub fn spawn(name: impl Into<String>) -> Result<Self, BluetoothError> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver.iter() {
                    invoke_safely(&thread_name, job);
                }
                debug!("[{}] worker queue closed", thread_name);
            })
            .map_err(|e| {
                error!("[{}] failed to spawn worker thread: {}", name, e);
                BluetoothError::failed("spawn_worker")
            })?;

        Ok(Self {
            name,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue a job; returns false when the worker has shut down
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(sender) => {
                if sender.send(Box::new(job)).is_err() {
                    warn!("[{}] worker is gone, dropping job", self.name);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Name of the worker thread
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Closing the queue ends the thread once pending jobs are done. The
        // last owner may be a job on this very thread, so never join here.
        self.sender.take();
        self.handle.take();
    }
}

/// Completion slot that yields its value at most once
///
/// Competing completions (platform callback, watchdog, teardown) all call
/// [`OnceDelegate::take`]; the mutex makes the take an atomic exchange so
/// exactly one of them wins.
pub struct OnceDelegate<T> {
    slot: Mutex<Option<T>>,
}

impl<T> OnceDelegate<T> {
    /// Create a slot holding `value`
    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(Some(value)),
        }
    }

    /// Create an empty slot
    pub fn empty() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store a value, returning the one it replaced
    pub fn replace(&self, value: T) -> Option<T> {
        match self.slot.lock() {
            Ok(mut slot) => slot.replace(value),
            Err(poisoned) => poisoned.into_inner().replace(value),
        }
    }

    /// Take the value if it has not been taken yet
    pub fn take(&self) -> Option<T> {
        match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Whether a value is still waiting to be taken
    pub fn is_set(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

impl<T> Default for OnceDelegate<T> {
    fn default() -> Self {
        Self::empty()
    }
}
