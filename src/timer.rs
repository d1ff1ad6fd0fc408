//! Named watchdog timers
//!
//! The registry is an explicitly owned object (usually one per process, shared
//! through an `Arc`) instead of a global map, so tests get isolated registries.
//! Timers run as tokio tasks on the runtime handle the registry was built with.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::dispatch::invoke_safely;
use crate::error::ErrorContext;

/// Opaque payload handed back to the fire callback
pub type TimerUserInfo = Arc<dyn Any + Send + Sync>;

/// Callback invoked when a timer fires
pub type TimerCallback = Arc<dyn Fn(&Timer) + Send + Sync>;

/// Snapshot of a registered timer
#[derive(Clone)]
pub struct Timer {
    /// Registry key
    pub id: String,
    /// Delay before the first fire and between repeats
    pub interval: Duration,
    /// Whether the timer re-arms after firing
    pub repeat: bool,
    /// Caller payload
    pub user_info: Option<TimerUserInfo>,
    /// When the timer was armed
    pub started_at: DateTime<Utc>,
    /// Number of times the timer has fired so far
    pub fire_count: u64,
}

impl Timer {
    /// Downcast the payload to a concrete type
    pub fn user_info_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_info.as_ref().and_then(|info| info.downcast_ref::<T>())
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("repeat", &self.repeat)
            .field("has_user_info", &self.user_info.is_some())
            .field("started_at", &self.started_at)
            .field("fire_count", &self.fire_count)
            .finish()
    }
}

struct Entry {
    timer: Timer,
    generation: u64,
    task: JoinHandle<()>,
}

/// Registry of named timers
pub struct TimerRegistry {
    /// Runtime the timer tasks are spawned on
    runtime: Handle,
    /// Active timers by id
    entries: Mutex<HashMap<String, Entry>>,
    /// Monotonic stamp that tells a live timer from one it superseded
    next_generation: AtomicU64,
    /// Back-reference handed to timer tasks
    this: Weak<TimerRegistry>,
}

impl TimerRegistry {
    /// Create a registry whose timers run on `runtime`
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            runtime,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Create a registry on the runtime of the calling task
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Arc<Self> {
        Self::new(Handle::current())
    }

    /// Arm a timer, cancelling any timer already registered under `id`
    pub fn start<F>(
        &self,
        id: impl Into<String>,
        interval: Duration,
        repeat: bool,
        user_info: Option<TimerUserInfo>,
        on_fire: F,
    ) where
        F: Fn(&Timer) + Send + Sync + 'static,
    {
        let id = id.into();
        let ctx = ErrorContext::new("TimerRegistry", "start").with_metadata("id", id.as_str());
        let on_fire: TimerCallback = Arc::new(on_fire);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let timer = Timer {
            id: id.clone(),
            interval,
            repeat,
            user_info,
            started_at: Utc::now(),
            fire_count: 0,
        };

        // The task is spawned while the map is locked, so it cannot claim its
        // entry before the entry exists.
        let mut entries = self.lock_entries();
        if let Some(previous) = entries.remove(&id) {
            debug!("{}replacing active timer", ctx);
            previous.task.abort();
        }

        let registry = self.this.clone();
        let task_id = id.clone();
        let task = self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let Some(timer) = registry.claim(&task_id, generation) else {
                    return;
                };
                drop(registry);

                trace!("[TimerRegistry::fire id={}] firing (count {})", timer.id, timer.fire_count);
                invoke_safely(&timer.id, || on_fire(&timer));

                if !timer.repeat {
                    return;
                }
            }
        });

        debug!("{}armed for {:?} (repeat: {})", ctx, interval, repeat);
        entries.insert(id, Entry { timer, generation, task });
    }

    /// Cancel a timer; does nothing when `id` is not registered
    pub fn cancel(&self, id: &str) {
        if let Some(entry) = self.lock_entries().remove(id) {
            entry.task.abort();
            debug!("[TimerRegistry::cancel id={}] cancelled", id);
        }
    }

    /// Cancel every registered timer
    pub fn cancel_all(&self) {
        let drained: Vec<Entry> = self.lock_entries().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.task.abort();
        }
    }

    /// Look up an active timer
    pub fn find(&self, id: &str) -> Option<Timer> {
        self.lock_entries().get(id).map(|entry| entry.timer.clone())
    }

    /// All active timers
    pub fn list_active(&self) -> Vec<Timer> {
        self.lock_entries()
            .values()
            .map(|entry| entry.timer.clone())
            .collect()
    }

    /// Whether `id` is currently registered
    pub fn is_active(&self, id: &str) -> bool {
        self.lock_entries().contains_key(id)
    }

    /// Take ownership of a firing: one-shot timers leave the registry here,
    /// before their callback runs. Returns `None` for a superseded task.
    fn claim(&self, id: &str, generation: u64) -> Option<Timer> {
        let mut entries = self.lock_entries();
        match entries.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.timer.fire_count += 1;
                if entry.timer.repeat {
                    Some(entry.timer.clone())
                } else {
                    entries.remove(id).map(|entry| entry.timer)
                }
            }
            _ => None,
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        let entries = match self.entries.get_mut() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
    }
}
