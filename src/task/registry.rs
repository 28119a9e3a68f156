//! Process-local registry of running channel drivers.
//!
//! Any number of handles may refer to the same logical name inside one
//! process, but only one set of drivers (and therefore one subscription per
//! channel) runs for it. The registry counts users per name, starts drivers
//! for the first one and stops them when the last one leaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::{debug, info};

use crate::driver::{Driver, DriverHandle};

struct Registration {
    usage: usize,
    drivers: Vec<DriverHandle>,
}

/// Reference-counted set of running drivers, keyed by name.
#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<String, Registration>>,
}

impl TaskRegistry {
    /// Creates an empty registry, independent of [`TaskRegistry::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<TaskRegistry> {
        static GLOBAL: OnceLock<Arc<TaskRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TaskRegistry::new())))
    }

    /// Registers a scheduler and consumer pair for a task name.
    ///
    /// Returns the usage count after registering.
    pub fn schedule(&self, name: &str, scheduler: Driver, consumer: Driver) -> usize {
        self.register(name, vec![scheduler, consumer])
    }

    /// Registers one more user of `name`.
    ///
    /// The first registration starts `drivers` on the current Tokio runtime.
    /// Later registrations only bump the count; their `drivers` are dropped
    /// without ever being started.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime while `name` is not yet
    /// registered.
    pub fn register(&self, name: &str, drivers: Vec<Driver>) -> usize {
        let mut entries = self.lock();

        if let Some(registration) = entries.get_mut(name) {
            registration.usage += 1;
            debug!(name = %name, usage = registration.usage, "Reusing running drivers");
            return registration.usage;
        }

        let drivers: Vec<DriverHandle> = drivers.into_iter().map(Driver::start).collect();
        info!(name = %name, drivers = drivers.len(), "Started drivers");
        entries.insert(name.to_string(), Registration { usage: 1, drivers });
        1
    }

    /// Releases one user of `name`; the last release stops its drivers.
    ///
    /// Returns the remaining usage count. Unknown names are ignored.
    pub fn remove(&self, name: &str) -> usize {
        let mut entries = self.lock();

        let Some(registration) = entries.get_mut(name) else {
            return 0;
        };

        registration.usage -= 1;
        if registration.usage > 0 {
            debug!(name = %name, usage = registration.usage, "Released drivers");
            return registration.usage;
        }

        if let Some(registration) = entries.remove(name) {
            for driver in &registration.drivers {
                driver.stop();
            }
            info!(name = %name, "Stopped drivers");
        }
        0
    }

    /// Current usage count of `name`.
    pub fn usage(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |r| r.usage)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("names", &self.names())
            .finish()
    }
}
