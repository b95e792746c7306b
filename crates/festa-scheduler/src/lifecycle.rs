use std::sync::{Mutex, PoisonError};

use crate::error::{Result, SchedulerError};

/// Running flag shared by the three schedulers.
///
/// `start` is an idempotence guard, not a merge: a second start while running
/// is an error, and a failed load leaves the flag cleared so the caller can
/// retry.
pub(crate) struct RunFlag {
    name: &'static str,
    running: Mutex<bool>,
}

impl RunFlag {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(false),
        }
    }

    /// Run `load` with the flag held; mark running only if it succeeds.
    pub(crate) fn start_with<T>(&self, load: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if *running {
            return Err(SchedulerError::AlreadyRunning {
                scheduler: self.name,
            });
        }
        let value = load()?;
        *running = true;
        Ok(value)
    }

    /// Clear the flag; returns whether it was set.
    pub(crate) fn stop(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *running, false)
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
