use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::warn;

use crate::app::registry::{hold, KeyedLocks};

pub struct GlobalSemaphore {
    limit: usize,
    used: Mutex<usize>,
    cv: Condvar,
}

impl GlobalSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            used: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> GlobalPermit {
        let mut used = self.count();
        while *used >= self.limit {
            used = match self.cv.wait(used) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *used += 1;
        GlobalPermit {
            semaphore: Arc::clone(self),
        }
    }

    pub fn in_use(&self) -> usize {
        *self.count()
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        match self.used.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self) {
        let mut used = self.count();
        *used = used.saturating_sub(1);
        self.cv.notify_one();
    }
}

pub struct GlobalPermit {
    semaphore: Arc<GlobalSemaphore>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Bounded pool for fire-and-forget device work. Every task holds a global permit while it runs;
/// device tasks additionally serialise on the device's lock.
pub struct TaskScheduler {
    global: Arc<GlobalSemaphore>,
    device_locks: KeyedLocks,
}

impl TaskScheduler {
    pub fn new(global_limit: usize) -> Self {
        Self {
            global: Arc::new(GlobalSemaphore::new(global_limit)),
            device_locks: KeyedLocks::default(),
        }
    }

    pub fn acquire_global(&self) -> GlobalPermit {
        self.global.acquire()
    }

    pub fn device_lock(&self, serial: &str) -> Arc<Mutex<()>> {
        self.device_locks.lock_for(serial)
    }

    /// Runs `job` on its own thread once a global permit is free.
    pub fn spawn(
        &self,
        name: String,
        job: impl FnOnce() + Send + 'static,
    ) -> Option<JoinHandle<()>> {
        let global = Arc::clone(&self.global);
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let _permit = global.acquire();
            job();
        });
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(task = %name, error = %err, "failed to spawn scheduled task");
                None
            }
        }
    }

    /// Like [`TaskScheduler::spawn`] but never overlaps with other tasks for the same serial.
    pub fn spawn_device_task(
        &self,
        serial: &str,
        name: String,
        job: impl FnOnce() + Send + 'static,
    ) -> Option<JoinHandle<()>> {
        let lock = self.device_lock(serial);
        self.spawn(name, move || {
            let _guard = hold(&lock);
            job();
        })
    }
}
