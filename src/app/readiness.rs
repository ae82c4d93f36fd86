use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::app::worker::CancelToken;

/// One-shot readiness flag for a launched server. The first `set` wins; waiters either block with a
/// bound or poll with an attempt budget.
#[derive(Clone, Default)]
pub struct ReadySignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually flipped the signal.
    pub fn set(&self) -> bool {
        let (lock, cv) = &*self.inner;
        let mut ready = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *ready {
            return false;
        }
        *ready = true;
        cv.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        let (lock, _) = &*self.inner;
        match lock.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cv) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut ready = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            ready = match cv.wait_timeout(ready, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Checks the signal up to `attempts` times, sleeping `interval` between checks.
    pub fn poll(&self, interval: Duration, attempts: u32, cancel: &CancelToken) -> bool {
        for _ in 0..attempts {
            if self.is_set() {
                return true;
            }
            if !cancel.sleep(interval) {
                return self.is_set();
            }
        }
        self.is_set()
    }
}
