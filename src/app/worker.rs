use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Cooperative stop flag shared between a worker and whoever owns it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is cancelled along with `self` and every token `self` descends from, but can
    /// also be cancelled on its own.
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self
                .ancestors
                .iter()
                .any(|ancestor| ancestor.load(Ordering::Relaxed))
    }

    /// Sleeps for `duration` in short slices. Returns `false` if cancelled before it elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < duration {
            if self.is_cancelled() {
                return false;
            }
            let remaining = duration.saturating_sub(start.elapsed());
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
        !self.is_cancelled()
    }
}

/// Something a session can watch and interrupt: the launcher thread behind a stream, a fake in
/// tests.
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
    fn interrupt(&self);
}

pub struct WorkerHandle {
    cancel: CancelToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(
        name: String,
        cancel: CancelToken,
        job: impl FnOnce(CancelToken) + Send + 'static,
    ) -> std::io::Result<Self> {
        let token = cancel.clone();
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || job(token))?;
        Ok(Self { cancel, join })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn join(self) -> bool {
        self.join.join().is_ok()
    }
}

impl Liveness for WorkerHandle {
    fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    fn interrupt(&self) {
        self.cancel.cancel();
    }
}
