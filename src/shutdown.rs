/// Cooperative shutdown flag shared by the daemon threads.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Stop everything because something fatal happened.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.request();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns `false` if the sleep was cut short. A duration too large to
    /// schedule waits for shutdown alone.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_requested() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    (deadline - now).min(SLEEP_SLICE)
                }
                None => SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }
}
