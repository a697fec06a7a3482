//! Cooperative shutdown handle shared by a job's lanes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Cloneable shutdown flag.
///
/// Set by the SIGTERM/SIGINT handler (or by tests); checked by lanes before
/// dequeuing work and by every long sleep.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown was requested
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Request shutdown
    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Set the flag, returning its previous value (for signal handlers).
    pub fn swap(&self) -> bool {
        self.flag.swap(true, Ordering::Relaxed)
    }

    /// Underlying flag, for registering with signal handlers
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    /// Sleep for `duration` in short slices.
    ///
    /// Returns `false` if shutdown was requested before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
