//! Cooperative shutdown signaling shared by every worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A process-wide cancellation token.
///
/// Workers poll the token at batch boundaries and inside every sleep, finish
/// their in-flight batch, persist their checkpoints, and exit.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request shutdown across all workers holding a clone of this token.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if shutdown is requested.
    ///
    /// The flag is checked at one-second granularity. Returns `false` when
    /// the sleep was cut short by shutdown.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::from_secs(0) {
            if self.is_triggered() {
                return false;
            }
            let step = remaining.min(Duration::from_secs(1));
            thread::sleep(step);
            remaining -= step;
        }
        !self.is_triggered()
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}
