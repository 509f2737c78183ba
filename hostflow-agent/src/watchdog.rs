//! Liveness heartbeat between long-running workers and an external watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Inner {
    origin: Instant,
    last_beat_ns: AtomicU64,
}

/// Cloneable handle; workers call `beat`, the watchdog reads `age`.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<Inner>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat {
            inner: Arc::new(Inner {
                origin: Instant::now(),
                last_beat_ns: AtomicU64::new(0),
            }),
        }
    }

    pub fn beat(&self) {
        let elapsed = u64::try_from(self.inner.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.inner.last_beat_ns.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last beat (or since creation if there was none).
    pub fn age(&self) -> Duration {
        let last = Duration::from_nanos(self.inner.last_beat_ns.load(Ordering::Relaxed));
        self.inner.origin.elapsed().saturating_sub(last)
    }
}
