//! Runaway script guard.
//!
//! A [`Watchdog`] owns a background thread that samples whether script is
//! executing. When one outermost script call runs longer than the timeout it
//! raises the interrupt flag; the script runtime checks the flag at every
//! call boundary and fails the call. The flag is cleared when the outermost
//! call unwinds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug)]
struct Shared {
    /// Number of guarded calls on the stack.
    depth: AtomicU32,
    /// Bumped each time an outermost call starts.
    epoch: AtomicU64,
    interrupt: Arc<AtomicBool>,
    stop: AtomicBool,
}

/// Background thread interrupting script calls that run too long.
#[derive(Debug)]
pub struct Watchdog {
    shared: Arc<Shared>,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start the watchdog thread.
    pub fn spawn(timeout: Duration, tick: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            depth: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            interrupt: Arc::new(AtomicBool::new(false)),
            stop: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let tick = tick.max(Duration::from_millis(1));
        let handle = thread::Builder::new()
            .name("refbridge-watchdog".to_string())
            .spawn(move || Self::run(&worker, timeout, tick))?;
        debug!(target: "refbridge::watchdog", ?timeout, ?tick, "watchdog started");
        Ok(Self {
            shared,
            timeout,
            handle: Some(handle),
        })
    }

    fn run(shared: &Shared, timeout: Duration, tick: Duration) {
        let mut watched_epoch = 0;
        let mut elapsed = Duration::ZERO;
        while !shared.stop.load(Ordering::Acquire) {
            thread::park_timeout(tick);
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            let epoch = shared.epoch.load(Ordering::Acquire);
            if shared.depth.load(Ordering::Acquire) == 0 || epoch != watched_epoch {
                watched_epoch = epoch;
                elapsed = Duration::ZERO;
                continue;
            }
            elapsed += tick;
            if elapsed >= timeout && !shared.interrupt.swap(true, Ordering::AcqRel) {
                warn!(target: "refbridge::watchdog", ?elapsed, "script call timed out, interrupting");
            }
        }
    }

    /// The flag the script runtime polls.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.interrupt)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark a script call as executing until the guard drops.
    pub fn guard(&self) -> CallGuard {
        if self.shared.depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        }
        CallGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether a script call is being watched.
    pub fn is_executing(&self) -> bool {
        self.shared.depth.load(Ordering::Acquire) > 0
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!(target: "refbridge::watchdog", "watchdog thread panicked");
            }
        }
    }
}

/// Keeps a script call marked as executing.
#[derive(Debug)]
pub struct CallGuard {
    shared: Arc<Shared>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.shared.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.interrupt.store(false, Ordering::Release);
        }
    }
}
