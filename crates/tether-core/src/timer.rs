//! Retry timer with backoff.
//!
//! Each [`RetryTimer::schedule_timeout`] increments the attempt counter and
//! arms a single-shot timer whose delay comes from the backoff function.
//! Only one firing is ever pending: scheduling again supersedes the
//! previous one, and [`RetryTimer::reset`] cancels it and clears the
//! counter.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Callback invoked when the timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Maps the attempt number (starting at 1) to a delay.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

struct Shared {
    callback: TimerCallback,
    backoff: Backoff,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    tries: u32,
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Single-shot timer with an attempt counter.
pub struct RetryTimer {
    shared: Arc<Shared>,
}

impl RetryTimer {
    /// Create an idle timer.
    pub fn new(callback: TimerCallback, backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                callback,
                backoff,
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    /// Number of attempts scheduled since the last reset.
    #[must_use]
    pub fn tries(&self) -> u32 {
        self.shared.state.lock().tries
    }

    /// Check if a firing is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.state.lock().handle.is_some()
    }

    /// Cancel any pending firing and clear the attempt counter.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.tries = 0;
        state.generation += 1;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    /// Arm the timer for the next attempt and return its delay.
    ///
    /// Must be called from within a Tokio runtime. Outside of one the
    /// attempt is counted but nothing fires.
    pub fn schedule_timeout(&self) -> Duration {
        let mut state = self.shared.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.tries = state.tries.saturating_add(1);
        state.generation += 1;

        let generation = state.generation;
        let delay = (self.shared.backoff)(state.tries);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("Retry timer scheduled outside of a Tokio runtime; it will not fire");
                return delay;
            }
        };

        let shared = Arc::downgrade(&self.shared);
        state.handle = Some(runtime.spawn(fire_after(shared, generation, delay)));
        delay
    }
}

async fn fire_after(shared: Weak<Shared>, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    {
        let mut state = shared.state.lock();
        if state.generation != generation {
            return;
        }
        state.handle = None;
    }
    (shared.callback)();
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.state.lock().handle.take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for RetryTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("RetryTimer")
            .field("tries", &state.tries)
            .field("pending", &state.handle.is_some())
            .finish()
    }
}
