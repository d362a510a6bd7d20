//! Auto-off timer
//!
//! Counts down once per second and runs an expiry action when the count
//! runs out. The action returns `0` when it is done, or a number of seconds
//! after which it wants to be retried; a retry restarts the countdown
//! without an external [`AutoOffTimer::start`].
//!
//! The counting rules live in [`Countdown`], which has no clock and can be
//! stepped by hand. [`AutoOffTimer`] drives it from a tokio task.
//!
//! ```text
//!   start()            tick (remaining <= 0)        action -> n > 0
//! Stopped ──► Running ─────────────────────► Expired ─────────────► Retrying(n)
//!    ▲                                          │                       │
//!    └──────────────── action -> 0 ─────────────┘        next tick ─────┘──► Running
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

/// Tick period
pub const TICK: Duration = Duration::from_secs(1);

/// Lifecycle of a countdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Not counting
    Stopped,
    /// Counting down
    Running,
    /// Count ran out; waiting for the expiry action's verdict
    Expired,
    /// Expiry action asked to be retried after this many seconds
    Retrying(u32),
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Timer is not counting; nothing happened
    Idle,
    /// Still counting; seconds left after this tick
    Counting(i64),
    /// Count ran out; the expiry action must run and be resolved
    Expired,
}

/// Clock-free countdown
///
/// The remaining count is checked before it is decremented, so a total of
/// `n` lets `n` ticks pass and expires on tick `n + 1`. The tick that
/// expires decrements too, after the action has been resolved.
#[derive(Debug, Clone)]
pub struct Countdown {
    total: u32,
    remaining: i64,
    phase: TimerPhase,
}

impl Countdown {
    /// Create a stopped countdown of `total` seconds
    pub fn new(total: u32) -> Self {
        Self {
            total,
            remaining: i64::from(total),
            phase: TimerPhase::Stopped,
        }
    }

    /// Configured total
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Seconds left (negative once expired)
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Current phase
    pub fn phase(&self) -> TimerPhase {
        self.phase
    }

    /// Counting, including a pending retry
    pub fn is_running(&self) -> bool {
        matches!(self.phase, TimerPhase::Running | TimerPhase::Retrying(_))
    }

    /// Reset to the configured total and start counting
    pub fn start(&mut self) {
        self.remaining = i64::from(self.total);
        self.phase = TimerPhase::Running;
    }

    /// Stop counting
    pub fn stop(&mut self) {
        self.phase = TimerPhase::Stopped;
    }

    /// Advance by one tick
    pub fn tick(&mut self) -> Tick {
        match self.phase {
            TimerPhase::Running => {}
            TimerPhase::Retrying(_) => self.phase = TimerPhase::Running,
            TimerPhase::Stopped | TimerPhase::Expired => return Tick::Idle,
        }

        if self.remaining <= 0 {
            self.phase = TimerPhase::Expired;
            return Tick::Expired;
        }

        self.remaining -= 1;
        Tick::Counting(self.remaining)
    }

    /// Apply the expiry action's result and finish the expiring tick
    ///
    /// Ignored unless the countdown is [`TimerPhase::Expired`], so a
    /// `start` or `stop` issued while the action ran wins.
    pub fn resolve(&mut self, retry_secs: u32) {
        if self.phase != TimerPhase::Expired {
            return;
        }

        if retry_secs > 0 {
            self.remaining = i64::from(retry_secs);
            self.phase = TimerPhase::Retrying(retry_secs);
        } else {
            self.phase = TimerPhase::Stopped;
        }
        self.remaining -= 1;
    }
}

type ExpiryAction = Box<dyn FnMut() -> u32 + Send>;

struct Shared {
    countdown: Countdown,
    task: Option<JoinHandle<()>>,
}

/// Countdown timer that turns the meter off after a period of inactivity
///
/// At most one tick task exists per timer. Dropping the timer aborts it.
pub struct AutoOffTimer {
    shared: Arc<Mutex<Shared>>,
    action: Arc<Mutex<ExpiryAction>>,
}

impl AutoOffTimer {
    /// Create a stopped timer of `total_secs` seconds
    ///
    /// `action` runs on expiry and returns `0` when done or a retry delay
    /// in seconds.
    pub fn new<F>(total_secs: u32, action: F) -> Self
    where
        F: FnMut() -> u32 + Send + 'static,
    {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                countdown: Countdown::new(total_secs),
                task: None,
            })),
            action: Arc::new(Mutex::new(Box::new(action))),
        }
    }

    /// Reset the countdown and make sure a tick task is running
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut shared = self.shared.lock();
        shared.countdown.start();

        let ticking = shared.task.as_ref().is_some_and(|task| !task.is_finished());
        if ticking {
            debug!(total = shared.countdown.total(), "Auto-off timer reset");
            return;
        }

        info!(total = shared.countdown.total(), "Auto-off timer started");
        shared.task = Some(tokio::spawn(ticker(
            Arc::clone(&self.shared),
            Arc::clone(&self.action),
        )));
    }

    /// Stop the countdown; idempotent
    pub fn stop(&self) {
        let mut shared = self.shared.lock();
        shared.countdown.stop();
        if let Some(task) = shared.task.take() {
            task.abort();
            debug!("Auto-off timer stopped");
        }
    }

    /// Whether the countdown is running
    pub fn is_running(&self) -> bool {
        self.shared.lock().countdown.is_running()
    }

    /// Seconds left
    pub fn remaining(&self) -> i64 {
        self.shared.lock().countdown.remaining()
    }

    /// Current phase
    pub fn phase(&self) -> TimerPhase {
        self.shared.lock().countdown.phase()
    }
}

impl Drop for AutoOffTimer {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock().task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AutoOffTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoOffTimer")
            .field("countdown", &self.shared.lock().countdown)
            .finish_non_exhaustive()
    }
}

async fn ticker(shared: Arc<Mutex<Shared>>, action: Arc<Mutex<ExpiryAction>>) {
    let mut interval = interval_at(Instant::now() + TICK, TICK);

    loop {
        interval.tick().await;

        let tick = shared.lock().countdown.tick();
        match tick {
            Tick::Idle => break,
            Tick::Counting(remaining) => {
                debug!(remaining, "Auto-off tick");
                continue;
            }
            Tick::Expired => {}
        }

        // Runs without the countdown lock so the action may start or stop the timer
        info!("Auto-off timer expired");
        let retry = {
            let mut action = action.lock();
            (*action)()
        };

        let mut state = shared.lock();
        state.countdown.resolve(retry);
        match state.countdown.phase() {
            TimerPhase::Retrying(secs) => info!(retry_secs = secs, "Auto-off action will retry"),
            TimerPhase::Stopped => {
                state.task = None;
                break;
            }
            TimerPhase::Running | TimerPhase::Expired => {}
        }
    }
}
