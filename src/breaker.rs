//! Per-instance circuit breaker
//!
//! Three-state breaker (Closed/Open/HalfOpen) over a sliding window of
//! per-second success/fail buckets. Opening is decided by a user-supplied
//! predicate over the window; recovery requires a streak of consecutive
//! successes while half-open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Clock abstraction so breaker timing can be faked in tests
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A single-second success/fail tally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub success: u64,
    pub fail: u64,
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Decides, on a failure while closed, whether the window justifies opening
pub type OpenPredicate = Arc<dyn Fn(&[Bucket]) -> bool + Send + Sync>;

/// Configuration for a circuit breaker
#[derive(Clone)]
pub struct BreakerOptions {
    /// Time spent fully open before a half-open trial is allowed
    pub open_duration: Duration,
    /// Consecutive half-open successes required to close again. The streak
    /// must strictly exceed this value, i.e. closing takes `threshold + 1`
    /// successes; configure `n - 1` for exactly-`n` semantics.
    pub recover_threshold: u32,
    /// Number of one-second buckets kept in the window
    pub window_size: usize,
    /// Consulted only while closed, on each recorded failure
    pub should_open: OpenPredicate,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            open_duration: Duration::from_secs(5),
            recover_threshold: 100,
            window_size: 60,
            should_open: Arc::new(default_should_open),
        }
    }
}

/// Default opening policy: at least 5 observations with both outcomes
/// present, and failures outnumbering successes by 20% or more
pub fn default_should_open(buckets: &[Bucket]) -> bool {
    let success: u64 = buckets.iter().map(|b| b.success).sum();
    let fail: u64 = buckets.iter().map(|b| b.fail).sum();
    fail != 0 && success != 0 && fail + success >= 5 && fail as f64 >= 1.2 * success as f64
}

struct BreakerCore {
    status: BreakerStatus,
    /// `buckets[window_size - 1]` is the current second
    buckets: Vec<Bucket>,
    last_update_ms: u64,
    opened_at_ms: u64,
    half_open_streak: u32,
}

/// Per-instance three-state circuit breaker
pub struct Breaker {
    label: String,
    options: BreakerOptions,
    clock: Arc<dyn Clock>,
    core: Mutex<BreakerCore>,
}

impl Breaker {
    pub fn new(label: impl Into<String>, options: BreakerOptions) -> Self {
        Self::with_clock(label, options, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock(
        label: impl Into<String>,
        options: BreakerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window = options.window_size.max(1);
        Self {
            label: label.into(),
            core: Mutex::new(BreakerCore {
                status: BreakerStatus::Closed,
                buckets: vec![Bucket::default(); window],
                last_update_ms: clock.now_millis(),
                opened_at_ms: 0,
                half_open_streak: 0,
            }),
            options: BreakerOptions {
                window_size: window,
                ..options
            },
            clock,
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shift the window up to `now` and run the open → half-open timer.
    /// Idempotent for a fixed `now`.
    fn advance(&self, core: &mut BreakerCore, now_ms: u64) {
        let window = self.options.window_size;
        let elapsed_secs = (now_ms.saturating_sub(core.last_update_ms) / 1000) as usize;

        if elapsed_secs >= window {
            // The whole window has elapsed; zero in place instead of churning
            // the allocation.
            for bucket in &mut core.buckets {
                *bucket = Bucket::default();
            }
        } else if elapsed_secs > 0 {
            core.buckets.drain(..elapsed_secs);
            core.buckets.resize_with(window, Bucket::default);
        }

        if core.status == BreakerStatus::Open
            && now_ms.saturating_sub(core.opened_at_ms) > self.options.open_duration.as_millis() as u64
        {
            core.status = BreakerStatus::HalfOpen;
            core.half_open_streak = 0;
            tracing::info!(instance = %self.label, "circuit breaker half-open, allowing trials");
        }

        core.last_update_ms = now_ms;
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut core = self.locked();
        self.advance(&mut core, now);

        if let Some(bucket) = core.buckets.last_mut() {
            bucket.success += 1;
        }

        if core.status == BreakerStatus::HalfOpen {
            core.half_open_streak += 1;
            if core.half_open_streak > self.options.recover_threshold {
                core.status = BreakerStatus::Closed;
                // Fresh start: the window tallies belong to the broken period.
                for bucket in &mut core.buckets {
                    *bucket = Bucket::default();
                }
                tracing::info!(instance = %self.label, "circuit breaker closed, instance recovered");
            }
        }
    }

    /// Record a failed operation
    pub fn record_fail(&self) {
        let now = self.clock.now_millis();
        let mut core = self.locked();
        self.advance(&mut core, now);

        if let Some(bucket) = core.buckets.last_mut() {
            bucket.fail += 1;
        }

        let trip = match core.status {
            // Any failure during a half-open trial reopens immediately.
            BreakerStatus::HalfOpen => true,
            BreakerStatus::Closed => (self.options.should_open)(&core.buckets),
            BreakerStatus::Open => false,
        };

        if trip {
            core.status = BreakerStatus::Open;
            core.opened_at_ms = now;
            tracing::warn!(instance = %self.label, "circuit breaker opened, isolating instance");
        }
    }

    /// Whether requests may be sent to this instance
    pub fn ok(&self) -> bool {
        self.status() != BreakerStatus::Open
    }

    /// Current status, after advancing the window
    pub fn status(&self) -> BreakerStatus {
        let now = self.clock.now_millis();
        let mut core = self.locked();
        self.advance(&mut core, now);
        core.status
    }

    #[cfg(test)]
    fn window_len(&self) -> usize {
        self.locked().buckets.len()
    }

    #[cfg(test)]
    fn totals(&self) -> (u64, u64) {
        let core = self.locked();
        (
            core.buckets.iter().map(|b| b.success).sum(),
            core.buckets.iter().map(|b| b.fail).sum(),
        )
    }
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.locked();
        f.debug_struct("Breaker")
            .field("label", &self.label)
            .field("status", &core.status)
            .finish()
    }
}
