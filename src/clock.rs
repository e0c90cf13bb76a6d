//! Time source used for byte spacing, read timeouts and the sampling schedule.
//!
//! All waiting goes through [`Clock`], so the procedure engine can be driven
//! by a virtual clock in tests without real delays.

/// Millisecond resolution instant.
pub type Instant = fugit::TimerInstantU64<1_000>;

/// Millisecond resolution duration.
pub type Duration = fugit::MillisDurationU64;

/// Zero length duration.
pub const ZERO: Duration = Duration::from_ticks(0);

/// A monotonic clock that can block the current thread.
pub trait Clock {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block for `duration`.
    fn delay(&mut self, duration: Duration);
}

/// Time elapsed from `earlier` to `later`, zero if `later` comes first.
pub fn saturating_since(later: Instant, earlier: Instant) -> Duration {
    later.checked_duration_since(earlier).unwrap_or(ZERO)
}

/// [`Clock`] backed by [`std::time::Instant`] and [`std::thread::sleep`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.origin.elapsed().as_millis();
        Instant::from_ticks(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn delay(&mut self, duration: Duration) {
        if duration > ZERO {
            std::thread::sleep(std::time::Duration::from_millis(duration.to_millis()));
        }
    }
}
