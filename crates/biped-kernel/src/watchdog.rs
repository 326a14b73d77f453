//! Tick deadline monitoring.
//!
//! [`StreakCounter`] counts consecutive occurrences of a condition and trips
//! once a threshold is reached; any non-occurrence resets it.
//! [`TickWatchdog`] uses one to turn per-tick durations into overrun verdicts.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use biped_kernel::watchdog::{TickVerdict, TickWatchdog};
//!
//! let mut wd = TickWatchdog::new(Duration::from_millis(20), Duration::from_millis(2), 2);
//!
//! assert_eq!(wd.observe(Duration::from_millis(19)), TickVerdict::OnTime);
//! assert!(matches!(wd.observe(Duration::from_millis(25)), TickVerdict::Overrun { streak: 1, .. }));
//! assert!(matches!(wd.observe(Duration::from_millis(25)), TickVerdict::Tripped { .. }));
//! ```

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// StreakCounter
// ─────────────────────────────────────────────────────────────────────────────

/// Counts consecutive hits; trips at `threshold`.
#[derive(Debug, Clone)]
pub struct StreakCounter {
    threshold: u32,
    count: u32,
}

impl StreakCounter {
    /// A `threshold` of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Record a hit (`true`) or a miss (`false`).  Returns `true` once the
    /// streak reaches the threshold.
    pub fn record(&mut self, hit: bool) -> bool {
        if hit {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 0;
        }
        self.tripped()
    }

    pub fn tripped(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TickWatchdog
// ─────────────────────────────────────────────────────────────────────────────

/// Verdict for one completed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    OnTime,
    /// The tick ran past `period + tolerance`.
    Overrun { excess: Duration, streak: u32 },
    /// This overrun completed a streak of `max_consecutive` overruns.
    Tripped { excess: Duration, streak: u32 },
}

/// Flags ticks that run past `period + tolerance`, and trips after
/// `max_consecutive` such ticks in a row.
#[derive(Debug, Clone)]
pub struct TickWatchdog {
    deadline: Duration,
    streak: StreakCounter,
    total_overruns: u64,
}

impl TickWatchdog {
    pub fn new(period: Duration, tolerance: Duration, max_consecutive: u32) -> Self {
        Self {
            deadline: period + tolerance,
            streak: StreakCounter::new(max_consecutive),
            total_overruns: 0,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Classify a tick that took `elapsed`.
    pub fn observe(&mut self, elapsed: Duration) -> TickVerdict {
        let overran = elapsed > self.deadline;
        let tripped = self.streak.record(overran);
        if !overran {
            return TickVerdict::OnTime;
        }
        self.total_overruns += 1;
        let excess = elapsed - self.deadline;
        let streak = self.streak.count();
        if tripped {
            TickVerdict::Tripped { excess, streak }
        } else {
            TickVerdict::Overrun { excess, streak }
        }
    }

    /// Current run of consecutive overruns.
    pub fn streak(&self) -> u32 {
        self.streak.count()
    }

    pub fn total_overruns(&self) -> u64 {
        self.total_overruns
    }

    /// Clear the streak (e.g. after a reset out of SAFE_STOP).
    pub fn reset(&mut self) {
        self.streak.reset();
    }
}
