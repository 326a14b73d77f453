//! Tick timing statistics.

use std::time::Duration;

use serde::Serialize;

/// Running min/mean/max of tick compute time plus achieved frequency.
#[derive(Debug, Clone, Default)]
pub struct TickStats {
    ticks: u64,
    overruns: u64,
    min: Option<Duration>,
    max: Duration,
    total: Duration,
    first_start: Option<Duration>,
    last_start: Duration,
}

/// Serializable view of [`TickStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TickStatsSnapshot {
    pub ticks: u64,
    pub overruns: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    /// Tick starts per second over the whole run.
    pub achieved_hz: f64,
}

impl TickStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tick that started at `started` and took `elapsed`.
    pub fn record(&mut self, started: Duration, elapsed: Duration, overrun: bool) {
        self.ticks += 1;
        if overrun {
            self.overruns += 1;
        }
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        self.first_start.get_or_insert(started);
        self.last_start = started;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn snapshot(&self) -> TickStatsSnapshot {
        let ms = |d: Duration| d.as_secs_f64() * 1_000.0;
        let mean = if self.ticks == 0 {
            0.0
        } else {
            ms(self.total) / self.ticks as f64
        };
        let span = self
            .first_start
            .map(|first| self.last_start.saturating_sub(first).as_secs_f64())
            .unwrap_or(0.0);
        let achieved_hz = if self.ticks > 1 && span > 0.0 {
            (self.ticks - 1) as f64 / span
        } else {
            0.0
        };
        TickStatsSnapshot {
            ticks: self.ticks,
            overruns: self.overruns,
            min_ms: self.min.map(ms).unwrap_or(0.0),
            mean_ms: mean,
            max_ms: ms(self.max),
            achieved_hz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_is_zeroed() {
        assert_eq!(TickStats::new().snapshot(), TickStatsSnapshot::default());
    }

    #[test]
    fn min_mean_max_and_frequency() {
        let mut stats = TickStats::new();
        let ms = Duration::from_millis;
        stats.record(ms(0), ms(4), false);
        stats.record(ms(20), ms(8), false);
        stats.record(ms(40), ms(30), true);
        let snap = stats.snapshot();
        assert_eq!(snap.ticks, 3);
        assert_eq!(snap.overruns, 1);
        assert!((snap.min_ms - 4.0).abs() < 1e-9);
        assert!((snap.max_ms - 30.0).abs() < 1e-9);
        assert!((snap.mean_ms - 14.0).abs() < 1e-9);
        assert!((snap.achieved_hz - 50.0).abs() < 1e-6);
    }
}
