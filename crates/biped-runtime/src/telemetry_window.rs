//! One-second sliding view of loop frequency and joint tracking.
//!
//! The control loop pushes a [`TickSample`] per RUNNING tick into a bounded
//! channel (never blocking; samples are dropped when the consumer lags).  A
//! monitor feeds them into a [`TelemetryWindow`], which keeps the last
//! second and summarises achieved frequency and, per joint, actual against
//! desired position and velocity.  Desired velocity is the finite difference
//! of consecutive desired positions.

use std::collections::VecDeque;
use std::time::Duration;

use biped_types::JointId;
use crossbeam_channel::Receiver;
use serde::Serialize;

/// Default width of the window.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Measured and commanded values for one joint in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JointSample {
    pub id: JointId,
    pub position_rad: f32,
    pub velocity_rad_s: f32,
    /// Dispatched position target, if the joint was position-commanded.
    pub desired_rad: Option<f32>,
}

/// Everything the window needs from one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSample {
    pub tick: u64,
    pub timestamp: Duration,
    pub joints: Vec<JointSample>,
}

/// Window statistics for one joint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct JointTrace {
    pub id: JointId,
    pub position_rad: f32,
    pub desired_rad: Option<f32>,
    pub velocity_rad_s: f32,
    pub desired_velocity_rad_s: Option<f32>,
    /// Largest |desired − actual| position over the window.
    pub max_tracking_error_rad: f32,
    pub rms_tracking_error_rad: f32,
}

/// Summary of the current window.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TelemetrySummary {
    pub samples: usize,
    pub span_s: f64,
    /// Mean tick rate over the window.
    pub frequency_hz: f64,
    /// Slowest instantaneous rate (largest gap between samples).
    pub min_frequency_hz: f64,
    pub joints: Vec<JointTrace>,
}

#[derive(Debug)]
pub struct TelemetryWindow {
    width: Duration,
    samples: VecDeque<TickSample>,
}

impl Default for TelemetryWindow {
    fn default() -> Self {
        Self::new(WINDOW)
    }
}

impl TelemetryWindow {
    pub fn new(width: Duration) -> Self {
        Self {
            width,
            samples: VecDeque::new(),
        }
    }

    pub fn push(&mut self, sample: TickSample) {
        let newest = sample.timestamp;
        self.samples.push_back(sample);
        while self
            .samples
            .front()
            .is_some_and(|s| newest.saturating_sub(s.timestamp) > self.width)
        {
            self.samples.pop_front();
        }
    }

    /// Take everything waiting on `rx`.  Returns how many samples arrived.
    pub fn ingest(&mut self, rx: &Receiver<TickSample>) -> usize {
        let mut n = 0;
        for sample in rx.try_iter() {
            self.push(sample);
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summary(&self) -> TelemetrySummary {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return TelemetrySummary::default();
        };
        let span = last.timestamp.saturating_sub(first.timestamp).as_secs_f64();
        let n = self.samples.len();
        let frequency_hz = if n > 1 && span > 0.0 {
            (n - 1) as f64 / span
        } else {
            0.0
        };
        let max_gap = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| b.timestamp.saturating_sub(a.timestamp))
            .max()
            .unwrap_or_default();
        let min_frequency_hz = if max_gap.is_zero() {
            0.0
        } else {
            1.0 / max_gap.as_secs_f64()
        };

        TelemetrySummary {
            samples: n,
            span_s: span,
            frequency_hz,
            min_frequency_hz,
            joints: last
                .joints
                .iter()
                .map(|j| self.trace(j, last.timestamp))
                .collect(),
        }
    }

    fn trace(&self, latest: &JointSample, at: Duration) -> JointTrace {
        let history = || {
            self.samples
                .iter()
                .filter_map(move |s| Some((s.timestamp, s.joints.iter().find(|j| j.id == latest.id)?)))
        };

        let errors: Vec<f32> = history()
            .filter_map(|(_, j)| j.desired_rad.map(|d| (d - j.position_rad).abs()))
            .collect();
        let max_err = errors.iter().copied().fold(0.0, f32::max);
        let rms = if errors.is_empty() {
            0.0
        } else {
            (errors.iter().map(|e| e * e).sum::<f32>() / errors.len() as f32).sqrt()
        };

        let desired_velocity = latest.desired_rad.and_then(|now| {
            let (t_prev, prev) = history()
                .filter(|(t, _)| *t < at)
                .filter_map(|(t, j)| Some((t, j.desired_rad?)))
                .last()?;
            let dt = at.saturating_sub(t_prev).as_secs_f32();
            (dt > 0.0).then(|| (now - prev) / dt)
        });

        JointTrace {
            id: latest.id,
            position_rad: latest.position_rad,
            desired_rad: latest.desired_rad,
            velocity_rad_s: latest.velocity_rad_s,
            desired_velocity_rad_s: desired_velocity,
            max_tracking_error_rad: max_err,
            rms_tracking_error_rad: rms,
        }
    }
}
