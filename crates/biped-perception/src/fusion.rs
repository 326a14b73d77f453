//! Orientation fusion.
//!
//! Combines the IMU's two streams into a single drift-corrected attitude
//! quaternion using a complementary filter:
//!
//! - **Gyroscope** – body-frame angular velocity; integrated every sample.
//!   Smooth and locally accurate but drifts without bound.
//! - **Accelerometer** – measures gravity while the robot is not
//!   accelerating; gives an absolute but noisy roll and pitch.
//!
//! ```text
//! roll  = α · roll_gyro  + (1 − α) · roll_accel
//! pitch = α · pitch_gyro + (1 − α) · pitch_accel
//! yaw   = yaw_gyro                       (gravity carries no heading)
//! ```
//!
//! The accelerometer correction is skipped whenever `|a|` is outside
//! `g · (1 ± accel_trust_band)`: during a foot strike the vector no longer
//! points at gravity.
//!
//! # Example
//!
//! ```rust
//! use biped_perception::fusion::{OrientationFilter, STANDARD_GRAVITY};
//! use biped_types::{FusionConfig, Vec3};
//!
//! let mut filter = OrientationFilter::new(&FusionConfig::default());
//! let q = filter.update(
//!     Vec3::zero(),
//!     Vec3::new(0.0, 0.0, STANDARD_GRAVITY),
//!     0.02,
//! );
//! let (roll, pitch, _) = q.to_euler();
//! assert!(roll.abs() < 1e-5 && pitch.abs() < 1e-5);
//! ```

use std::f32::consts::{PI, TAU};

use biped_types::{FusionConfig, Quaternion, Vec3};
use tracing::trace;

/// Standard gravity (m/s²).
pub const STANDARD_GRAVITY: f32 = 9.806_65;

/// Roll and pitch implied by a gravity reading.
fn tilt_from_accel(accel: Vec3) -> (f32, f32) {
    let roll = accel.y.atan2(accel.z);
    let pitch = (-accel.x).atan2((accel.y * accel.y + accel.z * accel.z).sqrt());
    (roll, pitch)
}

/// Wrap an angle into `(-π, π]`.
fn wrap(angle: f32) -> f32 {
    let a = (angle + PI).rem_euclid(TAU) - PI;
    if a <= -PI { a + TAU } else { a }
}

/// Blend two angles along the short way round.
fn blend(gyro: f32, accel: f32, alpha: f32) -> f32 {
    wrap(accel + alpha * wrap(gyro - accel))
}

/// Complementary attitude filter.
#[derive(Debug, Clone)]
pub struct OrientationFilter {
    alpha: f32,
    trust_band: f32,
    orientation: Quaternion,
    initialized: bool,
    rejected: u64,
}

impl OrientationFilter {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            alpha: config.alpha.clamp(0.0, 1.0),
            trust_band: config.accel_trust_band.max(0.0),
            orientation: Quaternion::identity(),
            initialized: false,
            rejected: 0,
        }
    }

    /// Current attitude estimate.
    pub fn orientation(&self) -> Quaternion {
        self.orientation
    }

    /// Accelerometer samples ignored because the robot was accelerating.
    pub fn rejected_samples(&self) -> u64 {
        self.rejected
    }

    /// Forget the estimate; the next trusted sample re-seeds from gravity.
    pub fn reset(&mut self) {
        self.orientation = Quaternion::identity();
        self.initialized = false;
    }

    fn accel_trusted(&self, accel: Vec3) -> bool {
        let norm = accel.norm();
        norm.is_finite() && (norm - STANDARD_GRAVITY).abs() <= STANDARD_GRAVITY * self.trust_band
    }

    /// Feed one sample taken `dt` seconds after the previous one and return
    /// the new estimate.  Non-finite inputs are ignored.
    pub fn update(&mut self, gyro: Vec3, accel: Vec3, dt: f32) -> Quaternion {
        let accel_ok = self.accel_trusted(accel);

        if !self.initialized {
            if accel_ok {
                let (roll, pitch) = tilt_from_accel(accel);
                self.orientation = Quaternion::from_euler(roll, pitch, 0.0);
                self.initialized = true;
            }
            return self.orientation;
        }

        let mut predicted = self.orientation;
        if gyro.is_finite() && dt.is_finite() && dt > 0.0 {
            let step = Quaternion::from_axis_angle(gyro, gyro.norm() * dt);
            predicted = predicted.mul(step).normalized();
        }

        self.orientation = if accel_ok {
            let (roll_g, pitch_g, yaw_g) = predicted.to_euler();
            let (roll_a, pitch_a) = tilt_from_accel(accel);
            Quaternion::from_euler(
                blend(roll_g, roll_a, self.alpha),
                blend(pitch_g, pitch_a, self.alpha),
                yaw_g,
            )
            .normalized()
        } else {
            self.rejected += 1;
            trace!(norm = accel.norm(), "accelerometer correction skipped");
            predicted
        };
        self.orientation
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
