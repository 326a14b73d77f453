//! Generic `ImuSource` trait for inertial measurement units.
//!
//! The sensor reader only ever talks to this trait, so an I²C/SPI driver, a
//! serial bridge or the simulated IMU can be swapped without touching the
//! fusion or control code.

use biped_types::{BipedError, Vec3};

/// One unfused IMU reading in the body frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawImu {
    /// Angular velocity (rad/s).
    pub gyro: Vec3,
    /// Specific force (m/s²); reads `+g` on the z axis when upright and still.
    pub accel: Vec3,
}

impl RawImu {
    pub fn is_finite(&self) -> bool {
        self.gyro.is_finite() && self.accel.is_finite()
    }
}

/// A source of raw IMU readings.
pub trait ImuSource: Send {
    /// Return the latest reading.
    ///
    /// # Errors
    ///
    /// Any error is treated by the sensor reader as a missed IMU sample.
    fn read(&mut self) -> Result<RawImu, BipedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedImu(RawImu);

    impl ImuSource for FixedImu {
        fn read(&mut self) -> Result<RawImu, BipedError> {
            Ok(self.0)
        }
    }

    #[test]
    fn trait_object_reads() {
        let sample = RawImu {
            gyro: Vec3::new(0.0, 0.1, 0.0),
            accel: Vec3::new(0.0, 0.0, 9.81),
        };
        let mut imu: Box<dyn ImuSource> = Box::new(FixedImu(sample));
        assert_eq!(imu.read().unwrap(), sample);
        assert!(sample.is_finite());
    }
}
