//! [`ScriptedGait`] – open-loop stepping pattern.
//!
//! Every joint follows a sinusoid picked by its role in the leg (hip pitch,
//! knee, ankle, hip roll), with the right leg half a cycle behind the left.
//! Output depends only on the tick number, so two runs produce identical
//! command streams.

use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::time::Duration;

use biped_types::{JointCommand, JointId, JointSpec, RobotState};

use super::Policy;

/// Sinusoid parameters for one joint.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Wave {
    offset: f32,
    amplitude: f32,
    phase: f32,
}

impl Wave {
    const STILL: Wave = Wave {
        offset: 0.0,
        amplitude: 0.0,
        phase: 0.0,
    };

    fn at(&self, cycle_phase: f32) -> f32 {
        self.offset + self.amplitude * (cycle_phase + self.phase).sin()
    }
}

/// Role-based wave for a joint named like `left_knee_pitch`.
fn wave_for(name: &str) -> Wave {
    let side_phase = if name.starts_with("right") { PI } else { 0.0 };
    let (offset, amplitude, phase) = if name.contains("hip_pitch") {
        (0.0, 0.25, 0.0)
    } else if name.contains("knee") {
        (0.35, 0.25, FRAC_PI_2)
    } else if name.contains("ankle") {
        (0.0, -0.15, 0.0)
    } else if name.contains("hip_roll") {
        // Lateral weight shift; same direction on both legs.
        return Wave {
            offset: 0.0,
            amplitude: 0.05,
            phase: 0.0,
        };
    } else {
        return Wave::STILL;
    };
    Wave {
        offset,
        amplitude,
        phase: phase + side_phase,
    }
}

/// Deterministic sinusoidal gait.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use biped_runtime::policy::{Policy, ScriptedGait};
/// use biped_types::{ImuSample, RobotState, config::default_joints};
///
/// let mut gait = ScriptedGait::new(&default_joints(), Duration::from_millis(20));
/// let state = RobotState { tick: 0, joints: vec![], imu: ImuSample::default() };
/// assert_eq!(gait.decide(&state).len(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct ScriptedGait {
    joints: Vec<(JointSpec, Wave)>,
    tick_period: Duration,
    frequency_hz: f32,
    amplitude_scale: f32,
}

impl ScriptedGait {
    pub fn new(joints: &[JointSpec], tick_period: Duration) -> Self {
        Self {
            joints: joints
                .iter()
                .map(|spec| (spec.clone(), wave_for(&spec.name)))
                .collect(),
            tick_period,
            frequency_hz: 1.0,
            amplitude_scale: 1.0,
        }
    }

    /// Steps per second (one step per leg per cycle).
    pub fn with_frequency(mut self, hz: f32) -> Self {
        self.frequency_hz = hz;
        self
    }

    /// Scale every wave's swing; 0 stands the robot still.
    pub fn with_amplitude_scale(mut self, scale: f32) -> Self {
        self.amplitude_scale = scale;
        self
    }

    /// Target for `id` at `tick`, within the joint's limits.
    pub fn target(&self, id: JointId, tick: u64) -> Option<f32> {
        let (spec, wave) = self.joints.iter().find(|(s, _)| s.id == id)?;
        Some(self.evaluate(spec, wave, tick))
    }

    fn evaluate(&self, spec: &JointSpec, wave: &Wave, tick: u64) -> f32 {
        let t = tick as f64 * self.tick_period.as_secs_f64();
        let cycle_phase = ((t * self.frequency_hz as f64).fract() as f32) * TAU;
        let scaled = Wave {
            amplitude: wave.amplitude * self.amplitude_scale,
            ..*wave
        };
        spec.clamp_position(scaled.at(cycle_phase))
    }
}

impl Policy for ScriptedGait {
    fn name(&self) -> &str {
        "scripted"
    }

    fn decide(&mut self, state: &RobotState) -> Vec<JointCommand> {
        self.joints
            .iter()
            .map(|(spec, wave)| {
                JointCommand::position(spec.id, self.evaluate(spec, wave, state.tick))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biped_types::{ImuSample, JointTarget, config::default_joints};

    fn at(tick: u64) -> RobotState {
        RobotState {
            tick,
            joints: Vec::new(),
            imu: ImuSample::default(),
        }
    }

    fn gait() -> ScriptedGait {
        ScriptedGait::new(&default_joints(), Duration::from_millis(20))
    }

    #[test]
    fn same_tick_same_commands() {
        let mut a = gait();
        let mut b = gait();
        for tick in [0, 7, 49, 1234] {
            assert_eq!(a.decide(&at(tick)), b.decide(&at(tick)));
        }
    }

    #[test]
    fn legs_are_half_a_cycle_apart() {
        let g = gait();
        // 1 Hz at 50 Hz ticks: tick 12 is a quarter cycle from the start.
        let left = g.target(0, 12).unwrap();
        let right = g.target(5, 12).unwrap();
        assert!(left > 0.2);
        assert!((left + right).abs() < 1e-3);
    }

    #[test]
    fn targets_stay_within_limits() {
        let specs = default_joints();
        let mut g = gait().with_amplitude_scale(10.0);
        for tick in 0..100 {
            for cmd in g.decide(&at(tick)) {
                let spec = specs.iter().find(|s| s.id == cmd.id).unwrap();
                let JointTarget::Position(rad) = cmd.target else {
                    panic!("position commands only");
                };
                assert!(rad >= spec.min_angle_rad && rad <= spec.max_angle_rad);
            }
        }
    }

    #[test]
    fn frequency_sets_the_cycle_length() {
        let slow = gait();
        let fast = gait().with_frequency(2.0);
        // 2 Hz at 50 Hz ticks repeats every 25 ticks.
        let a = fast.target(0, 6).unwrap();
        let b = fast.target(0, 31).unwrap();
        assert!((a - b).abs() < 1e-4);
        assert!((slow.target(0, 6).unwrap() - a).abs() > 1e-2);
    }

    #[test]
    fn zero_amplitude_stands_still() {
        let g = gait().with_amplitude_scale(0.0);
        assert_eq!(g.target(0, 30), Some(0.0));
        assert!((g.target(3, 30).unwrap() - 0.35).abs() < 1e-6);
    }
}
