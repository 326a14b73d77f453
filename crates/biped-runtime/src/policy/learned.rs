//! [`LearnedPolicy`] – frozen multilayer perceptron.
//!
//! The network is trained elsewhere and shipped as a JSON artifact:
//!
//! ```json
//! {
//!   "observation_size": 36,
//!   "action_scale": 0.25,
//!   "default_pose": [0.0, 0.0, ...],
//!   "layers": [ { "weights": [[...], ...], "biases": [...] }, ... ]
//! }
//! ```
//!
//! The observation for `n` joints (registry order) is
//! `gyro(3) ‖ accel(3) ‖ position − default_pose (n) ‖ velocity × 0.05 (n) ‖ last action (n)`,
//! so `observation_size` must equal `6 + 3n`.  Hidden layers use `tanh`; the
//! output layer is linear and yields one action per joint.  The position
//! target is `default_pose + action × action_scale`.

use std::fs;
use std::path::Path;

use biped_types::{BipedError, JointCommand, JointId, JointSpec, RobotState};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Policy;

/// Velocities are scaled before entering the observation.
pub const VELOCITY_OBS_SCALE: f32 = 0.05;

/// One dense layer.  `weights[o][i]` connects input `i` to output `o`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub weights: Vec<Vec<f32>>,
    pub biases: Vec<f32>,
}

impl LayerWeights {
    fn outputs(&self) -> usize {
        self.biases.len()
    }

    fn forward(&self, input: &[f32], activate: bool) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.biases)
            .map(|(row, bias)| {
                let z = row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>() + bias;
                if activate { z.tanh() } else { z }
            })
            .collect()
    }
}

/// On-disk form of a trained policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub observation_size: usize,
    pub action_scale: f32,
    pub default_pose: Vec<f32>,
    pub layers: Vec<LayerWeights>,
}

impl PolicyArtifact {
    /// Check every dimension against a robot with `joint_count` joints.
    pub fn validate(&self, joint_count: usize) -> Result<(), BipedError> {
        let bad = |msg: String| Err(BipedError::Policy(msg));
        let expected_obs = 6 + 3 * joint_count;
        if self.observation_size != expected_obs {
            return bad(format!(
                "observation_size {} does not match {joint_count} joints (expected {expected_obs})",
                self.observation_size
            ));
        }
        if self.default_pose.len() != joint_count {
            return bad(format!(
                "default_pose has {} entries for {joint_count} joints",
                self.default_pose.len()
            ));
        }
        if !self.action_scale.is_finite() {
            return bad("action_scale is not finite".into());
        }
        if self.layers.is_empty() {
            return bad("artifact has no layers".into());
        }
        let mut width = self.observation_size;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.len() != layer.outputs() {
                return bad(format!(
                    "layer {i}: {} weight rows but {} biases",
                    layer.weights.len(),
                    layer.outputs()
                ));
            }
            if let Some((r, row)) = layer
                .weights
                .iter()
                .enumerate()
                .find(|(_, row)| row.len() != width)
            {
                return bad(format!(
                    "layer {i}: row {r} has {} inputs, expected {width}",
                    row.len()
                ));
            }
            let mut params = layer.weights.iter().flatten().chain(&layer.biases);
            if params.any(|v| !v.is_finite()) {
                return bad(format!("layer {i}: non-finite parameter"));
            }
            width = layer.outputs();
        }
        if width != joint_count {
            return bad(format!(
                "output layer yields {width} actions for {joint_count} joints"
            ));
        }
        Ok(())
    }
}

/// Runs a [`PolicyArtifact`] against the registry's joints.
#[derive(Debug, Clone)]
pub struct LearnedPolicy {
    artifact: PolicyArtifact,
    joints: Vec<JointId>,
    last_action: Vec<f32>,
}

impl LearnedPolicy {
    /// Load and validate an artifact file.
    pub fn load(path: impl AsRef<Path>, joints: &[JointSpec]) -> Result<Self, BipedError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| BipedError::Io(format!("cannot read {}: {e}", path.display())))?;
        let artifact: PolicyArtifact = serde_json::from_str(&raw)
            .map_err(|e| BipedError::Policy(format!("{}: {e}", path.display())))?;
        let policy = Self::from_artifact(artifact, joints)?;
        info!(
            path = %path.display(),
            layers = policy.artifact.layers.len(),
            observation_size = policy.artifact.observation_size,
            "learned policy loaded"
        );
        Ok(policy)
    }

    pub fn from_artifact(artifact: PolicyArtifact, joints: &[JointSpec]) -> Result<Self, BipedError> {
        artifact.validate(joints.len())?;
        Ok(Self {
            last_action: vec![0.0; joints.len()],
            joints: joints.iter().map(|j| j.id).collect(),
            artifact,
        })
    }

    /// Build the network input from `state`.
    pub fn observation(&self, state: &RobotState) -> Vec<f32> {
        let imu = &state.imu;
        let mut obs = Vec::with_capacity(self.artifact.observation_size);
        obs.extend([imu.angular_velocity.x, imu.angular_velocity.y, imu.angular_velocity.z]);
        obs.extend([
            imu.linear_acceleration.x,
            imu.linear_acceleration.y,
            imu.linear_acceleration.z,
        ]);
        let joint = |id: JointId| state.joint(id);
        for (id, default) in self.joints.iter().zip(&self.artifact.default_pose) {
            obs.push(joint(*id).map_or(0.0, |j| j.position_rad - default));
        }
        for id in &self.joints {
            obs.push(joint(*id).map_or(0.0, |j| j.velocity_rad_s * VELOCITY_OBS_SCALE));
        }
        obs.extend_from_slice(&self.last_action);
        obs
    }

    fn infer(&self, obs: &[f32]) -> Vec<f32> {
        let last = self.artifact.layers.len() - 1;
        let mut x = obs.to_vec();
        for (i, layer) in self.artifact.layers.iter().enumerate() {
            x = layer.forward(&x, i != last);
        }
        x
    }
}

impl Policy for LearnedPolicy {
    fn name(&self) -> &str {
        "learned"
    }

    fn decide(&mut self, state: &RobotState) -> Vec<JointCommand> {
        let action = self.infer(&self.observation(state));
        let commands = self
            .joints
            .iter()
            .zip(&self.artifact.default_pose)
            .zip(&action)
            .map(|((id, default), a)| {
                JointCommand::position(*id, default + a * self.artifact.action_scale)
            })
            .collect();
        self.last_action = action;
        commands
    }

    fn reset(&mut self) {
        self.last_action.iter_mut().for_each(|a| *a = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biped_types::{Direction, ImuSample, JointState, JointTarget, Vec3};
    use std::time::Duration;

    fn specs(n: u16) -> Vec<JointSpec> {
        (0..n)
            .map(|i| JointSpec {
                id: i,
                name: format!("j{i}"),
                bus_address: i as u8 + 1,
                min_angle_rad: -1.0,
                max_angle_rad: 1.0,
                max_torque: 1.0,
                direction: Direction::Forward,
                zero_offset_ticks: 0,
                gear_ratio: 1.0,
                load_bearing: false,
            })
            .collect()
    }

    /// Single linear layer mapping observation → action for 2 joints.
    fn linear_artifact() -> PolicyArtifact {
        let obs = 6 + 3 * 2;
        let mut w0 = vec![0.0; obs];
        w0[6] = 1.0; // joint 0 position error
        let mut w1 = vec![0.0; obs];
        w1[0] = 2.0; // gyro x
        PolicyArtifact {
            observation_size: obs,
            action_scale: 0.5,
            default_pose: vec![0.1, -0.1],
            layers: vec![LayerWeights {
                weights: vec![w0, w1],
                biases: vec![0.0, 0.1],
            }],
        }
    }

    fn state(pos0: f32, gyro_x: f32) -> RobotState {
        let joint = |id, position_rad| JointState {
            id,
            position_rad,
            velocity_rad_s: 0.0,
            effort: 0.0,
            last_update: Duration::ZERO,
            stale: false,
        };
        RobotState {
            tick: 0,
            joints: vec![joint(0, pos0), joint(1, -0.1)],
            imu: ImuSample {
                angular_velocity: Vec3::new(gyro_x, 0.0, 0.0),
                ..ImuSample::default()
            },
        }
    }

    #[test]
    fn observation_layout() {
        let p = LearnedPolicy::from_artifact(linear_artifact(), &specs(2)).unwrap();
        let mut s = state(0.3, 0.0);
        s.joints[1].velocity_rad_s = 2.0;
        let obs = p.observation(&s);
        assert_eq!(obs.len(), 12);
        assert!((obs[6] - 0.2).abs() < 1e-6);
        assert!((obs[7] - 0.0).abs() < 1e-6);
        assert!((obs[9] - 0.1).abs() < 1e-6);
        assert_eq!(&obs[10..], &[0.0, 0.0]);
    }

    #[test]
    fn action_is_scaled_around_default_pose() {
        let mut p = LearnedPolicy::from_artifact(linear_artifact(), &specs(2)).unwrap();
        let out = p.decide(&state(0.5, 0.2));
        // a0 = 0.4 → 0.1 + 0.2;  a1 = 0.4 + 0.1 → -0.1 + 0.25
        let JointTarget::Position(t0) = out[0].target else { panic!() };
        let JointTarget::Position(t1) = out[1].target else { panic!() };
        assert!((t0 - 0.3).abs() < 1e-5);
        assert!((t1 - 0.15).abs() < 1e-5);
    }

    #[test]
    fn last_action_feeds_back() {
        let mut p = LearnedPolicy::from_artifact(linear_artifact(), &specs(2)).unwrap();
        p.decide(&state(0.5, 0.2));
        let obs = p.observation(&state(0.1, 0.0));
        assert!((obs[10] - 0.4).abs() < 1e-5);
        p.reset();
        assert_eq!(&p.observation(&state(0.1, 0.0))[10..], &[0.0, 0.0]);
    }

    #[test]
    fn hidden_layers_saturate() {
        let obs = 6 + 3;
        let artifact = PolicyArtifact {
            observation_size: obs,
            action_scale: 1.0,
            default_pose: vec![0.0],
            layers: vec![
                LayerWeights {
                    weights: vec![vec![0.0; obs]],
                    biases: vec![100.0],
                },
                LayerWeights {
                    weights: vec![vec![1.0]],
                    biases: vec![0.0],
                },
            ],
        };
        let mut p = LearnedPolicy::from_artifact(artifact, &specs(1)).unwrap();
        let mut s = state(0.0, 0.0);
        s.joints.truncate(1);
        let JointTarget::Position(t) = p.decide(&s)[0].target else { panic!() };
        assert!((t - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let mut a = linear_artifact();
        a.observation_size = 13;
        assert!(matches!(
            LearnedPolicy::from_artifact(a, &specs(2)),
            Err(BipedError::Policy(_))
        ));

        let mut a = linear_artifact();
        a.layers[0].biases.pop();
        assert!(LearnedPolicy::from_artifact(a, &specs(2)).is_err());

        assert!(LearnedPolicy::from_artifact(linear_artifact(), &specs(3)).is_err());
    }

    #[test]
    fn ragged_weight_row_is_named() {
        let mut a = linear_artifact();
        a.layers[0].weights[1].pop();
        match LearnedPolicy::from_artifact(a, &specs(2)) {
            Err(BipedError::Policy(msg)) => assert!(msg.contains("row 1"), "{msg}"),
            other => panic!("expected a policy error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        fs::write(&path, serde_json::to_string(&linear_artifact()).unwrap()).unwrap();
        let p = LearnedPolicy::load(&path, &specs(2)).unwrap();
        assert_eq!(p.name(), "learned");

        fs::write(&path, "{ not json").unwrap();
        assert!(LearnedPolicy::load(&path, &specs(2)).is_err());
    }
}
