//! Joint-level data model: static calibration, measured state, and commands.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::BipedError;
use crate::geometry::{Quaternion, Vec3};

/// Logical joint identifier (stable across bus re-addressing).
pub type JointId = u16;

/// Mounting direction of a servo relative to the joint's positive axis.
///
/// Serialised as `1` / `-1` in the joint table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// `+1.0` or `-1.0`.
    pub fn sign(self) -> f32 {
        match self {
            Direction::Forward => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Forward),
            -1 => Ok(Direction::Reverse),
            other => Err(format!("direction must be 1 or -1, got {other}")),
        }
    }
}

impl From<Direction> for i8 {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }
}

/// Static description of one physical actuator.  Immutable once the servo
/// registry has been loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointSpec {
    pub id: JointId,
    /// Human-readable name, e.g. `"left_knee_pitch"`.
    pub name: String,
    /// Servo ID on the shared serial bus.
    pub bus_address: u8,
    pub min_angle_rad: f32,
    pub max_angle_rad: f32,
    /// Torque bound (N·m); commands are clamped to `[-max_torque, max_torque]`.
    pub max_torque: f32,
    #[serde(default)]
    pub direction: Direction,
    /// Raw servo ticks corresponding to the joint's zero angle, relative to
    /// the servo's mechanical centre.
    #[serde(default)]
    pub zero_offset_ticks: i32,
    /// Servo revolutions per joint revolution.
    #[serde(default = "default_gear_ratio")]
    pub gear_ratio: f32,
    /// Whether losing this joint on the bus is immediately fatal.
    #[serde(default)]
    pub load_bearing: bool,
}

fn default_gear_ratio() -> f32 {
    1.0
}

impl JointSpec {
    /// Clamp a position target to `[min_angle_rad, max_angle_rad]`.
    pub fn clamp_position(&self, target_rad: f32) -> f32 {
        target_rad.clamp(self.min_angle_rad, self.max_angle_rad)
    }

    /// Clamp a torque target to `[-max_torque, max_torque]`.
    pub fn clamp_torque(&self, target: f32) -> f32 {
        target.clamp(-self.max_torque, self.max_torque)
    }

    /// Reject specs whose limits are not finite, inverted, or otherwise
    /// unusable.
    pub fn validate(&self) -> Result<(), BipedError> {
        let invalid = |details: String| BipedError::InvalidSpec {
            id: self.id,
            details,
        };
        if !self.min_angle_rad.is_finite() || !self.max_angle_rad.is_finite() {
            return Err(invalid("angle limits must be finite".into()));
        }
        if self.min_angle_rad > self.max_angle_rad {
            return Err(invalid(format!(
                "min_angle_rad {} exceeds max_angle_rad {}",
                self.min_angle_rad, self.max_angle_rad
            )));
        }
        if !self.max_torque.is_finite() || self.max_torque < 0.0 {
            return Err(invalid(format!(
                "max_torque {} must be finite and non-negative",
                self.max_torque
            )));
        }
        if !self.gear_ratio.is_finite() || self.gear_ratio <= 0.0 {
            return Err(invalid(format!("gear_ratio {} must be > 0", self.gear_ratio)));
        }
        Ok(())
    }
}

/// Measured state of one joint, refreshed once per tick by the sensor reader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JointState {
    pub id: JointId,
    pub position_rad: f32,
    pub velocity_rad_s: f32,
    /// Servo-reported load, converted to N·m.
    pub effort: f32,
    /// Time of the last successful read, relative to loop start.
    pub last_update: Duration,
    /// `true` when the latest read for this joint failed and the values above
    /// were carried forward.
    pub stale: bool,
}

impl JointState {
    /// Placeholder for a joint that has never been read.
    pub fn unknown(id: JointId) -> Self {
        Self {
            id,
            position_rad: 0.0,
            velocity_rad_s: 0.0,
            effort: 0.0,
            last_update: Duration::ZERO,
            stale: true,
        }
    }
}

/// One fused IMU reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ImuSample {
    pub orientation: Quaternion,
    /// Body-frame angular velocity (rad/s).
    pub angular_velocity: Vec3,
    /// Body-frame linear acceleration (m/s²).
    pub linear_acceleration: Vec3,
    pub timestamp: Duration,
}

/// Aggregate snapshot handed to the policy.  Built fresh every tick and never
/// mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RobotState {
    pub tick: u64,
    /// One entry per registered joint, in registry order.
    pub joints: Vec<JointState>,
    pub imu: ImuSample,
}

impl RobotState {
    /// Look up a joint's state by id.
    pub fn joint(&self, id: JointId) -> Option<&JointState> {
        self.joints.iter().find(|j| j.id == id)
    }

    /// `true` when any joint carried a stale reading into this snapshot.
    pub fn has_stale_joints(&self) -> bool {
        self.joints.iter().any(|j| j.stale)
    }
}

/// How a joint is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    Position,
    Torque,
    Disabled,
}

/// Per-joint set-point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum JointTarget {
    /// Target joint angle in radians.
    Position(f32),
    /// Target joint torque in N·m.
    Torque(f32),
    /// Torque off; the joint is left compliant.
    Disabled,
}

/// Command for a single joint produced by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JointCommand {
    pub id: JointId,
    #[serde(flatten)]
    pub target: JointTarget,
}

impl JointCommand {
    pub fn position(id: JointId, target_rad: f32) -> Self {
        Self {
            id,
            target: JointTarget::Position(target_rad),
        }
    }

    pub fn torque(id: JointId, torque: f32) -> Self {
        Self {
            id,
            target: JointTarget::Torque(torque),
        }
    }

    pub fn disabled(id: JointId) -> Self {
        Self {
            id,
            target: JointTarget::Disabled,
        }
    }

    pub fn mode(&self) -> CommandMode {
        match self.target {
            JointTarget::Position(_) => CommandMode::Position,
            JointTarget::Torque(_) => CommandMode::Torque,
            JointTarget::Disabled => CommandMode::Disabled,
        }
    }
}
