//! [`ServoRegistry`] – the joint table and the radians ↔ servo-ticks mapping.
//!
//! The registry is loaded once at INIT from the configured [`JointSpec`]s and
//! never changes afterwards.  It is the only place that knows how a logical
//! joint maps onto a bus address, a mounting direction, a zero offset and a
//! gear ratio.
//!
//! Every outgoing command is clamped here to the joint's limits, independent
//! of the safety supervisor upstream.
//!
//! # Example
//!
//! ```rust
//! use biped_hal::registry::ServoRegistry;
//! use biped_types::{JointCommand, config::default_joints};
//!
//! let registry = ServoRegistry::load(default_joints()).unwrap();
//! let frame = registry
//!     .to_raw_command(&JointCommand::position(0, 0.2))
//!     .unwrap();
//! assert_eq!(frame.address, 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::f32::consts::TAU;
use std::time::Duration;

use biped_types::{BipedError, JointCommand, JointId, JointSpec, JointState, JointTarget};
use tracing::debug;

use crate::protocol::{
    self, CENTER_TICKS, INST_PING, INST_READ, INST_WRITE, MAX_TICKS, PWM_FULL_SCALE,
    REG_GOAL_PWM, REG_PRESENT_POSITION, REG_TORQUE_ENABLE, ServoFrame, TELEMETRY_LEN,
    TICKS_PER_REV,
};

/// Immutable joint table keyed by [`JointId`], iterated in load order.
#[derive(Debug, Clone)]
pub struct ServoRegistry {
    joints: Vec<JointSpec>,
    index: HashMap<JointId, usize>,
}

impl ServoRegistry {
    /// Build the registry.
    ///
    /// # Errors
    ///
    /// - [`BipedError::DuplicateAddress`] when two joints share a bus address.
    /// - [`BipedError::DuplicateJoint`] when two joints share an id.
    /// - [`BipedError::InvalidSpec`] when a joint's limits are unusable.
    pub fn load(specs: Vec<JointSpec>) -> Result<Self, BipedError> {
        let mut addresses = HashSet::new();
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            spec.validate()?;
            if !addresses.insert(spec.bus_address) {
                return Err(BipedError::DuplicateAddress(spec.bus_address));
            }
            if index.insert(spec.id, i).is_some() {
                return Err(BipedError::DuplicateJoint(spec.id));
            }
        }
        debug!(joints = specs.len(), "servo registry loaded");
        Ok(Self {
            joints: specs,
            index,
        })
    }

    pub fn get(&self, id: JointId) -> Option<&JointSpec> {
        self.index.get(&id).map(|&i| &self.joints[i])
    }

    /// Joints in load order.
    pub fn iter(&self) -> impl Iterator<Item = &JointSpec> {
        self.joints.iter()
    }

    pub fn specs(&self) -> &[JointSpec] {
        &self.joints
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    fn spec(&self, id: JointId) -> Result<&JointSpec, BipedError> {
        self.get(id).ok_or(BipedError::UnknownJoint(id))
    }

    /// Translate a joint command into a bus frame, clamping the target to the
    /// joint's limits.
    ///
    /// - `Position` enables torque and writes the goal position in one WRITE
    ///   starting at the torque-enable register.
    /// - `Torque` writes a signed goal PWM scaled so that `max_torque` is full
    ///   scale (the servo must be configured for open-loop mode).  It does not
    ///   touch torque enable; send [`torque_enable_frame`][Self::torque_enable_frame]
    ///   first on a servo that may be limp.
    /// - `Disabled` clears torque enable.
    pub fn to_raw_command(&self, cmd: &JointCommand) -> Result<ServoFrame, BipedError> {
        let spec = self.spec(cmd.id)?;
        let address = spec.bus_address;
        let bytes = match cmd.target {
            JointTarget::Position(rad) => {
                let ticks = rad_to_ticks(spec, spec.clamp_position(rad)).to_le_bytes();
                // torque on, acceleration 0 (servo default profile), goal
                protocol::encode_instruction(
                    address,
                    INST_WRITE,
                    &[REG_TORQUE_ENABLE, 1, 0, ticks[0], ticks[1]],
                )
            }
            JointTarget::Torque(nm) => {
                let pwm = torque_to_pwm(spec, spec.clamp_torque(nm));
                let raw = protocol::to_sign_magnitude(pwm).to_le_bytes();
                protocol::encode_instruction(address, INST_WRITE, &[REG_GOAL_PWM, raw[0], raw[1]])
            }
            JointTarget::Disabled => {
                protocol::encode_instruction(address, INST_WRITE, &[REG_TORQUE_ENABLE, 0])
            }
        };
        Ok(ServoFrame {
            address,
            bytes,
            reply_len: protocol::status_len(0),
        })
    }

    /// WRITE setting torque enable on `id`, leaving every goal register alone.
    pub fn torque_enable_frame(&self, id: JointId) -> Result<ServoFrame, BipedError> {
        let address = self.spec(id)?.bus_address;
        Ok(ServoFrame {
            address,
            bytes: protocol::encode_instruction(address, INST_WRITE, &[REG_TORQUE_ENABLE, 1]),
            reply_len: protocol::status_len(0),
        })
    }

    /// Convert the payload of a present-position/speed/load READ into a
    /// [`JointState`].
    pub fn from_raw_telemetry(
        &self,
        id: JointId,
        bytes: &[u8],
        timestamp: Duration,
    ) -> Result<JointState, BipedError> {
        let spec = self.spec(id)?;
        let position = protocol::read_u16(bytes, 0)?;
        let speed = protocol::from_sign_magnitude(protocol::read_u16(bytes, 2)?);
        let load = protocol::from_sign_magnitude(protocol::read_u16(bytes, 4)?);

        let sign = spec.direction.sign();
        let rad_per_tick = TAU / TICKS_PER_REV / spec.gear_ratio;
        let offset_ticks = position as i32 - CENTER_TICKS - spec.zero_offset_ticks;
        Ok(JointState {
            id,
            position_rad: sign * offset_ticks as f32 * rad_per_tick,
            velocity_rad_s: sign * speed as f32 * rad_per_tick,
            effort: sign * load as f32 / PWM_FULL_SCALE * spec.max_torque,
            last_update: timestamp,
            stale: false,
        })
    }

    /// Liveness probe for a bus address.
    pub fn ping_frame(address: u8) -> ServoFrame {
        ServoFrame {
            address,
            bytes: protocol::encode_instruction(address, INST_PING, &[]),
            reply_len: protocol::status_len(0),
        }
    }

    /// READ of the present position/speed/load block for `id`.
    pub fn telemetry_request(&self, id: JointId) -> Result<ServoFrame, BipedError> {
        let address = self.spec(id)?.bus_address;
        Ok(ServoFrame {
            address,
            bytes: protocol::encode_instruction(
                address,
                INST_READ,
                &[REG_PRESENT_POSITION, TELEMETRY_LEN],
            ),
            reply_len: protocol::status_len(TELEMETRY_LEN as usize),
        })
    }
}

fn rad_to_ticks(spec: &JointSpec, rad: f32) -> u16 {
    let offset = spec.direction.sign() * rad * spec.gear_ratio * TICKS_PER_REV / TAU;
    let ticks = CENTER_TICKS + spec.zero_offset_ticks + offset.round() as i32;
    ticks.clamp(0, MAX_TICKS) as u16
}

fn torque_to_pwm(spec: &JointSpec, nm: f32) -> i16 {
    if spec.max_torque <= 0.0 {
        return 0;
    }
    let scaled = spec.direction.sign() * nm / spec.max_torque * PWM_FULL_SCALE;
    scaled.round().clamp(-PWM_FULL_SCALE, PWM_FULL_SCALE) as i16
}
