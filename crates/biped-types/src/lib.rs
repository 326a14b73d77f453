//! `biped-types` – shared data model for the BipedOS control stack.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - [`joint`] – [`JointSpec`], [`JointState`], [`JointCommand`] and the
//!   per-tick [`RobotState`] snapshot handed to the policy.
//! - [`geometry`] – [`Vec3`] and [`Quaternion`] primitives used by the IMU
//!   sample and the orientation filter.
//! - [`fault`] – [`FaultKind`] taxonomy and the [`FaultRecord`] appended to
//!   the fault log by the safety supervisor.
//! - [`config`] – the immutable [`RobotConfig`] built once at INIT.
//! - [`schema`] – JSON schema of the policy input/output contract.

pub mod config;
pub mod fault;
pub mod geometry;
pub mod joint;
pub mod schema;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{
    BusConfig, FusionConfig, RobotConfig, SafeStopAction, SafetyConfig, TimingConfig,
};
pub use fault::{FaultKind, FaultRecord};
pub use geometry::{Quaternion, Vec3};
pub use joint::{
    CommandMode, Direction, ImuSample, JointCommand, JointId, JointSpec, JointState, JointTarget,
    RobotState,
};
pub use schema::{PolicyIoSchema, policy_io_schema};

/// Global error type spanning bus failures, registry validation, and
/// configuration problems.
///
/// Runtime faults that the control loop absorbs (timeouts during a tick,
/// clamped commands, …) are reported as [`FaultRecord`]s instead; this enum
/// covers the failures that are returned to a caller.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BipedError {
    #[error("Bus timeout on address {address} after {attempts} attempt(s)")]
    BusTimeout { address: u8, attempts: u32 },

    #[error("Checksum mismatch on address {address}: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { address: u8, expected: u8, actual: u8 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Duplicate bus address {0} in joint table")]
    DuplicateAddress(u8),

    #[error("Duplicate joint id {0} in joint table")]
    DuplicateJoint(JointId),

    #[error("Unknown joint id {0}")]
    UnknownJoint(JointId),

    #[error("Invalid joint spec {id}: {details}")]
    InvalidSpec { id: JointId, details: String },

    #[error("Initialisation failed: no acknowledgement from bus address(es) {missing:?}")]
    InitFailed { missing: Vec<u8> },

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Policy error: {0}")]
    Policy(String),
}

impl BipedError {
    /// `true` for transaction-level failures that the bus transport retries:
    /// a missing reply, a checksum mismatch, or a garbled frame.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BipedError::BusTimeout { .. }
                | BipedError::Checksum { .. }
                | BipedError::MalformedFrame(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joint_target_serialization_roundtrip() {
        let cmd = JointCommand::position(3, 0.25);
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"mode\":\"position\""));
        let back: JointCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn disabled_command_roundtrip() {
        let cmd = JointCommand::disabled(7);
        let json = serde_json::to_string(&cmd).unwrap();
        let back: JointCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode(), CommandMode::Disabled);
    }

    #[test]
    fn biped_error_display() {
        let err = BipedError::BusTimeout {
            address: 4,
            attempts: 3,
        };
        assert!(err.to_string().contains("address 4"));
        assert!(err.to_string().contains("3 attempt"));

        let err2 = BipedError::DuplicateAddress(9);
        assert!(err2.to_string().contains("9"));
    }

    #[test]
    fn retryable_errors() {
        assert!(
            BipedError::Checksum {
                address: 1,
                expected: 0x10,
                actual: 0x11
            }
            .is_retryable()
        );
        assert!(BipedError::MalformedFrame("short".into()).is_retryable());
        assert!(!BipedError::DuplicateAddress(1).is_retryable());
        assert!(!BipedError::Config("bad".into()).is_retryable());
    }
}
