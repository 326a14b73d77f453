//! Machine-readable contract between the control loop and a policy.
//!
//! External policy authors (training pipelines, teleop bridges) consume this
//! to know exactly what observation they receive and what they must return.

use schemars::schema::RootSchema;
use schemars::schema_for;
use serde::Serialize;

use crate::joint::{JointCommand, RobotState};

/// JSON schemas of the policy's input ([`RobotState`]) and output
/// (`Vec<JointCommand>`).
#[derive(Debug, Clone, Serialize)]
pub struct PolicyIoSchema {
    pub input: RootSchema,
    pub output: RootSchema,
}

/// Generate the policy I/O schema.
pub fn policy_io_schema() -> PolicyIoSchema {
    PolicyIoSchema {
        input: schema_for!(RobotState),
        output: schema_for!(Vec<JointCommand>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_state_fields_and_command_modes() {
        let schema = serde_json::to_string(&policy_io_schema()).unwrap();
        assert!(schema.contains("\"joints\""));
        assert!(schema.contains("\"imu\""));
        assert!(schema.contains("position"));
        assert!(schema.contains("disabled"));
    }
}
