//! Fault taxonomy and the record appended to the fault log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::joint::JointId;

/// Every runtime fault the control stack can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// A bus transaction exhausted its retry budget.
    BusTimeout,
    /// A reply failed its checksum.  Retried like a timeout; recorded only for
    /// diagnostics.
    ChecksumError,
    /// The IMU, or a joint, stopped producing readings.
    SensorDropout,
    /// A policy command had to be clamped into the joint's limits.
    CommandOutOfRange,
    /// The policy exceeded its per-tick compute budget.
    PolicyTimeout,
    /// A tick ran past its period plus tolerance.
    TickOverrun,
    /// A configured servo never acknowledged during INIT.
    InitFailed,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::BusTimeout => "BusTimeout",
            FaultKind::ChecksumError => "ChecksumError",
            FaultKind::SensorDropout => "SensorDropout",
            FaultKind::CommandOutOfRange => "CommandOutOfRange",
            FaultKind::PolicyTimeout => "PolicyTimeout",
            FaultKind::TickOverrun => "TickOverrun",
            FaultKind::InitFailed => "InitFailed",
        };
        f.write_str(s)
    }
}

/// A single entry in the fault log.
///
/// A [`FaultKind::SensorDropout`] without a `joint` refers to the IMU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub joint: Option<JointId>,
    pub tick: u64,
    pub detail: String,
    /// Set by the safety supervisor when the fault forces SAFE_STOP.
    pub fatal: bool,
    pub wall_time: DateTime<Utc>,
}

impl FaultRecord {
    /// A non-fatal fault not tied to any joint.
    pub fn new(kind: FaultKind, tick: u64, detail: impl Into<String>) -> Self {
        Self {
            kind,
            joint: None,
            tick,
            detail: detail.into(),
            fatal: false,
            wall_time: Utc::now(),
        }
    }

    /// Scope the fault to `joint`.
    pub fn for_joint(mut self, joint: JointId) -> Self {
        self.joint = Some(joint);
        self
    }

    /// Mark the fault as fatal.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// `true` for an IMU dropout.
    pub fn is_imu_dropout(&self) -> bool {
        self.kind == FaultKind::SensorDropout && self.joint.is_none()
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[tick {}] {}", self.tick, self.kind)?;
        match self.joint {
            Some(j) => write!(f, " joint {j}")?,
            None if self.kind == FaultKind::SensorDropout => write!(f, " imu")?,
            None => {}
        }
        if self.fatal {
            write!(f, " (fatal)")?;
        }
        write!(f, ": {}", self.detail)
    }
}
