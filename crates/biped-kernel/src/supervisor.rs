//! [`SafetySupervisor`] – the last check between the policy and the bus.
//!
//! Every command batch passes through [`SafetySupervisor::validate`] before
//! dispatch.  The supervisor never rejects a batch outright; it always
//! produces a dispatchable set:
//!
//! - a target outside the joint's limits is clamped and a non-fatal
//!   `CommandOutOfRange` fault is raised;
//! - a clamp larger than `hard_clamp_rad` / `hard_clamp_torque`, or a
//!   non-finite target, means the policy itself is broken: the command is
//!   dropped and the fault is fatal;
//! - a command for a joint that is not in the registry is dropped with a
//!   non-fatal fault.
//!
//! [`SafetySupervisor::assess`] classifies faults raised elsewhere (bus,
//! sensors, INIT) as fatal or not.

use biped_hal::ServoRegistry;
use biped_types::{
    FaultKind, FaultRecord, JointCommand, JointSpec, JointTarget, RobotState, SafeStopAction,
    SafetyConfig,
};
use tracing::debug;

/// Outcome of validating one command batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    /// Commands safe to dispatch, every one within its joint's limits.
    pub commands: Vec<JointCommand>,
    pub faults: Vec<FaultRecord>,
    /// `true` when any fault in `faults` is fatal.
    pub safe_stop: bool,
}

impl Validation {
    fn raise(&mut self, fault: FaultRecord) {
        self.safe_stop |= fault.fatal;
        self.faults.push(fault);
    }
}

/// Command gate and fault classifier.
///
/// # Example
///
/// ```
/// use biped_hal::ServoRegistry;
/// use biped_kernel::SafetySupervisor;
/// use biped_types::{JointCommand, JointTarget, SafetyConfig, config::default_joints};
///
/// let registry = ServoRegistry::load(default_joints()).unwrap();
/// let supervisor = SafetySupervisor::new(SafetyConfig::default());
///
/// let max = registry.get(1).unwrap().max_angle_rad;
/// let out = supervisor.validate(&[JointCommand::position(1, max + 0.05)], &registry, 7);
/// assert_eq!(out.commands[0].target, JointTarget::Position(max));
/// assert!(!out.safe_stop);
/// ```
#[derive(Debug, Clone)]
pub struct SafetySupervisor {
    config: SafetyConfig,
}

impl SafetySupervisor {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Clamp and screen a batch of policy commands.
    pub fn validate(
        &self,
        commands: &[JointCommand],
        registry: &ServoRegistry,
        tick: u64,
    ) -> Validation {
        let mut out = Validation {
            commands: Vec::with_capacity(commands.len()),
            ..Validation::default()
        };
        for cmd in commands {
            let Some(spec) = registry.get(cmd.id) else {
                out.raise(
                    FaultRecord::new(
                        FaultKind::CommandOutOfRange,
                        tick,
                        "command for unregistered joint dropped",
                    )
                    .for_joint(cmd.id),
                );
                continue;
            };
            match self.screen(spec, cmd, tick) {
                Screened::Pass(c) => out.commands.push(c),
                Screened::Clamped(c, fault) => {
                    out.commands.push(c);
                    out.raise(fault);
                }
                Screened::Rejected(fault) => out.raise(fault),
            }
        }
        if !out.faults.is_empty() {
            debug!(
                tick,
                faults = out.faults.len(),
                safe_stop = out.safe_stop,
                "command batch screened"
            );
        }
        out
    }

    fn screen(&self, spec: &JointSpec, cmd: &JointCommand, tick: u64) -> Screened {
        let (requested, clamped, hard_limit, unit) = match cmd.target {
            JointTarget::Disabled => return Screened::Pass(*cmd),
            JointTarget::Position(rad) => {
                (rad, spec.clamp_position(rad), self.config.hard_clamp_rad, "rad")
            }
            JointTarget::Torque(nm) => {
                (nm, spec.clamp_torque(nm), self.config.hard_clamp_torque, "N·m")
            }
        };
        let fault = |detail: String| {
            FaultRecord::new(FaultKind::CommandOutOfRange, tick, detail).for_joint(spec.id)
        };

        if !requested.is_finite() {
            return Screened::Rejected(
                fault(format!("non-finite target {requested} for {}", spec.name)).fatal(),
            );
        }
        let excess = (requested - clamped).abs();
        if excess == 0.0 {
            return Screened::Pass(*cmd);
        }
        if excess > hard_limit {
            return Screened::Rejected(
                fault(format!(
                    "target {requested:.3} {unit} for {} is {excess:.3} beyond its limit",
                    spec.name
                ))
                .fatal(),
            );
        }
        let target = match cmd.target {
            JointTarget::Position(_) => JointTarget::Position(clamped),
            _ => JointTarget::Torque(clamped),
        };
        Screened::Clamped(
            JointCommand {
                id: cmd.id,
                target,
            },
            fault(format!(
                "target {requested:.3} {unit} for {} clamped to {clamped:.3}",
                spec.name
            )),
        )
    }

    /// Mark `fault` fatal when its kind (and scope) requires SAFE_STOP.
    ///
    /// Fatal: a bus timeout on a load-bearing joint, any sensor dropout on a
    /// load-bearing joint or the IMU, and INIT failures.  Overrun and policy
    /// timeout faults arrive already marked by their streak counters.
    pub fn assess(&self, fault: &mut FaultRecord, registry: &ServoRegistry) {
        let load_bearing = fault
            .joint
            .and_then(|id| registry.get(id))
            .is_some_and(|spec| spec.load_bearing);
        let fatal = match fault.kind {
            FaultKind::BusTimeout => load_bearing,
            FaultKind::SensorDropout => fault.joint.is_none() || load_bearing,
            FaultKind::InitFailed => true,
            FaultKind::ChecksumError
            | FaultKind::CommandOutOfRange
            | FaultKind::PolicyTimeout
            | FaultKind::TickOverrun => false,
        };
        fault.fatal |= fatal;
    }

    /// Commands issued on entry to SAFE_STOP.
    ///
    /// `HoldPosition` falls back to disabling a joint whose last reading is
    /// stale or missing.
    pub fn safe_stop_commands(
        &self,
        registry: &ServoRegistry,
        last_state: Option<&RobotState>,
    ) -> Vec<JointCommand> {
        registry
            .iter()
            .map(|spec| match self.config.safe_stop_action {
                SafeStopAction::DisableTorque => JointCommand::disabled(spec.id),
                SafeStopAction::HoldPosition => last_state
                    .and_then(|s| s.joint(spec.id))
                    .filter(|j| !j.stale)
                    .map(|j| JointCommand::position(spec.id, spec.clamp_position(j.position_rad)))
                    .unwrap_or_else(|| JointCommand::disabled(spec.id)),
            })
            .collect()
    }
}

enum Screened {
    Pass(JointCommand),
    Clamped(JointCommand, FaultRecord),
    Rejected(FaultRecord),
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
