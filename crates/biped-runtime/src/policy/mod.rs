//! Policy interface and the budgeted runner around it.
//!
//! A [`Policy`] maps the tick's [`RobotState`] to joint commands.  It only
//! borrows the state, so it cannot mutate what the rest of the tick sees.
//!
//! [`PolicyRunner`] times every `decide` call against the tick's compute
//! budget.  Output that arrives late is discarded: the previous tick's
//! position commands are held, torque commands drop to zero, and a
//! `PolicyTimeout` fault is raised.  A streak of `max_policy_timeouts`
//! consecutive timeouts makes the fault fatal.
//!
//! # Implementations
//!
//! - [`scripted::ScriptedGait`] – deterministic open-loop stepping pattern.
//! - [`learned::LearnedPolicy`] – frozen MLP loaded from a JSON artifact.
//! - [`teleop::TeleopRelay`] – forwards the latest operator commands.

pub mod learned;
pub mod scripted;
pub mod teleop;

use std::time::Duration;

use biped_kernel::StreakCounter;
use biped_types::{FaultKind, FaultRecord, JointCommand, JointTarget, RobotState, TimingConfig};
use tracing::{debug, warn};

use crate::clock::Clock;

pub use learned::{LayerWeights, LearnedPolicy, PolicyArtifact};
pub use scripted::ScriptedGait;
pub use teleop::{TeleopRelay, TeleopSender};

/// Maps a sensor snapshot to joint commands.
pub trait Policy: Send {
    /// Short identifier used in logs and status output.
    fn name(&self) -> &str;

    fn decide(&mut self, state: &RobotState) -> Vec<JointCommand>;

    /// Drop internal history.  Called when the loop leaves SAFE_STOP.
    fn reset(&mut self) {}
}

/// Commands for one tick plus the timeout fault, if the policy was late.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub commands: Vec<JointCommand>,
    pub fault: Option<FaultRecord>,
}

/// Runs a [`Policy`] under a per-tick compute budget.
pub struct PolicyRunner {
    policy: Box<dyn Policy>,
    budget: Duration,
    timeouts: StreakCounter,
    held: Vec<JointCommand>,
}

impl PolicyRunner {
    pub fn new(policy: Box<dyn Policy>, timing: &TimingConfig) -> Self {
        Self {
            policy,
            budget: timing.policy_budget(),
            timeouts: StreakCounter::new(timing.max_policy_timeouts),
            held: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.policy.name()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Consecutive timeouts so far.
    pub fn timeout_streak(&self) -> u32 {
        self.timeouts.count()
    }

    /// Ask the policy for this tick's commands.
    pub fn run(&mut self, state: &RobotState, clock: &dyn Clock) -> PolicyOutcome {
        let started = clock.now();
        let commands = self.policy.decide(state);
        let elapsed = clock.now().saturating_sub(started);

        if elapsed <= self.budget {
            self.timeouts.record(false);
            return PolicyOutcome {
                commands,
                fault: None,
            };
        }

        let tripped = self.timeouts.record(true);
        warn!(
            policy = self.policy.name(),
            tick = state.tick,
            elapsed_us = elapsed.as_micros() as u64,
            budget_us = self.budget.as_micros() as u64,
            streak = self.timeouts.count(),
            "policy exceeded its budget; holding previous commands"
        );
        let mut fault = FaultRecord::new(
            FaultKind::PolicyTimeout,
            state.tick,
            format!(
                "decide took {:.2} ms of a {:.2} ms budget ({} in a row)",
                elapsed.as_secs_f64() * 1e3,
                self.budget.as_secs_f64() * 1e3,
                self.timeouts.count()
            ),
        );
        if tripped {
            fault = fault.fatal();
        }
        PolicyOutcome {
            commands: self.fallback(),
            fault: Some(fault),
        }
    }

    /// Remember the commands that were actually dispatched, for holding on a
    /// later timeout.
    pub fn commit(&mut self, dispatched: &[JointCommand]) {
        self.held.clear();
        self.held.extend_from_slice(dispatched);
    }

    pub fn reset(&mut self) {
        debug!(policy = self.policy.name(), "policy reset");
        self.timeouts.reset();
        self.held.clear();
        self.policy.reset();
    }

    fn fallback(&self) -> Vec<JointCommand> {
        self.held
            .iter()
            .map(|cmd| match cmd.target {
                JointTarget::Torque(_) => JointCommand::torque(cmd.id, 0.0),
                _ => *cmd,
            })
            .collect()
    }
}
