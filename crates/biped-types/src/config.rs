//! Static configuration: joint table plus timing, bus, safety and fusion
//! budgets.
//!
//! A [`RobotConfig`] is deserialised once at INIT (usually from TOML), checked
//! with [`RobotConfig::validate`], and then shared read-only by every
//! component.  Every field has a default so a partial file is valid.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BipedError;
use crate::joint::{Direction, JointSpec};

/// Control-loop timing budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Fixed tick period.  20 ms = 50 Hz.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,
    /// How far past the period a tick may run before it counts as an overrun.
    #[serde(default = "default_overrun_tolerance_ms")]
    pub overrun_tolerance_ms: u64,
    /// Consecutive overruns that force SAFE_STOP.
    #[serde(default = "default_max_consecutive_overruns")]
    pub max_consecutive_overruns: u32,
    /// Fraction of the tick period the policy may spend in `decide`.
    #[serde(default = "default_policy_budget_fraction")]
    pub policy_budget_fraction: f32,
    /// Consecutive policy timeouts that force SAFE_STOP.
    #[serde(default = "default_max_policy_timeouts")]
    pub max_policy_timeouts: u32,
    /// How long INIT waits for every servo to acknowledge a ping.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

impl TimingConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn overrun_tolerance(&self) -> Duration {
        Duration::from_millis(self.overrun_tolerance_ms)
    }

    /// Per-tick compute budget granted to the policy.
    pub fn policy_budget(&self) -> Duration {
        self.tick_period()
            .mul_f32(self.policy_budget_fraction.clamp(0.0, 1.0))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: default_tick_period_ms(),
            overrun_tolerance_ms: default_overrun_tolerance_ms(),
            max_consecutive_overruns: default_max_consecutive_overruns(),
            policy_budget_fraction: default_policy_budget_fraction(),
            max_policy_timeouts: default_max_policy_timeouts(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

/// Serial bus parameters and retry budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial device path used by the hardware backend.
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Retries per transaction after the first attempt.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// How long to wait for a servo's reply before counting an attempt lost.
    #[serde(default = "default_reply_timeout_us")]
    pub reply_timeout_us: u64,
    /// First backoff delay; doubles on each retry.
    #[serde(default = "default_backoff_base_us")]
    pub backoff_base_us: u64,
    /// Discard the echo of our own frame on single-wire (shared TX/RX) buses.
    #[serde(default)]
    pub echo_suppression: bool,
    /// Bound on joint telemetry reads per tick; `None` reads every joint.
    #[serde(default)]
    pub joint_reads_per_tick: Option<usize>,
    /// Consecutive failed reads that escalate to a sensor dropout.
    #[serde(default = "default_stale_reads_before_dropout")]
    pub stale_reads_before_dropout: u32,
}

impl BusConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_micros(self.reply_timeout_us)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_micros(self.backoff_base_us)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            retry_budget: default_retry_budget(),
            reply_timeout_us: default_reply_timeout_us(),
            backoff_base_us: default_backoff_base_us(),
            echo_suppression: false,
            joint_reads_per_tick: None,
            stale_reads_before_dropout: default_stale_reads_before_dropout(),
        }
    }
}

/// What SAFE_STOP does to the actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeStopAction {
    /// Torque off on every joint.
    #[default]
    DisableTorque,
    /// Command every joint to its last measured position.
    HoldPosition,
}

/// Safety supervisor thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// A position clamp larger than this (rad) means the policy is
    /// malfunctioning rather than overshooting.
    #[serde(default = "default_hard_clamp_rad")]
    pub hard_clamp_rad: f32,
    /// Same threshold for torque commands (N·m).
    #[serde(default = "default_hard_clamp_torque")]
    pub hard_clamp_torque: f32,
    #[serde(default)]
    pub safe_stop_action: SafeStopAction,
    /// Capacity of the fault ring buffer.
    #[serde(default = "default_fault_log_capacity")]
    pub fault_log_capacity: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            hard_clamp_rad: default_hard_clamp_rad(),
            hard_clamp_torque: default_hard_clamp_torque(),
            safe_stop_action: SafeStopAction::default(),
            fault_log_capacity: default_fault_log_capacity(),
        }
    }
}

/// Orientation filter tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Complementary filter coefficient; higher trusts the gyro more.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    /// Accelerometer corrections are skipped when |a| deviates from 1 g by
    /// more than this fraction (the robot is accelerating, not just tilted).
    #[serde(default = "default_accel_trust_band")]
    pub accel_trust_band: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            accel_trust_band: default_accel_trust_band(),
        }
    }
}

/// Complete static configuration of one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default = "default_joints")]
    pub joints: Vec<JointSpec>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            bus: BusConfig::default(),
            safety: SafetyConfig::default(),
            fusion: FusionConfig::default(),
            joints: default_joints(),
        }
    }
}

impl RobotConfig {
    /// Check budgets and the joint table.  Duplicate addresses are left to the
    /// servo registry, which owns that invariant.
    pub fn validate(&self) -> Result<(), BipedError> {
        if self.timing.tick_period_ms == 0 {
            return Err(BipedError::Config("tick_period_ms must be > 0".into()));
        }
        let fraction = self.timing.policy_budget_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(BipedError::Config(format!(
                "policy_budget_fraction {fraction} must be in (0, 1]"
            )));
        }
        if self.timing.max_consecutive_overruns == 0 || self.timing.max_policy_timeouts == 0 {
            return Err(BipedError::Config(
                "overrun and policy-timeout thresholds must be >= 1".into(),
            ));
        }
        if self.bus.stale_reads_before_dropout == 0 {
            return Err(BipedError::Config(
                "stale_reads_before_dropout must be >= 1".into(),
            ));
        }
        if self.bus.joint_reads_per_tick == Some(0) {
            return Err(BipedError::Config("joint_reads_per_tick must be >= 1".into()));
        }
        if self.safety.fault_log_capacity == 0 {
            return Err(BipedError::Config("fault_log_capacity must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.fusion.alpha) {
            return Err(BipedError::Config(format!(
                "fusion alpha {} must be in [0, 1]",
                self.fusion.alpha
            )));
        }
        if self.joints.is_empty() {
            return Err(BipedError::Config("joint table is empty".into()));
        }
        let mut names = HashSet::new();
        for spec in &self.joints {
            spec.validate()?;
            if !names.insert(spec.name.as_str()) {
                return Err(BipedError::Config(format!(
                    "joint name '{}' is used twice",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

fn default_tick_period_ms() -> u64 {
    20
}
fn default_overrun_tolerance_ms() -> u64 {
    2
}
fn default_max_consecutive_overruns() -> u32 {
    5
}
fn default_policy_budget_fraction() -> f32 {
    0.5
}
fn default_max_policy_timeouts() -> u32 {
    5
}
fn default_startup_timeout_ms() -> u64 {
    2_000
}
fn default_serial_port() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_baud_rate() -> u32 {
    1_000_000
}
fn default_retry_budget() -> u32 {
    2
}
fn default_reply_timeout_us() -> u64 {
    1_500
}
fn default_backoff_base_us() -> u64 {
    200
}
fn default_stale_reads_before_dropout() -> u32 {
    3
}
fn default_hard_clamp_rad() -> f32 {
    0.35
}
fn default_hard_clamp_torque() -> f32 {
    1.0
}
fn default_fault_log_capacity() -> usize {
    256
}
fn default_alpha() -> f32 {
    0.98
}
fn default_accel_trust_band() -> f32 {
    0.15
}

/// The ten-joint leg chain: hip pitch/yaw/roll, knee pitch and ankle pitch on
/// each side, on bus addresses 1–10.
pub fn default_joints() -> Vec<JointSpec> {
    const LEG: [(&str, f32, f32, bool); 5] = [
        ("hip_pitch", -1.57, 1.57, true),
        ("hip_yaw", -0.6, 0.6, false),
        ("hip_roll", -0.5, 0.5, false),
        ("knee_pitch", -0.1, 2.2, true),
        ("ankle_pitch", -1.0, 1.0, true),
    ];
    ["left", "right"]
        .iter()
        .enumerate()
        .flat_map(|(side_idx, side)| {
            LEG.iter()
                .enumerate()
                .map(move |(i, (joint, min, max, load_bearing))| {
                    let index = side_idx * LEG.len() + i;
                    JointSpec {
                        id: index as u16,
                        name: format!("{side}_{joint}"),
                        bus_address: (index + 1) as u8,
                        min_angle_rad: *min,
                        max_angle_rad: *max,
                        max_torque: 2.9,
                        // Right-side servos are mirrored.
                        direction: if side_idx == 0 {
                            Direction::Forward
                        } else {
                            Direction::Reverse
                        },
                        zero_offset_ticks: 0,
                        gear_ratio: 1.0,
                        load_bearing: *load_bearing,
                    }
                })
        })
        .collect()
}
