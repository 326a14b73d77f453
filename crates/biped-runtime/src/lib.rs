//! `biped-runtime` – the real-time control loop.
//!
//! Wires the hardware layer, orientation fusion, safety kernel and a
//! pluggable policy into a fixed-rate loop.
//!
//! # Modules
//!
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   INIT → RUNNING → SAFE_STOP → TERMINATED state machine, plus
//!   [`LoopControl`][control_loop::LoopControl] for operator requests and
//!   [`LoopMonitor`][control_loop::LoopMonitor] for lock-free status reads.
//! - [`sensor`] – [`SensorReader`][sensor::SensorReader]: IMU fusion and
//!   round-robin joint telemetry, with stale tracking and dropout escalation.
//! - [`policy`] – the [`Policy`][policy::Policy] trait, its budgeted runner,
//!   and the scripted, learned and teleop implementations.
//! - [`clock`] – monotonic and hand-driven time sources.
//! - [`stats`] – tick timing statistics.
//! - [`telemetry_window`] – one-second sliding view of loop frequency and
//!   joint tracking.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.

pub mod clock;
pub mod control_loop;
pub mod policy;
pub mod sensor;
pub mod stats;
pub mod telemetry;
pub mod telemetry_window;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use control_loop::{
    ControlLoop, LoopControl, LoopMonitor, LoopState, LoopStatus, TerminationReason,
};
pub use policy::{LearnedPolicy, Policy, PolicyRunner, ScriptedGait, TeleopRelay, TeleopSender};
pub use sensor::{SensorPoll, SensorReader};
pub use stats::{TickStats, TickStatsSnapshot};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use telemetry_window::{TelemetrySummary, TelemetryWindow, TickSample};
