//! `biped-kernel` – safety enforcement for the control loop.
//!
//! It does not decide how the robot moves; it decides what is allowed to
//! reach the servos and when the loop must stop.
//!
//! # Modules
//!
//! - [`supervisor`] – [`SafetySupervisor`][supervisor::SafetySupervisor]:
//!   clamps every policy command to the joint's limits, raises
//!   `CommandOutOfRange` faults, and decides which faults force SAFE_STOP.
//! - [`fault_log`] – [`FaultLog`][fault_log::FaultLog]: bounded ring of
//!   [`FaultRecord`][biped_types::FaultRecord]s that overwrites the oldest
//!   entry and can be drained from another thread without blocking the
//!   control loop.
//! - [`watchdog`] – [`TickWatchdog`][watchdog::TickWatchdog] and
//!   [`StreakCounter`][watchdog::StreakCounter]: detect consecutive tick
//!   overruns and other repeated failures.

pub mod fault_log;
pub mod supervisor;
pub mod watchdog;

pub use fault_log::FaultLog;
pub use supervisor::{SafetySupervisor, Validation};
pub use watchdog::{StreakCounter, TickVerdict, TickWatchdog};
