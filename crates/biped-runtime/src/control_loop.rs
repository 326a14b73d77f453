//! [`ControlLoop`] – the fixed-rate sense → decide → act cycle.
//!
//! ```text
//!   INIT ──all servos ack──▶ RUNNING ──fatal fault──▶ SAFE_STOP ──reset()──▶ RUNNING
//!     │                         │                         │
//!     └─startup timeout─▶ TERMINATED(InitFailed)          └──shutdown──▶ TERMINATED(Shutdown)
//! ```
//!
//! A RUNNING tick:
//!
//! 1. poll the sensors into a fresh [`RobotState`];
//! 2. run the policy against it, under its compute budget;
//! 3. pass the output through the [`SafetySupervisor`];
//! 4. dispatch the validated commands over the bus;
//! 5. check the tick against its deadline.
//!
//! Any fatal fault along the way skips the remaining steps and enters
//! SAFE_STOP, which commands every joint to its safe state, keeps polling
//! sensors, and dispatches nothing else until an explicit reset.  A safe-state
//! write that is not acknowledged is resent on every SAFE_STOP tick until it
//! lands.
//!
//! Torque-mode targets only write the goal PWM register, so the loop enables
//! torque on a joint before its first torque command, and again after the
//! joint has been disabled.
//!
//! Ticks are strictly sequential: [`ControlLoop::tick`] takes `&mut self`
//! and nothing in it re-enters.  Operator requests ([`LoopControl`]) are only
//! looked at between ticks, and a status snapshot is published after every
//! tick through [`LoopMonitor`] without blocking the loop.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use biped_hal::{BusStats, ImuSource, ServoBus, ServoRegistry};
use biped_kernel::{FaultLog, SafetySupervisor, TickVerdict, TickWatchdog};
use biped_types::{
    BipedError, FaultKind, FaultRecord, JointCommand, JointId, JointTarget, RobotConfig,
    RobotState,
};
use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{debug, debug_span, error, info, warn};

use crate::clock::Clock;
use crate::policy::{Policy, PolicyRunner};
use crate::sensor::SensorReader;
use crate::stats::{TickStats, TickStatsSnapshot};
use crate::telemetry_window::{JointSample, TickSample};

// ─────────────────────────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────────────────────────

/// Why the loop stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminationReason {
    /// A configured servo never acknowledged during INIT.
    InitFailed,
    /// Operator-requested shutdown.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Init,
    Running,
    SafeStop,
    Terminated(TerminationReason),
}

impl LoopState {
    pub fn is_terminated(self) -> bool {
        matches!(self, LoopState::Terminated(_))
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Init => f.write_str("INIT"),
            LoopState::Running => f.write_str("RUNNING"),
            LoopState::SafeStop => f.write_str("SAFE_STOP"),
            LoopState::Terminated(reason) => write!(f, "TERMINATED({reason:?})"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operator control and status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Flags {
    shutdown: AtomicBool,
    reset: AtomicBool,
}

/// Requests delivered to the loop at the next tick boundary.  Clones share
/// the same flags, so a signal handler and a REPL can both hold one.
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    flags: Arc<Flags>,
}

impl LoopControl {
    pub fn request_shutdown(&self) {
        self.flags.shutdown.store(true, Ordering::SeqCst);
    }

    /// Ask to leave SAFE_STOP.  Ignored in any other state.
    pub fn request_reset(&self) {
        self.flags.reset.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.flags.shutdown.load(Ordering::SeqCst)
    }

    fn take_reset(&self) -> bool {
        self.flags.reset.swap(false, Ordering::SeqCst)
    }
}

/// Snapshot published after every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    /// Ticks completed so far.
    pub tick: u64,
    pub policy: String,
    pub last_fault: Option<FaultRecord>,
    pub stats: TickStatsSnapshot,
    pub bus_retries: u64,
    pub bus_timeouts: u64,
    pub robot: Option<RobotState>,
}

/// Read side of the status snapshot.  Reads never block the loop.
#[derive(Debug, Clone)]
pub struct LoopMonitor {
    status: Arc<ArcSwap<LoopStatus>>,
}

impl LoopMonitor {
    pub fn status(&self) -> Arc<LoopStatus> {
        self.status.load_full()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    config: RobotConfig,
    registry: ServoRegistry,
    bus: Box<dyn ServoBus>,
    sensors: SensorReader,
    policy: PolicyRunner,
    supervisor: SafetySupervisor,
    watchdog: TickWatchdog,
    faults: FaultLog,
    clock: Arc<dyn Clock>,
    state: LoopState,
    tick: u64,
    stats: TickStats,
    control: LoopControl,
    status: Arc<ArcSwap<LoopStatus>>,
    telemetry: Option<Sender<TickSample>>,
    last_state: Option<RobotState>,
    last_fault: Option<FaultRecord>,
    /// Last bus counters fetched; kept when a fetch times out.
    bus_stats: BusStats,
    /// Joints whose torque enable has been acknowledged since last disabled.
    torque_on: HashSet<JointId>,
    /// Safe-state commands not yet acknowledged by their servo.
    unacked_safe_state: Vec<JointCommand>,
}

/// Outcome of writing a batch of commands.
struct Dispatch {
    fatal: bool,
    failed: Vec<JointCommand>,
}

impl ControlLoop {
    /// Assemble a loop in INIT.  Nothing touches the bus until [`init`][Self::init].
    pub fn new(
        config: RobotConfig,
        registry: ServoRegistry,
        bus: Box<dyn ServoBus>,
        imu: Box<dyn ImuSource>,
        policy: Box<dyn Policy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BipedError> {
        config.validate()?;
        let timing = &config.timing;
        let sensors = SensorReader::new(&registry, imu, &config);
        let policy = PolicyRunner::new(policy, timing);
        let watchdog = TickWatchdog::new(
            timing.tick_period(),
            timing.overrun_tolerance(),
            timing.max_consecutive_overruns,
        );
        let supervisor = SafetySupervisor::new(config.safety.clone());
        let faults = FaultLog::new(config.safety.fault_log_capacity);
        let status = Arc::new(ArcSwap::from_pointee(LoopStatus {
            state: LoopState::Init,
            tick: 0,
            policy: policy.name().to_string(),
            last_fault: None,
            stats: TickStatsSnapshot::default(),
            bus_retries: 0,
            bus_timeouts: 0,
            robot: None,
        }));
        Ok(Self {
            config,
            registry,
            bus,
            sensors,
            policy,
            supervisor,
            watchdog,
            faults,
            clock,
            state: LoopState::Init,
            tick: 0,
            stats: TickStats::new(),
            control: LoopControl::default(),
            status,
            telemetry: None,
            last_state: None,
            last_fault: None,
            bus_stats: BusStats::default(),
            torque_on: HashSet::new(),
            unacked_safe_state: Vec::new(),
        })
    }

    /// Stream a [`TickSample`] per RUNNING tick into `tx`.  Samples are
    /// dropped when the channel is full.
    pub fn with_telemetry(mut self, tx: Sender<TickSample>) -> Self {
        self.telemetry = Some(tx);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn control(&self) -> LoopControl {
        self.control.clone()
    }

    pub fn monitor(&self) -> LoopMonitor {
        LoopMonitor {
            status: Arc::clone(&self.status),
        }
    }

    /// Shared handle to the fault ring, for draining from another thread.
    pub fn fault_log(&self) -> FaultLog {
        self.faults.clone()
    }

    pub fn registry(&self) -> &ServoRegistry {
        &self.registry
    }

    pub fn stats(&self) -> TickStatsSnapshot {
        self.stats.snapshot()
    }

    /// State built by the most recent tick.
    pub fn last_state(&self) -> Option<&RobotState> {
        self.last_state.as_ref()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Ping every configured servo until all acknowledge or the startup
    /// timeout expires.  On timeout the loop terminates with
    /// [`TerminationReason::InitFailed`] and never runs.
    pub fn init(&mut self) -> Result<(), BipedError> {
        if self.state != LoopState::Init {
            return Err(BipedError::InvalidTransition(format!(
                "init() called in {}",
                self.state
            )));
        }
        let timeout = self.config.timing.startup_timeout();
        let deadline = self.clock.now() + timeout;
        let mut missing: Vec<u8> = self.registry.iter().map(|s| s.bus_address).collect();
        info!(servos = missing.len(), timeout_ms = timeout.as_millis() as u64, "INIT: probing servo bus");

        loop {
            let bus = &mut self.bus;
            missing.retain(|&address| bus.transact(&ServoRegistry::ping_frame(address)).is_err());
            if missing.is_empty() {
                break;
            }
            let now = self.clock.now();
            if now >= deadline {
                let err = BipedError::InitFailed {
                    missing: missing.clone(),
                };
                let mut fault = FaultRecord::new(FaultKind::InitFailed, 0, err.to_string());
                if let [address] = missing[..] {
                    if let Some(spec) = self.registry.iter().find(|s| s.bus_address == address) {
                        fault = fault.for_joint(spec.id);
                    }
                }
                self.raise(fault);
                self.state = LoopState::Terminated(TerminationReason::InitFailed);
                error!(missing = ?missing, "INIT failed");
                self.publish();
                return Err(err);
            }
            debug!(missing = ?missing, "waiting for servos to acknowledge");
            self.clock
                .sleep(self.config.timing.tick_period().min(deadline - now));
        }

        self.state = LoopState::Running;
        info!(
            policy = self.policy.name(),
            period_ms = self.config.timing.tick_period_ms,
            "INIT complete; RUNNING"
        );
        self.publish();
        Ok(())
    }

    /// Run one tick and return the state afterwards.
    pub fn tick(&mut self) -> Result<LoopState, BipedError> {
        match self.state {
            LoopState::Init | LoopState::Terminated(_) => {
                return Err(BipedError::InvalidTransition(format!(
                    "tick() called in {}",
                    self.state
                )));
            }
            LoopState::Running | LoopState::SafeStop => {}
        }

        self.apply_control_requests();
        if self.state.is_terminated() {
            return Ok(self.state);
        }

        let tick = self.tick;
        let span = debug_span!("tick", tick, state = %self.state);
        let _enter = span.enter();
        let started = self.clock.now();

        let poll = self
            .sensors
            .poll(self.bus.as_mut(), &self.registry, self.clock.as_ref(), tick);
        let mut fatal = false;
        for fault in poll.faults {
            fatal |= self.raise(fault);
        }
        self.refresh_bus_stats(tick);
        let robot_state = poll.state;

        if self.state == LoopState::SafeStop {
            self.resend_safe_state(tick);
        }

        let mut overran = false;
        if self.state == LoopState::Running {
            if !fatal {
                fatal |= self.act(&robot_state, tick);
            }
            let elapsed = self.clock.now().saturating_sub(started);
            match self.watchdog.observe(elapsed) {
                TickVerdict::OnTime => {}
                TickVerdict::Overrun { excess, streak } => {
                    overran = true;
                    self.raise(FaultRecord::new(
                        FaultKind::TickOverrun,
                        tick,
                        format!("{:.2} ms over deadline ({streak} in a row)", ms(excess)),
                    ));
                }
                TickVerdict::Tripped { excess, streak } => {
                    overran = true;
                    fatal |= self.raise(
                        FaultRecord::new(
                            FaultKind::TickOverrun,
                            tick,
                            format!("{:.2} ms over deadline; {streak} consecutive overruns", ms(excess)),
                        )
                        .fatal(),
                    );
                }
            }
        }

        self.last_state = Some(robot_state);
        if fatal && self.state == LoopState::Running {
            self.enter_safe_stop(tick);
        }

        let elapsed = self.clock.now().saturating_sub(started);
        self.stats.record(started, elapsed, overran);
        self.tick += 1;
        self.publish();
        Ok(self.state)
    }

    /// Leave SAFE_STOP and resume RUNNING with fresh streak counters.
    pub fn reset(&mut self) -> Result<(), BipedError> {
        if self.state != LoopState::SafeStop {
            return Err(BipedError::InvalidTransition(format!(
                "reset() is only valid in SAFE_STOP, not {}",
                self.state
            )));
        }
        self.watchdog.reset();
        self.policy.reset();
        self.sensors.reset();
        self.unacked_safe_state.clear();
        self.state = LoopState::Running;
        info!(tick = self.tick, "reset; RUNNING");
        self.publish();
        Ok(())
    }

    /// Stop for good.  A RUNNING loop passes through SAFE_STOP first so the
    /// actuators are left in their safe state.
    pub fn shutdown(&mut self) {
        match self.state {
            LoopState::Terminated(_) => return,
            LoopState::Running => self.enter_safe_stop(self.tick),
            LoopState::SafeStop => self.resend_safe_state(self.tick),
            LoopState::Init => {}
        }
        self.state = LoopState::Terminated(TerminationReason::Shutdown);
        info!(tick = self.tick, "shutdown complete");
        self.publish();
    }

    /// INIT (if needed), then tick at the configured period until terminated.
    ///
    /// Each tick is followed by a sleep for whatever is left of its period; a
    /// tick that runs long is followed immediately by the next one.
    pub fn run(&mut self) -> Result<TerminationReason, BipedError> {
        if self.state == LoopState::Init {
            self.init()?;
        }
        let period = self.config.timing.tick_period();
        loop {
            let started = self.clock.now();
            if let LoopState::Terminated(reason) = self.tick()? {
                return Ok(reason);
            }
            let elapsed = self.clock.now().saturating_sub(started);
            self.clock.sleep(period.saturating_sub(elapsed));
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn apply_control_requests(&mut self) {
        if self.control.shutdown_requested() {
            self.shutdown();
            return;
        }
        if self.control.take_reset() && self.state == LoopState::SafeStop {
            // reset() only fails outside SAFE_STOP, which was just ruled out.
            let _ = self.reset();
        }
    }

    /// Policy → supervisor → dispatch.  Returns `true` on a fatal fault.
    fn act(&mut self, robot_state: &RobotState, tick: u64) -> bool {
        let outcome = self.policy.run(robot_state, self.clock.as_ref());
        if let Some(fault) = outcome.fault {
            if self.raise(fault) {
                return true;
            }
        }

        let validation = self
            .supervisor
            .validate(&outcome.commands, &self.registry, tick);
        let mut fatal = false;
        for fault in validation.faults {
            fatal |= self.raise(fault);
        }
        if fatal {
            return true;
        }

        fatal |= self.dispatch(&validation.commands, tick).fatal;
        self.policy.commit(&validation.commands);
        self.send_telemetry(robot_state, &validation.commands);
        fatal
    }

    /// Write `commands` to the bus.  Each failed write is a `BusTimeout`
    /// scoped to its joint.
    fn dispatch(&mut self, commands: &[JointCommand], tick: u64) -> Dispatch {
        let mut out = Dispatch {
            fatal: false,
            failed: Vec::new(),
        };
        for cmd in commands {
            if let Err(err) = self.write_command(cmd) {
                out.fatal |= self.raise(
                    FaultRecord::new(FaultKind::BusTimeout, tick, format!("write failed: {err}"))
                        .for_joint(cmd.id),
                );
                out.failed.push(*cmd);
            }
        }
        out
    }

    fn write_command(&mut self, cmd: &JointCommand) -> Result<(), BipedError> {
        match cmd.target {
            JointTarget::Torque(_) if !self.torque_on.contains(&cmd.id) => {
                let enable = self.registry.torque_enable_frame(cmd.id)?;
                self.bus.transact(&enable)?;
                debug!(joint = cmd.id, "torque enabled");
                self.torque_on.insert(cmd.id);
            }
            // Forget the enable up front: a lost disable may still have landed.
            JointTarget::Disabled => {
                self.torque_on.remove(&cmd.id);
            }
            JointTarget::Torque(_) | JointTarget::Position(_) => {}
        }
        let frame = self.registry.to_raw_command(cmd)?;
        self.bus.transact(&frame)?;
        // Position writes set the enable register themselves.
        if let JointTarget::Position(_) = cmd.target {
            self.torque_on.insert(cmd.id);
        }
        Ok(())
    }

    fn enter_safe_stop(&mut self, tick: u64) {
        let commands = self
            .supervisor
            .safe_stop_commands(&self.registry, self.last_state.as_ref());
        warn!(
            tick,
            action = ?self.config.safety.safe_stop_action,
            "entering SAFE_STOP"
        );
        self.state = LoopState::SafeStop;
        self.unacked_safe_state = self.dispatch(&commands, tick).failed;
        if !self.unacked_safe_state.is_empty() {
            let joints: Vec<JointId> = self.unacked_safe_state.iter().map(|c| c.id).collect();
            warn!(tick, joints = ?joints, "safe state not acknowledged; resending each tick");
        }
    }

    fn resend_safe_state(&mut self, tick: u64) {
        if self.unacked_safe_state.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.unacked_safe_state);
        self.unacked_safe_state = self.dispatch(&pending, tick).failed;
        if self.unacked_safe_state.is_empty() {
            info!(tick, "safe state acknowledged by every joint");
        }
    }

    /// Classify, log and remember `fault`.  Returns whether it is fatal.
    fn raise(&mut self, mut fault: FaultRecord) -> bool {
        self.supervisor.assess(&mut fault, &self.registry);
        let fatal = fault.fatal;
        self.last_fault = Some(fault.clone());
        self.faults.push(fault);
        fatal
    }

    /// Fetch the bus counters and report checksum errors since the last
    /// fetch.  An unavailable fetch changes nothing.
    fn refresh_bus_stats(&mut self, tick: u64) {
        let Some(stats) = self.bus.stats() else {
            debug!(tick, "bus counters unavailable this tick");
            return;
        };
        let new = stats
            .checksum_errors
            .saturating_sub(self.bus_stats.checksum_errors);
        self.bus_stats = stats;
        if new > 0 {
            self.raise(FaultRecord::new(
                FaultKind::ChecksumError,
                tick,
                format!("{new} checksum error(s) retried this tick"),
            ));
        }
    }

    fn send_telemetry(&self, robot_state: &RobotState, dispatched: &[JointCommand]) {
        let Some(tx) = &self.telemetry else {
            return;
        };
        let joints = robot_state
            .joints
            .iter()
            .map(|j| JointSample {
                id: j.id,
                position_rad: j.position_rad,
                velocity_rad_s: j.velocity_rad_s,
                desired_rad: dispatched.iter().find(|c| c.id == j.id).and_then(|c| {
                    match c.target {
                        JointTarget::Position(rad) => Some(rad),
                        _ => None,
                    }
                }),
            })
            .collect();
        let _ = tx.try_send(TickSample {
            tick: robot_state.tick,
            timestamp: self.clock.now(),
            joints,
        });
    }

    fn publish(&self) {
        let bus = self.bus_stats;
        self.status.store(Arc::new(LoopStatus {
            state: self.state,
            tick: self.tick,
            policy: self.policy.name().to_string(),
            last_fault: self.last_fault.clone(),
            stats: self.stats.snapshot(),
            bus_retries: bus.retries,
            bus_timeouts: bus.timeouts,
            robot: self.last_state.clone(),
        }));
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use biped_hal::{
        BusLink, BusTransport, ServoFrame, SimBus, SimControl, SimImu, StatusPacket,
        TransportConfig,
    };
    use biped_types::{Direction, JointSpec, SafeStopAction, Vec3};
    use proptest::prelude::*;
    use std::f32::consts::TAU;
    use std::sync::atomic::AtomicU64;

    // ── Fixtures ────────────────────────────────────────────────────────────

    fn spec(id: JointId, load_bearing: bool) -> JointSpec {
        JointSpec {
            id,
            name: format!("j{id}"),
            bus_address: id as u8 + 1,
            min_angle_rad: -1.0,
            max_angle_rad: 1.0,
            max_torque: 2.0,
            direction: Direction::Forward,
            zero_offset_ticks: 0,
            gear_ratio: 1.0,
            load_bearing,
        }
    }

    fn six_joints() -> Vec<JointSpec> {
        (0..6).map(|i| spec(i, false)).collect()
    }

    fn transport_config() -> TransportConfig {
        TransportConfig {
            retry_budget: 2,
            reply_timeout: Duration::ZERO,
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            echo_suppression: false,
        }
    }

    /// Emits a fixed batch; optionally burns clock time while deciding.
    struct Scripted {
        clock: ManualClock,
        delay_ms: Arc<AtomicU64>,
        commands: Vec<JointCommand>,
    }

    impl Policy for Scripted {
        fn name(&self) -> &str {
            "scripted-test"
        }

        fn decide(&mut self, _state: &RobotState) -> Vec<JointCommand> {
            self.clock
                .advance(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
            self.commands.clone()
        }
    }

    /// Sim link whose frames each take `per_frame` of clock time.
    struct SlowLink {
        inner: SimBus,
        clock: ManualClock,
        per_frame: Duration,
    }

    impl BusLink for SlowLink {
        fn send(&mut self, frame: &[u8]) -> Result<(), BipedError> {
            self.clock.advance(self.per_frame);
            self.inner.send(frame)
        }

        fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>, BipedError> {
            self.inner.receive(expected_len, timeout)
        }
    }

    /// Bus whose counters can be made unavailable, as a busy worker's are.
    struct GatedStats<B> {
        inner: B,
        down: Arc<AtomicBool>,
    }

    impl<B: ServoBus> ServoBus for GatedStats<B> {
        fn transact(&mut self, frame: &ServoFrame) -> Result<StatusPacket, BipedError> {
            self.inner.transact(frame)
        }

        fn stats(&self) -> Option<BusStats> {
            if self.down.load(Ordering::SeqCst) {
                None
            } else {
                self.inner.stats()
            }
        }
    }

    struct Rig {
        ctl: ControlLoop,
        sim: SimControl,
        clock: ManualClock,
        delay_ms: Arc<AtomicU64>,
        imu_fail: Arc<AtomicBool>,
        stats_down: Arc<AtomicBool>,
    }

    struct RigBuilder {
        specs: Vec<JointSpec>,
        commands: Vec<JointCommand>,
        config: RobotConfig,
        missing_servo: Option<u8>,
        per_frame: Duration,
    }

    impl RigBuilder {
        fn new(specs: Vec<JointSpec>) -> Self {
            Self {
                specs,
                commands: Vec::new(),
                config: RobotConfig::default(),
                missing_servo: None,
                per_frame: Duration::ZERO,
            }
        }

        fn commands(mut self, commands: Vec<JointCommand>) -> Self {
            self.commands = commands;
            self
        }

        fn config(mut self, f: impl FnOnce(&mut RobotConfig)) -> Self {
            f(&mut self.config);
            self
        }

        fn without_servo(mut self, address: u8) -> Self {
            self.missing_servo = Some(address);
            self
        }

        fn frame_time(mut self, per_frame: Duration) -> Self {
            self.per_frame = per_frame;
            self
        }

        fn build(self) -> Rig {
            let clock = ManualClock::new();
            let registry = ServoRegistry::load(self.specs.clone()).unwrap();
            let sim = self
                .specs
                .iter()
                .filter(|s| Some(s.bus_address) != self.missing_servo)
                .fold(SimBus::new(), |bus, s| bus.with_servo(s.bus_address));
            let sim_control = sim.control();
            let link = SlowLink {
                inner: sim,
                clock: clock.clone(),
                per_frame: self.per_frame,
            };
            let stats_down = Arc::new(AtomicBool::new(false));
            let bus = Box::new(GatedStats {
                inner: BusTransport::new(link, transport_config()),
                down: Arc::clone(&stats_down),
            });
            let imu = SimImu::upright();
            let imu_fail = imu.failure_switch();
            let delay_ms = Arc::new(AtomicU64::new(0));
            let policy = Scripted {
                clock: clock.clone(),
                delay_ms: Arc::clone(&delay_ms),
                commands: self.commands,
            };
            let mut config = self.config;
            config.joints = self.specs;
            let ctl = ControlLoop::new(
                config,
                registry,
                bus,
                Box::new(imu),
                Box::new(policy),
                Arc::new(clock.clone()),
            )
            .unwrap();
            Rig {
                ctl,
                sim: sim_control,
                clock,
                delay_ms,
                imu_fail,
                stats_down,
            }
        }
    }

    fn running(builder: RigBuilder) -> Rig {
        let mut rig = builder.build();
        rig.ctl.init().unwrap();
        rig
    }

    /// Goal positions (rad) written to `address`, for a forward, unit-ratio,
    /// zero-offset joint.
    fn written_positions(sim: &SimControl, address: u8) -> Vec<f32> {
        sim.writes_to(address)
            .iter()
            .filter(|p| p.len() == 5 && p[0] == 40)
            .map(|p| {
                let ticks = u16::from_le_bytes([p[3], p[4]]) as i32 - 2048;
                ticks as f32 * TAU / 4096.0
            })
            .collect()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    #[test]
    fn init_reaches_running() {
        let rig = running(RigBuilder::new(six_joints()));
        assert_eq!(rig.ctl.state(), LoopState::Running);
        assert_eq!(rig.ctl.monitor().status().state, LoopState::Running);
    }

    #[test]
    fn silent_servo_at_init_terminates_without_running() {
        let mut rig = RigBuilder::new(six_joints()).without_servo(4).build();
        let err = rig.ctl.init().unwrap_err();
        assert_eq!(err, BipedError::InitFailed { missing: vec![4] });
        assert_eq!(
            rig.ctl.state(),
            LoopState::Terminated(TerminationReason::InitFailed)
        );
        assert!(rig.ctl.tick().is_err());
        // Default startup timeout.
        assert!(rig.clock.now() >= Duration::from_secs(2));

        let faults = rig.ctl.fault_log().drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::InitFailed);
        assert_eq!(faults[0].joint, Some(3));
        assert!(faults[0].fatal);
        assert!(rig.sim.writes_to(1).is_empty());
    }

    #[test]
    fn late_servo_within_startup_timeout_is_accepted() {
        let mut rig = RigBuilder::new(six_joints()).build();
        rig.sim.drop_next(2, 6);
        rig.ctl.init().unwrap();
        assert_eq!(rig.ctl.state(), LoopState::Running);
    }

    #[test]
    fn tick_before_init_is_rejected() {
        let mut rig = RigBuilder::new(six_joints()).build();
        assert!(matches!(
            rig.ctl.tick(),
            Err(BipedError::InvalidTransition(_))
        ));
    }

    #[test]
    fn shutdown_passes_through_safe_stop() {
        let mut rig = running(
            RigBuilder::new(six_joints())
                .commands((0..6).map(|i| JointCommand::position(i, 0.1)).collect()),
        );
        rig.ctl.tick().unwrap();
        assert_eq!(rig.sim.torque_enabled(1), Some(true));

        rig.ctl.control().request_shutdown();
        let state = rig.ctl.tick().unwrap();
        assert_eq!(state, LoopState::Terminated(TerminationReason::Shutdown));
        for address in 1..=6 {
            assert_eq!(rig.sim.torque_enabled(address), Some(false));
        }
        assert!(rig.ctl.tick().is_err());
    }

    #[test]
    fn run_paces_ticks_at_the_period() {
        let mut rig = RigBuilder::new(six_joints()).build();
        let control = rig.ctl.control();
        let clock = rig.clock.clone();
        // Stop once ten periods have elapsed.
        let monitor = rig.ctl.monitor();
        let stopper = std::thread::spawn(move || {
            while monitor.status().tick < 10 {
                std::thread::yield_now();
            }
            control.request_shutdown();
        });
        let reason = rig.ctl.run().unwrap();
        stopper.join().unwrap();
        assert_eq!(reason, TerminationReason::Shutdown);
        let ticks = rig.ctl.ticks();
        assert!(ticks >= 10);
        // ManualClock: every tick is followed by a full-period sleep.
        assert_eq!(clock.now(), Duration::from_millis(20) * ticks as u32);
    }

    // ── Testable properties ─────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn dispatched_positions_respect_joint_limits(
            targets in proptest::collection::vec(-2.0f32..2.0, 6)
        ) {
            let commands = targets
                .iter()
                .enumerate()
                .map(|(i, t)| JointCommand::position(i as JointId, *t))
                .collect();
            let mut rig = running(RigBuilder::new(six_joints()).commands(commands));
            rig.ctl.tick().unwrap();
            for address in 1..=6u8 {
                for rad in written_positions(&rig.sim, address) {
                    // One servo tick of quantisation.
                    prop_assert!((-1.0 - 2e-3..=1.0 + 2e-3).contains(&rad), "rad = {}", rad);
                }
            }
        }
    }

    #[test]
    fn exhausted_read_makes_retry_budget_plus_one_attempts() {
        let mut rig = running(RigBuilder::new(six_joints()));
        rig.sim.silence(4);
        rig.sim.clear_history();
        rig.ctl.tick().unwrap();
        assert_eq!(rig.sim.frames_sent_to(4), 3);
        let faults = rig.ctl.fault_log().drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::BusTimeout);
    }

    #[test]
    fn safe_stop_after_exactly_n_overruns() {
        // 6 reads at 4 ms each: 24 ms against a 22 ms deadline.
        let mut rig = running(
            RigBuilder::new(six_joints())
                .frame_time(Duration::from_millis(4))
                .config(|c| c.timing.max_consecutive_overruns = 3),
        );
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);

        let overruns: Vec<_> = rig
            .ctl
            .fault_log()
            .drain()
            .into_iter()
            .filter(|f| f.kind == FaultKind::TickOverrun)
            .collect();
        assert_eq!(overruns.len(), 3);
        assert_eq!(overruns.iter().filter(|f| f.fatal).count(), 1);
        assert_eq!(rig.ctl.stats().overruns, 3);
    }

    #[test]
    fn robot_state_snapshots_are_independent() {
        let mut rig = running(RigBuilder::new(six_joints()));
        let monitor = rig.ctl.monitor();

        rig.sim.set_present_ticks(1, 2048 + 100);
        rig.sim.set_present_ticks(4, 2048 + 200);
        rig.ctl.tick().unwrap();
        let published = monitor.status();
        let gyro = rig.ctl.last_state().unwrap().imu.angular_velocity;

        let mut owned = rig.ctl.last_state().cloned().unwrap();
        owned.joints[0].position_rad = 0.9;
        owned.joints[3].position_rad = -0.9;
        owned.imu.angular_velocity = Vec3::new(5.0, 5.0, 5.0);
        owned.joints.truncate(2);

        // Joint 3 goes stale and must carry its own last reading forward.
        rig.sim.silence(4);
        rig.sim.set_present_ticks(1, 2048 + 300);
        rig.ctl.tick().unwrap();

        let next = rig.ctl.last_state().unwrap();
        assert_eq!(next.tick, 1);
        assert_eq!(next.joints.len(), 6);
        assert!((next.joint(0).unwrap().position_rad - 300.0 * TAU / 4096.0).abs() < 1e-5);
        let j3 = next.joint(3).unwrap();
        assert!(j3.stale);
        assert!((j3.position_rad - 200.0 * TAU / 4096.0).abs() < 1e-5);
        assert_eq!(next.imu.angular_velocity, gyro);
        assert_eq!(monitor.status().robot.as_ref(), Some(next));

        // The snapshot published before is untouched by the later tick.
        let first = published.robot.as_ref().unwrap();
        assert_eq!(first.tick, 0);
        assert!((first.joint(0).unwrap().position_rad - 100.0 * TAU / 4096.0).abs() < 1e-5);
        assert!(!first.joint(3).unwrap().stale);
        assert!(!Arc::ptr_eq(&published, &monitor.status()));
    }

    #[test]
    fn silent_joint_is_isolated() {
        let commands = (0..6).map(|i| JointCommand::position(i, 0.2)).collect();
        let mut rig = running(RigBuilder::new(six_joints()).commands(commands));
        rig.ctl.tick().unwrap();
        rig.ctl.tick().unwrap();
        assert!(rig.ctl.fault_log().drain().is_empty());

        rig.sim.silence(4);
        for _ in 0..5 {
            assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        }

        let faults = rig.ctl.fault_log().drain();
        assert!(!faults.is_empty());
        assert!(faults.iter().all(|f| f.joint == Some(3) && !f.fatal));
        assert!(faults.iter().any(|f| f.kind == FaultKind::BusTimeout));

        let state = rig.ctl.last_state().unwrap();
        let j3 = state.joint(3).unwrap();
        assert!(j3.stale);
        assert!((j3.position_rad - 0.2).abs() < 2e-3);
        assert!(state.joints.iter().filter(|j| j.id != 3).all(|j| !j.stale));
    }

    #[test]
    fn silent_load_bearing_joint_is_fatal() {
        let mut specs = six_joints();
        specs[3].load_bearing = true;
        let mut rig = running(RigBuilder::new(specs));
        rig.sim.silence(4);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
    }

    #[test]
    fn slight_overshoot_is_clamped_and_loop_keeps_running() {
        let max = 1.0;
        let mut rig = running(
            RigBuilder::new(six_joints()).commands(vec![JointCommand::position(2, max + 0.05)]),
        );
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);

        let faults = rig.ctl.fault_log().drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::CommandOutOfRange);
        assert_eq!(faults[0].joint, Some(2));
        assert!(!faults[0].fatal);

        let written = written_positions(&rig.sim, 3);
        assert_eq!(written.len(), 1);
        assert!((written[0] - max).abs() < 2e-3);
    }

    #[test]
    fn wild_command_forces_safe_stop_without_dispatch() {
        let mut rig = running(
            RigBuilder::new(six_joints()).commands(vec![JointCommand::position(2, 3.0)]),
        );
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
        assert!(written_positions(&rig.sim, 3).is_empty());
        assert_eq!(rig.sim.torque_enabled(3), Some(false));
    }

    #[test]
    fn policy_timeout_holds_then_stops() {
        let mut rig = running(
            RigBuilder::new(six_joints()).commands(vec![JointCommand::position(0, 0.3)]),
        );
        rig.ctl.tick().unwrap();

        // Late output would move the joint elsewhere; it must be discarded.
        rig.delay_ms.store(15, Ordering::SeqCst);
        rig.sim.clear_history();
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        let held = written_positions(&rig.sim, 1);
        assert_eq!(held.len(), 1);
        assert!((held[0] - 0.3).abs() < 2e-3);
        let faults = rig.ctl.fault_log().drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::PolicyTimeout);

        for _ in 0..3 {
            assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        }
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
    }

    #[test]
    fn torque_mode_enables_the_servo_and_again_after_reset() {
        let mut rig = running(
            RigBuilder::new(six_joints()).commands(vec![JointCommand::torque(0, 1.0)]),
        );
        assert_eq!(rig.sim.torque_enabled(1), Some(false));

        for _ in 0..3 {
            assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        }
        assert_eq!(rig.sim.torque_enabled(1), Some(true));
        let writes = rig.sim.writes_to(1);
        assert_eq!(writes.iter().filter(|p| p[..] == [40, 1]).count(), 1);
        assert_eq!(writes.iter().filter(|p| p[0] == 44).count(), 3);
        assert_eq!(writes[0], vec![40, 1]);

        rig.imu_fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            rig.ctl.tick().unwrap();
        }
        assert_eq!(rig.ctl.state(), LoopState::SafeStop);
        assert_eq!(rig.sim.torque_enabled(1), Some(false));

        rig.imu_fail.store(false, Ordering::SeqCst);
        rig.sim.clear_history();
        rig.ctl.control().request_reset();
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        assert_eq!(rig.sim.torque_enabled(1), Some(true));
        let writes = rig.sim.writes_to(1);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], vec![40, 1]);
        assert_eq!(writes[1][0], 44);
    }

    #[test]
    fn unavailable_bus_counters_do_not_replay_checksum_errors() {
        let mut rig = running(RigBuilder::new(six_joints()));
        let monitor = rig.ctl.monitor();
        rig.sim.corrupt_next(2, 1);
        rig.ctl.tick().unwrap();
        let faults = rig.ctl.fault_log().drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::ChecksumError);
        let retries = monitor.status().bus_retries;
        assert!(retries > 0);

        rig.stats_down.store(true, Ordering::SeqCst);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        // Last known counters stay published.
        assert_eq!(monitor.status().bus_retries, retries);

        rig.stats_down.store(false, Ordering::SeqCst);
        rig.ctl.tick().unwrap();
        rig.ctl.tick().unwrap();
        assert!(
            rig.ctl
                .fault_log()
                .drain()
                .iter()
                .all(|f| f.kind != FaultKind::ChecksumError)
        );
        assert_eq!(monitor.status().bus_retries, retries);
    }

    // ── SAFE_STOP behaviour ─────────────────────────────────────────────────

    #[test]
    fn safe_stop_polls_but_never_dispatches() {
        let commands = (0..6).map(|i| JointCommand::position(i, 0.1)).collect();
        let mut rig = running(RigBuilder::new(six_joints()).commands(commands));
        rig.imu_fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            rig.ctl.tick().unwrap();
        }
        assert_eq!(rig.ctl.state(), LoopState::SafeStop);
        let faults = rig.ctl.fault_log().drain();
        assert!(faults.iter().any(|f| f.is_imu_dropout() && f.fatal));

        rig.sim.clear_history();
        rig.ctl.tick().unwrap();
        rig.ctl.tick().unwrap();
        for address in 1..=6 {
            assert!(rig.sim.writes_to(address).is_empty());
            assert_eq!(rig.sim.frames_sent_to(address), 2);
        }
        assert_eq!(rig.ctl.state(), LoopState::SafeStop);
    }

    #[test]
    fn unacknowledged_safe_state_is_resent_until_it_lands() {
        let commands = (0..6).map(|i| JointCommand::position(i, 0.1)).collect();
        let mut rig = running(RigBuilder::new(six_joints()).commands(commands));
        rig.ctl.tick().unwrap();
        assert_eq!(rig.sim.torque_enabled(4), Some(true));

        // Two IMU misses are tolerated; the third is a fatal dropout.
        rig.imu_fail.store(true, Ordering::SeqCst);
        rig.ctl.tick().unwrap();
        rig.ctl.tick().unwrap();
        rig.sim.silence(4);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
        assert_eq!(rig.sim.torque_enabled(4), Some(true));
        for address in [1, 2, 3, 5, 6] {
            assert_eq!(rig.sim.torque_enabled(address), Some(false));
        }

        // Still silent: the disable keeps being retried.
        rig.sim.clear_history();
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
        assert_eq!(rig.sim.writes_to(4), vec![vec![40, 0]; 3]);
        assert_eq!(rig.sim.torque_enabled(4), Some(true));

        rig.sim.restore(4);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
        assert_eq!(rig.sim.torque_enabled(4), Some(false));

        // Acknowledged: nothing further is written.
        rig.sim.clear_history();
        rig.ctl.tick().unwrap();
        for address in 1..=6 {
            assert!(rig.sim.writes_to(address).is_empty());
        }
    }

    #[test]
    fn shutdown_from_safe_stop_retries_the_safe_state() {
        let commands = (0..6).map(|i| JointCommand::position(i, 0.1)).collect();
        let mut rig = running(RigBuilder::new(six_joints()).commands(commands));
        rig.ctl.tick().unwrap();
        rig.imu_fail.store(true, Ordering::SeqCst);
        rig.ctl.tick().unwrap();
        rig.ctl.tick().unwrap();
        rig.sim.silence(2);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);
        assert_eq!(rig.sim.torque_enabled(2), Some(true));

        rig.sim.restore(2);
        rig.ctl.shutdown();
        assert_eq!(
            rig.ctl.state(),
            LoopState::Terminated(TerminationReason::Shutdown)
        );
        assert_eq!(rig.sim.torque_enabled(2), Some(false));
    }

    #[test]
    fn reset_is_explicit_and_only_valid_in_safe_stop() {
        let mut rig = running(RigBuilder::new(six_joints()));
        assert!(rig.ctl.reset().is_err());

        rig.imu_fail.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            rig.ctl.tick().unwrap();
        }
        assert_eq!(rig.ctl.state(), LoopState::SafeStop);

        // Recovery of the cause alone does not leave SAFE_STOP.
        rig.imu_fail.store(false, Ordering::SeqCst);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::SafeStop);

        // The request takes effect at the next tick boundary.
        rig.ctl.control().request_reset();
        assert_eq!(rig.ctl.state(), LoopState::SafeStop);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        assert_eq!(rig.ctl.monitor().status().state, LoopState::Running);
    }

    #[test]
    fn hold_position_safe_stop_uses_last_reading() {
        let mut rig = running(
            RigBuilder::new(six_joints())
                .commands(vec![JointCommand::position(0, 0.4)])
                .config(|c| c.safety.safe_stop_action = SafeStopAction::HoldPosition),
        );
        rig.ctl.tick().unwrap();
        rig.ctl.tick().unwrap();
        rig.sim.clear_history();
        rig.ctl.control().request_shutdown();
        rig.ctl.tick().unwrap();
        let held = written_positions(&rig.sim, 1);
        assert_eq!(held.len(), 1);
        assert!((held[0] - 0.4).abs() < 2e-3);
    }

    #[test]
    fn telemetry_stream_carries_desired_positions() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let mut rig = RigBuilder::new(six_joints())
            .commands(vec![JointCommand::position(1, 0.25)])
            .build();
        rig.ctl = rig.ctl.with_telemetry(tx);
        rig.ctl.init().unwrap();
        rig.ctl.tick().unwrap();
        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.tick, 0);
        assert_eq!(sample.joints.len(), 6);
        assert_eq!(sample.joints[1].desired_rad, Some(0.25));
        assert_eq!(sample.joints[0].desired_rad, None);
    }

    #[test]
    fn corrupted_reply_is_retried_and_recorded() {
        let mut rig = running(RigBuilder::new(six_joints()));
        rig.sim.corrupt_next(2, 1);
        assert_eq!(rig.ctl.tick().unwrap(), LoopState::Running);
        let faults = rig.ctl.fault_log().drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::ChecksumError);
        assert!(!rig.ctl.last_state().unwrap().has_stale_joints());
    }
}
