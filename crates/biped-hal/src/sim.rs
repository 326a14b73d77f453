//! Simulated servo chain and IMU for headless runs and tests.
//!
//! [`SimBus`] implements [`BusLink`] by decoding every instruction packet and
//! answering it the way an ideal SCServo would: PING is acknowledged, READ
//! returns the register file, WRITE updates it.  With torque enabled the
//! simulated servo reaches its goal position instantly.
//!
//! A cloneable [`SimControl`] handle injects faults (silent servos, dropped
//! or corrupted replies) and inspects what was sent, so timing and retry
//! behaviour can be exercised without hardware.
//!
//! # Example
//!
//! ```rust
//! use biped_hal::registry::ServoRegistry;
//! use biped_hal::sim::SimBus;
//! use biped_hal::transport::{BusTransport, ServoBus, TransportConfig};
//!
//! let bus = SimBus::new().with_servo(1).with_servo(2);
//! let control = bus.control();
//! control.silence(2);
//!
//! let mut transport = BusTransport::new(bus, TransportConfig::default());
//! assert!(transport.transact(&ServoRegistry::ping_frame(1)).is_ok());
//! assert!(transport.transact(&ServoRegistry::ping_frame(2)).is_err());
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use biped_types::{BipedError, Vec3};

use crate::imu::{ImuSource, RawImu};
use crate::protocol::{
    self, CENTER_TICKS, INST_PING, INST_READ, INST_WRITE, REG_GOAL_POSITION, REG_GOAL_PWM,
    REG_PRESENT_POSITION, REG_TORQUE_ENABLE,
};
use crate::registry::ServoRegistry;
use crate::transport::BusLink;

const REGISTER_FILE: usize = 72;
const REG_PRESENT_LOAD: usize = 60;

// ────────────────────────────────────────────────────────────────────────────
// Simulated servo
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimServo {
    registers: [u8; REGISTER_FILE],
}

impl SimServo {
    fn new() -> Self {
        let mut registers = [0u8; REGISTER_FILE];
        let center = (CENTER_TICKS as u16).to_le_bytes();
        let goal = REG_GOAL_POSITION as usize;
        let present = REG_PRESENT_POSITION as usize;
        registers[goal..goal + 2].copy_from_slice(&center);
        registers[present..present + 2].copy_from_slice(&center);
        Self { registers }
    }

    fn u16_at(&self, reg: usize) -> u16 {
        u16::from_le_bytes([self.registers[reg], self.registers[reg + 1]])
    }

    fn write(&mut self, start: usize, data: &[u8]) {
        let end = (start + data.len()).min(REGISTER_FILE);
        if start < end {
            self.registers[start..end].copy_from_slice(&data[..end - start]);
        }
        let goal = REG_GOAL_POSITION as usize;
        let present = REG_PRESENT_POSITION as usize;
        if self.registers[REG_TORQUE_ENABLE as usize] == 1 {
            self.registers.copy_within(goal..goal + 2, present);
        }
        let pwm = REG_GOAL_PWM as usize;
        self.registers.copy_within(pwm..pwm + 2, REG_PRESENT_LOAD);
    }

    fn read(&self, start: usize, len: usize) -> Vec<u8> {
        let end = (start + len).min(REGISTER_FILE);
        let mut out = self.registers[start.min(end)..end].to_vec();
        out.resize(len, 0);
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared state + control handle
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    servos: HashMap<u8, SimServo>,
    silent: HashSet<u8>,
    drop_next: HashMap<u8, u32>,
    corrupt_next: HashMap<u8, u32>,
    error_bits: HashMap<u8, u8>,
    frames_sent: HashMap<u8, u32>,
    writes: Vec<(u8, Vec<u8>)>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_one(counter: &mut HashMap<u8, u32>, address: u8) -> bool {
    match counter.get_mut(&address) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

/// Fault-injection and inspection handle for a [`SimBus`].  Cheap to clone;
/// every clone sees the same chain.
#[derive(Debug, Clone, Default)]
pub struct SimControl {
    state: Arc<Mutex<SimState>>,
}

impl SimControl {
    /// The servo at `address` stops answering until [`restore`][Self::restore].
    pub fn silence(&self, address: u8) {
        lock(&self.state).silent.insert(address);
    }

    pub fn restore(&self, address: u8) {
        lock(&self.state).silent.remove(&address);
    }

    /// Swallow the next `count` replies from `address`.
    pub fn drop_next(&self, address: u8, count: u32) {
        *lock(&self.state).drop_next.entry(address).or_default() += count;
    }

    /// Flip the checksum of the next `count` replies from `address`.
    pub fn corrupt_next(&self, address: u8, count: u32) {
        *lock(&self.state).corrupt_next.entry(address).or_default() += count;
    }

    /// Status error byte reported by `address` from now on; 0 clears it.
    pub fn set_error_bits(&self, address: u8, bits: u8) {
        lock(&self.state).error_bits.insert(address, bits);
    }

    /// Instruction frames addressed to `address` so far.
    pub fn frames_sent_to(&self, address: u8) -> u32 {
        lock(&self.state)
            .frames_sent
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Parameters of every WRITE sent to `address`, oldest first.
    pub fn writes_to(&self, address: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn clear_history(&self) {
        let mut state = lock(&self.state);
        state.writes.clear();
        state.frames_sent.clear();
    }

    /// Present position register of `address`, in ticks.
    pub fn present_ticks(&self, address: u8) -> Option<u16> {
        lock(&self.state)
            .servos
            .get(&address)
            .map(|s| s.u16_at(REG_PRESENT_POSITION as usize))
    }

    /// Move a servo as if pushed by an external force.
    pub fn set_present_ticks(&self, address: u8, ticks: u16) {
        if let Some(servo) = lock(&self.state).servos.get_mut(&address) {
            let reg = REG_PRESENT_POSITION as usize;
            servo.registers[reg..reg + 2].copy_from_slice(&ticks.to_le_bytes());
        }
    }

    pub fn torque_enabled(&self, address: u8) -> Option<bool> {
        lock(&self.state)
            .servos
            .get(&address)
            .map(|s| s.registers[REG_TORQUE_ENABLE as usize] == 1)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimBus
// ────────────────────────────────────────────────────────────────────────────

/// A simulated daisy chain of SCServo-compatible servos.
#[derive(Debug, Default)]
pub struct SimBus {
    control: SimControl,
    pending: Vec<u8>,
    echo: bool,
}

impl SimBus {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a servo at `address`, centred.
    pub fn with_servo(self, address: u8) -> Self {
        lock(&self.control.state)
            .servos
            .insert(address, SimServo::new());
        self
    }

    /// One servo per joint in `registry`.
    pub fn for_registry(registry: &ServoRegistry) -> Self {
        registry
            .iter()
            .fold(Self::new(), |bus, spec| bus.with_servo(spec.bus_address))
    }

    /// Reflect every transmitted frame back to the receiver, as a shared
    /// TX/RX wire does.
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    pub fn control(&self) -> SimControl {
        self.control.clone()
    }

    fn respond(state: &mut SimState, frame: &[u8]) -> Option<Vec<u8>> {
        let (id, instruction, params) = protocol::decode_instruction(frame).ok()?;
        *state.frames_sent.entry(id).or_default() += 1;
        if instruction == INST_WRITE {
            state.writes.push((id, params.clone()));
        }
        if state.silent.contains(&id) || take_one(&mut state.drop_next, id) {
            return None;
        }
        let servo = state.servos.get_mut(&id)?;
        let reply_params = match instruction {
            INST_PING => Vec::new(),
            INST_READ => {
                let (start, len) = (*params.first()? as usize, *params.get(1)? as usize);
                servo.read(start, len)
            }
            INST_WRITE => {
                let (start, data) = params.split_first()?;
                servo.write(*start as usize, data);
                Vec::new()
            }
            _ => return None,
        };
        let error = state.error_bits.get(&id).copied().unwrap_or(0);
        let mut reply = protocol::encode_status(id, error, &reply_params);
        if take_one(&mut state.corrupt_next, id) {
            if let Some(last) = reply.last_mut() {
                *last ^= 0xFF;
            }
        }
        Some(reply)
    }
}

impl BusLink for SimBus {
    fn send(&mut self, frame: &[u8]) -> Result<(), BipedError> {
        self.pending.clear();
        if self.echo {
            self.pending.extend_from_slice(frame);
        }
        let mut state = lock(&self.control.state);
        if let Some(reply) = Self::respond(&mut state, frame) {
            self.pending.extend_from_slice(&reply);
        }
        Ok(())
    }

    fn receive(&mut self, expected_len: usize, _timeout: Duration) -> Result<Vec<u8>, BipedError> {
        let n = expected_len.min(self.pending.len());
        Ok(self.pending.drain(..n).collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated IMU
// ────────────────────────────────────────────────────────────────────────────

/// Standard gravity (m/s²).
pub const GRAVITY: f32 = 9.806_65;

/// A simulated IMU returning a fixed reading.  Failures are switched on and
/// off through the shared flag returned by [`failure_switch`][Self::failure_switch].
#[derive(Debug, Clone)]
pub struct SimImu {
    sample: RawImu,
    failing: Arc<AtomicBool>,
}

impl SimImu {
    /// Upright and motionless.
    pub fn upright() -> Self {
        Self {
            sample: RawImu {
                gyro: Vec3::zero(),
                accel: Vec3::new(0.0, 0.0, GRAVITY),
            },
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Motionless, tilted by `roll` and `pitch` radians.
    pub fn tilted(roll: f32, pitch: f32) -> Self {
        let mut imu = Self::upright();
        imu.sample.accel = Vec3::new(
            -GRAVITY * pitch.sin(),
            GRAVITY * roll.sin() * pitch.cos(),
            GRAVITY * roll.cos() * pitch.cos(),
        );
        imu
    }

    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }
}

impl ImuSource for SimImu {
    fn read(&mut self) -> Result<RawImu, BipedError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(BipedError::Io("simulated IMU not responding".into()));
        }
        Ok(self.sample)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
