//! [`SensorReader`] – builds the per-tick [`RobotState`].
//!
//! Each poll reads the IMU, fuses it into an orientation, and reads joint
//! telemetry over the bus (all joints, or a round-robin slice of
//! `joint_reads_per_tick` when the bus cannot serve every joint each tick).
//!
//! A joint whose read fails keeps its previous values, is marked `stale`, and
//! gets a `BusTimeout` fault.  After `stale_reads_before_dropout` consecutive
//! failures a `SensorDropout` fault is raised once for that joint; the same
//! escalation applies to the IMU, whose dropout carries no joint id.

use std::time::Duration;

use biped_hal::{ImuSource, ServoBus, ServoRegistry};
use biped_kernel::StreakCounter;
use biped_perception::OrientationFilter;
use biped_types::{
    BipedError, FaultKind, FaultRecord, ImuSample, JointId, JointState, RobotConfig, RobotState,
};
use tracing::{debug, trace};

use crate::clock::Clock;

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorPoll {
    pub state: RobotState,
    /// Unassessed faults raised while polling.
    pub faults: Vec<FaultRecord>,
}

struct JointTrack {
    state: JointState,
    misses: StreakCounter,
    dropout_reported: bool,
}

pub struct SensorReader {
    imu: Box<dyn ImuSource>,
    filter: OrientationFilter,
    imu_sample: ImuSample,
    imu_misses: StreakCounter,
    imu_dropout_reported: bool,
    last_imu_read: Option<Duration>,
    joints: Vec<JointTrack>,
    reads_per_tick: usize,
    cursor: usize,
}

impl SensorReader {
    pub fn new(registry: &ServoRegistry, imu: Box<dyn ImuSource>, config: &RobotConfig) -> Self {
        let threshold = config.bus.stale_reads_before_dropout;
        let joints = registry
            .iter()
            .map(|spec| JointTrack {
                state: JointState::unknown(spec.id),
                misses: StreakCounter::new(threshold),
                dropout_reported: false,
            })
            .collect::<Vec<_>>();
        let reads_per_tick = config
            .bus
            .joint_reads_per_tick
            .unwrap_or(joints.len())
            .clamp(1, joints.len().max(1));
        Self {
            imu,
            filter: OrientationFilter::new(&config.fusion),
            imu_sample: ImuSample::default(),
            imu_misses: StreakCounter::new(threshold),
            imu_dropout_reported: false,
            last_imu_read: None,
            joints,
            reads_per_tick,
            cursor: 0,
        }
    }

    /// Poll the IMU and this tick's share of joints.
    pub fn poll(
        &mut self,
        bus: &mut dyn ServoBus,
        registry: &ServoRegistry,
        clock: &dyn Clock,
        tick: u64,
    ) -> SensorPoll {
        let mut faults = Vec::new();
        self.poll_imu(clock, tick, &mut faults);

        let n = self.joints.len();
        for k in 0..self.reads_per_tick.min(n) {
            let index = (self.cursor + k) % n;
            self.poll_joint(index, bus, registry, clock, tick, &mut faults);
        }
        if n > 0 {
            self.cursor = (self.cursor + self.reads_per_tick) % n;
        }

        SensorPoll {
            state: RobotState {
                tick,
                joints: self.joints.iter().map(|j| j.state).collect(),
                imu: self.imu_sample,
            },
            faults,
        }
    }

    fn poll_imu(&mut self, clock: &dyn Clock, tick: u64, faults: &mut Vec<FaultRecord>) {
        let now = clock.now();
        let reading = self.imu.read().and_then(|raw| {
            if raw.is_finite() {
                Ok(raw)
            } else {
                Err(BipedError::Io("non-finite IMU reading".into()))
            }
        });
        match reading {
            Ok(raw) => {
                let dt = self
                    .last_imu_read
                    .map(|prev| now.saturating_sub(prev).as_secs_f32())
                    .unwrap_or(0.0);
                self.last_imu_read = Some(now);
                let orientation = self.filter.update(raw.gyro, raw.accel, dt);
                self.imu_sample = ImuSample {
                    orientation,
                    angular_velocity: raw.gyro,
                    linear_acceleration: raw.accel,
                    timestamp: now,
                };
                self.imu_misses.reset();
                self.imu_dropout_reported = false;
            }
            Err(err) => {
                debug!(tick, error = %err, "IMU read missed");
                if self.imu_misses.record(true) && !self.imu_dropout_reported {
                    self.imu_dropout_reported = true;
                    faults.push(FaultRecord::new(
                        FaultKind::SensorDropout,
                        tick,
                        format!(
                            "IMU silent for {} consecutive reads: {err}",
                            self.imu_misses.count()
                        ),
                    ));
                }
            }
        }
    }

    fn poll_joint(
        &mut self,
        index: usize,
        bus: &mut dyn ServoBus,
        registry: &ServoRegistry,
        clock: &dyn Clock,
        tick: u64,
        faults: &mut Vec<FaultRecord>,
    ) {
        let id = self.joints[index].state.id;
        let result = read_joint(id, bus, registry, clock);
        let track = &mut self.joints[index];
        match result {
            Ok(state) => {
                trace!(joint = id, position = state.position_rad, "joint read");
                track.state = state;
                track.misses.reset();
                track.dropout_reported = false;
            }
            Err(err) => {
                track.state.stale = true;
                faults.push(
                    FaultRecord::new(FaultKind::BusTimeout, tick, err.to_string()).for_joint(id),
                );
                if track.misses.record(true) && !track.dropout_reported {
                    track.dropout_reported = true;
                    faults.push(
                        FaultRecord::new(
                            FaultKind::SensorDropout,
                            tick,
                            format!("{} consecutive failed reads", track.misses.count()),
                        )
                        .for_joint(id),
                    );
                }
            }
        }
    }

    /// Forget dropout history (after a reset out of SAFE_STOP).
    pub fn reset(&mut self) {
        for track in &mut self.joints {
            track.misses.reset();
            track.dropout_reported = false;
        }
        self.imu_misses.reset();
        self.imu_dropout_reported = false;
    }
}

fn read_joint(
    id: JointId,
    bus: &mut dyn ServoBus,
    registry: &ServoRegistry,
    clock: &dyn Clock,
) -> Result<JointState, BipedError> {
    let request = registry.telemetry_request(id)?;
    let reply = bus.transact(&request)?;
    registry.from_raw_telemetry(id, &reply.params, clock.now())
}
