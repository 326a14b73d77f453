//! [`TeleopRelay`] – forwards operator commands to the loop.
//!
//! The operator side holds a [`TeleopSender`] and pushes command batches from
//! any thread.  Each tick the relay drains the channel without blocking and
//! emits the newest batch; with nothing new it repeats the previous one.

use biped_types::{JointCommand, RobotState};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::debug;

use super::Policy;

/// Operator end of a teleop channel.
#[derive(Debug, Clone)]
pub struct TeleopSender {
    tx: Sender<Vec<JointCommand>>,
}

impl TeleopSender {
    /// Queue a batch.  Returns `false` when the queue is full or the relay is
    /// gone; the batch is dropped in both cases.
    pub fn send(&self, commands: Vec<JointCommand>) -> bool {
        match self.tx.try_send(commands) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("teleop queue full; batch dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Policy that replays the latest operator batch.
#[derive(Debug)]
pub struct TeleopRelay {
    rx: Receiver<Vec<JointCommand>>,
    latest: Vec<JointCommand>,
}

impl TeleopRelay {
    /// A relay and its sender, with room for `depth` pending batches.
    pub fn channel(depth: usize) -> (Self, TeleopSender) {
        let (tx, rx) = bounded(depth.max(1));
        (
            Self {
                rx,
                latest: Vec::new(),
            },
            TeleopSender { tx },
        )
    }
}

impl Policy for TeleopRelay {
    fn name(&self) -> &str {
        "teleop"
    }

    fn decide(&mut self, _state: &RobotState) -> Vec<JointCommand> {
        if let Some(batch) = self.rx.try_iter().last() {
            self.latest = batch;
        }
        self.latest.clone()
    }

    fn reset(&mut self) {
        self.rx.try_iter().for_each(drop);
        self.latest.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biped_types::ImuSample;

    fn state() -> RobotState {
        RobotState {
            tick: 0,
            joints: Vec::new(),
            imu: ImuSample::default(),
        }
    }

    #[test]
    fn newest_batch_wins_and_is_repeated() {
        let (mut relay, tx) = TeleopRelay::channel(4);
        assert!(relay.decide(&state()).is_empty());
        tx.send(vec![JointCommand::position(0, 0.1)]);
        tx.send(vec![JointCommand::position(0, 0.2)]);
        assert_eq!(relay.decide(&state()), vec![JointCommand::position(0, 0.2)]);
        assert_eq!(relay.decide(&state()), vec![JointCommand::position(0, 0.2)]);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (_relay, tx) = TeleopRelay::channel(1);
        assert!(tx.send(vec![]));
        assert!(!tx.send(vec![]));
    }

    #[test]
    fn reset_forgets_pending_and_latest() {
        let (mut relay, tx) = TeleopRelay::channel(4);
        tx.send(vec![JointCommand::disabled(1)]);
        relay.decide(&state());
        tx.send(vec![JointCommand::disabled(2)]);
        relay.reset();
        assert!(relay.decide(&state()).is_empty());
    }

    #[test]
    fn sending_from_another_thread() {
        let (mut relay, tx) = TeleopRelay::channel(4);
        std::thread::spawn(move || tx.send(vec![JointCommand::torque(3, 0.5)]))
            .join()
            .unwrap();
        assert_eq!(relay.decide(&state()), vec![JointCommand::torque(3, 0.5)]);
    }
}
