//! Dedicated bus I/O thread.
//!
//! [`BusWorker::spawn`] moves a [`ServoBus`] onto its own thread and returns a
//! [`BusHandle`].  Every transaction goes through one bounded FIFO queue, so
//! the wire sees requests strictly in the order they were submitted no matter
//! how many handles exist.  All waits on the handle side are bounded.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use biped_types::BipedError;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, info, warn};

use crate::protocol::{ServoFrame, StatusPacket};
use crate::transport::{BusStats, ServoBus};

enum Request {
    Transact {
        frame: ServoFrame,
        reply: Sender<Result<StatusPacket, BipedError>>,
    },
    Stats {
        reply: Sender<Option<BusStats>>,
    },
    Shutdown,
}

/// Owner of the I/O thread.  Dropping it stops the thread after the queued
/// requests have been served.
pub struct BusWorker {
    tx: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

/// Cloneable submission handle to a [`BusWorker`].
#[derive(Clone)]
pub struct BusHandle {
    tx: Sender<Request>,
    wait: Duration,
}

impl BusWorker {
    /// Spawn the I/O thread.
    ///
    /// `queue_depth` bounds the request queue; `wait` bounds how long a handle
    /// waits for its request to be queued and answered.
    pub fn spawn<B>(bus: B, queue_depth: usize, wait: Duration) -> Result<(Self, BusHandle), BipedError>
    where
        B: ServoBus + 'static,
    {
        let (tx, rx) = bounded(queue_depth.max(1));
        let thread = thread::Builder::new()
            .name("biped-bus-io".into())
            .spawn(move || io_loop(bus, rx))
            .map_err(|e| BipedError::Io(format!("failed to spawn bus worker: {e}")))?;
        info!(queue_depth, "bus I/O worker started");
        let handle = BusHandle {
            tx: tx.clone(),
            wait,
        };
        Ok((
            Self {
                tx,
                thread: Some(thread),
            },
            handle,
        ))
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send_timeout(Request::Shutdown, Duration::from_secs(1));
            if thread.join().is_err() {
                warn!("bus I/O worker panicked");
            }
        }
    }
}

impl Drop for BusWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn io_loop<B: ServoBus>(mut bus: B, rx: Receiver<Request>) {
    for request in rx.iter() {
        match request {
            Request::Transact { frame, reply } => {
                let result = bus.transact(&frame);
                // The requester may have given up waiting.
                let _ = reply.send(result);
            }
            Request::Stats { reply } => {
                let _ = reply.send(bus.stats());
            }
            Request::Shutdown => break,
        }
    }
    debug!("bus I/O worker exiting");
}

impl BusHandle {
    fn unavailable(what: &str) -> BipedError {
        BipedError::Io(format!("bus worker {what}"))
    }
}

impl ServoBus for BusHandle {
    fn transact(&mut self, frame: &ServoFrame) -> Result<StatusPacket, BipedError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send_timeout(
                Request::Transact {
                    frame: frame.clone(),
                    reply: reply_tx,
                },
                self.wait,
            )
            .map_err(|_| Self::unavailable("queue is full or closed"))?;
        reply_rx
            .recv_timeout(self.wait)
            .map_err(|_| Self::unavailable("did not answer in time"))?
    }

    fn stats(&self) -> Option<BusStats> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send_timeout(Request::Stats { reply: reply_tx }, self.wait)
            .ok()?;
        reply_rx.recv_timeout(self.wait).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServoRegistry;
    use crate::sim::SimBus;
    use crate::transport::{BusTransport, TransportConfig};

    fn transport(bus: SimBus) -> BusTransport<SimBus> {
        let config = TransportConfig {
            retry_budget: 1,
            reply_timeout: Duration::from_micros(100),
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
            echo_suppression: false,
        };
        BusTransport::new(bus, config)
    }

    #[test]
    fn handle_round_trips_through_worker() {
        let bus = SimBus::new().with_servo(1).with_servo(2);
        let (worker, mut handle) =
            BusWorker::spawn(transport(bus), 4, Duration::from_secs(1)).unwrap();
        assert_eq!(handle.transact(&ServoRegistry::ping_frame(1)).unwrap().id, 1);
        assert_eq!(handle.transact(&ServoRegistry::ping_frame(2)).unwrap().id, 2);
        assert_eq!(handle.stats().unwrap().transactions, 2);
        worker.shutdown();
    }

    #[test]
    fn timeouts_are_scoped_to_the_address() {
        let bus = SimBus::new().with_servo(1).with_servo(2);
        bus.control().silence(2);
        let (_worker, mut handle) =
            BusWorker::spawn(transport(bus), 4, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            handle.transact(&ServoRegistry::ping_frame(2)),
            Err(BipedError::BusTimeout { address: 2, .. })
        ));
        assert!(handle.transact(&ServoRegistry::ping_frame(1)).is_ok());
    }

    #[test]
    fn requests_from_clones_stay_ordered() {
        let bus = SimBus::new().with_servo(1);
        let control = bus.control();
        let (_worker, handle) =
            BusWorker::spawn(transport(bus), 8, Duration::from_secs(1)).unwrap();
        let mut a = handle.clone();
        let mut b = handle;
        for _ in 0..5 {
            a.transact(&ServoRegistry::ping_frame(1)).unwrap();
            b.transact(&ServoRegistry::ping_frame(1)).unwrap();
        }
        assert_eq!(control.frames_sent_to(1), 10);
    }

    #[test]
    fn stats_are_unavailable_after_worker_shutdown() {
        let bus = SimBus::new().with_servo(1);
        let (worker, handle) =
            BusWorker::spawn(transport(bus), 2, Duration::from_millis(50)).unwrap();
        assert!(handle.stats().is_some());
        worker.shutdown();
        assert_eq!(handle.stats(), None);
    }

    #[test]
    fn handle_fails_after_worker_shutdown() {
        let bus = SimBus::new().with_servo(1);
        let (worker, mut handle) =
            BusWorker::spawn(transport(bus), 2, Duration::from_millis(50)).unwrap();
        worker.shutdown();
        assert!(matches!(
            handle.transact(&ServoRegistry::ping_frame(1)),
            Err(BipedError::Io(_))
        ));
    }
}
