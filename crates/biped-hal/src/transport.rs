//! Bus transport: half-duplex transactions with retries and backoff.
//!
//! [`BusLink`] is the raw byte pipe (a serial port, or the simulated servo
//! chain).  [`BusTransport`] layers the transaction discipline on top:
//!
//! 1. send the instruction frame;
//! 2. on a single-wire bus, read back and discard our own echo;
//! 3. read the status reply and verify it.
//!
//! A missing, short, garbled or checksum-failing reply counts as one lost
//! attempt.  A transaction gets `retry_budget + 1` attempts with exponential
//! backoff between them; when they are all lost the transaction fails with
//! [`BipedError::BusTimeout`] for that address only.

use std::thread;
use std::time::Duration;

use biped_types::{BipedError, BusConfig};
use tracing::{debug, trace, warn};

use crate::protocol::{self, ServoFrame, StatusPacket};

/// Raw half-duplex byte link.
pub trait BusLink: Send {
    /// Write a complete frame.  Returns once the bytes are on the wire.
    fn send(&mut self, frame: &[u8]) -> Result<(), BipedError>;

    /// Read up to `expected_len` bytes, waiting at most `timeout`.  A reply
    /// that never arrives yields fewer bytes (possibly none), not an error;
    /// errors are reserved for a broken link.
    fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>, BipedError>;
}

impl<L: BusLink + ?Sized> BusLink for Box<L> {
    fn send(&mut self, frame: &[u8]) -> Result<(), BipedError> {
        (**self).send(frame)
    }

    fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>, BipedError> {
        (**self).receive(expected_len, timeout)
    }
}

/// Counters kept by the transport for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Transactions that completed successfully.
    pub transactions: u64,
    /// Extra attempts beyond the first.
    pub retries: u64,
    /// Transactions that exhausted their retry budget.
    pub timeouts: u64,
    /// Replies rejected for a checksum mismatch.
    pub checksum_errors: u64,
    /// Replies whose servo error byte was non-zero.
    pub servo_errors: u64,
}

/// A serialised request/reply path to the servo chain.
///
/// Implemented by [`BusTransport`] when the control thread owns the bus, and
/// by [`BusHandle`][crate::worker::BusHandle] when a dedicated I/O worker does.
pub trait ServoBus: Send {
    fn transact(&mut self, frame: &ServoFrame) -> Result<StatusPacket, BipedError>;

    /// Current counters, or `None` when they cannot be fetched within the
    /// bus's bounded wait.
    fn stats(&self) -> Option<BusStats>;
}

/// Transaction timing parameters, derived from [`BusConfig`] and the tick
/// period.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub retry_budget: u32,
    pub reply_timeout: Duration,
    pub backoff_base: Duration,
    /// Upper bound on any single backoff sleep.
    pub backoff_cap: Duration,
    pub echo_suppression: bool,
}

impl TransportConfig {
    /// Each backoff sleep is capped at a quarter of `tick_period`.
    pub fn new(bus: &BusConfig, tick_period: Duration) -> Self {
        Self {
            retry_budget: bus.retry_budget,
            reply_timeout: bus.reply_timeout(),
            backoff_base: bus.backoff_base(),
            backoff_cap: tick_period / 4,
            echo_suppression: bus.echo_suppression,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << (retry.saturating_sub(1)).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(&BusConfig::default(), Duration::from_millis(20))
    }
}

/// Retrying transaction layer over a [`BusLink`].
pub struct BusTransport<L> {
    link: L,
    config: TransportConfig,
    stats: BusStats,
}

impl<L: BusLink> BusTransport<L> {
    pub fn new(link: L, config: TransportConfig) -> Self {
        Self {
            link,
            config,
            stats: BusStats::default(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn attempt(&mut self, frame: &ServoFrame) -> Result<StatusPacket, BipedError> {
        self.link.send(&frame.bytes)?;

        if self.config.echo_suppression {
            let echo = self
                .link
                .receive(frame.bytes.len(), self.config.reply_timeout)?;
            if echo != frame.bytes {
                return Err(BipedError::MalformedFrame(format!(
                    "echo of {} byte frame did not match ({} byte(s) read back)",
                    frame.bytes.len(),
                    echo.len()
                )));
            }
        }

        let reply = self.link.receive(frame.reply_len, self.config.reply_timeout)?;
        if reply.len() < frame.reply_len {
            return Err(BipedError::BusTimeout {
                address: frame.address,
                attempts: 1,
            });
        }
        protocol::decode_status(&reply, frame.address)
    }
}

impl<L: BusLink> ServoBus for BusTransport<L> {
    fn transact(&mut self, frame: &ServoFrame) -> Result<StatusPacket, BipedError> {
        let attempts = self.config.retry_budget + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                self.stats.retries += 1;
                let delay = self.config.backoff(attempt - 1);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            match self.attempt(frame) {
                Ok(packet) => {
                    self.stats.transactions += 1;
                    if packet.error != 0 {
                        self.stats.servo_errors += 1;
                        warn!(
                            address = frame.address,
                            error_bits = packet.error,
                            "servo reported an error condition"
                        );
                    }
                    trace!(address = frame.address, attempt, "bus transaction ok");
                    return Ok(packet);
                }
                Err(err) if err.is_retryable() => {
                    if matches!(err, BipedError::Checksum { .. }) {
                        self.stats.checksum_errors += 1;
                    }
                    debug!(address = frame.address, attempt, error = %err, "bus attempt lost");
                }
                Err(err) => return Err(err),
            }
        }
        self.stats.timeouts += 1;
        warn!(
            address = frame.address,
            attempts, "bus transaction exhausted retry budget"
        );
        Err(BipedError::BusTimeout {
            address: frame.address,
            attempts,
        })
    }

    fn stats(&self) -> Option<BusStats> {
        Some(self.stats)
    }
}
