//! Hardware [`BusLink`] over a USB/TTL serial adapter.
//!
//! Enabled with the `serial` feature.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use biped_types::BipedError;
use serialport::{ClearBuffer, SerialPort};
use tracing::info;

use crate::transport::BusLink;

/// A serial port carrying the servo bus.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open `path` at `baud_rate` (8N1).
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, BipedError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(2))
            .open()
            .map_err(|e| BipedError::Io(format!("cannot open serial port {path}: {e}")))?;
        info!(path, baud_rate, "serial bus opened");
        Ok(Self { port })
    }
}

impl BusLink for SerialLink {
    fn send(&mut self, frame: &[u8]) -> Result<(), BipedError> {
        // Drop stale bytes from an earlier, abandoned reply.
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| BipedError::Io(e.to_string()))?;
        self.port
            .write_all(frame)
            .and_then(|_| self.port.flush())
            .map_err(|e| BipedError::Io(e.to_string()))
    }

    fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>, BipedError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; expected_len];
        let mut filled = 0;
        while filled < expected_len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.port
                .set_timeout(deadline - now)
                .map_err(|e| BipedError::Io(e.to_string()))?;
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(BipedError::Io(e.to_string())),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}
