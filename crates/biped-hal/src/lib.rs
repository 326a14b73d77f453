//! `biped-hal` – servo bus and IMU hardware abstraction.
//!
//! - [`protocol`] – SCServo packet codec and register map.
//! - [`transport`] – [`BusLink`] byte pipe and the retrying [`BusTransport`].
//! - [`worker`] – optional dedicated I/O thread behind a bounded queue.
//! - [`registry`] – [`ServoRegistry`]: joint table and radians ↔ ticks.
//! - [`imu`] – [`ImuSource`] trait.
//! - [`sim`] – simulated servo chain and IMU.
//! - `serial` – hardware serial link (feature `serial`).

pub mod imu;
pub mod protocol;
pub mod registry;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod transport;
pub mod worker;

pub use imu::{ImuSource, RawImu};
pub use protocol::{ServoFrame, StatusPacket};
pub use registry::ServoRegistry;
#[cfg(feature = "serial")]
pub use serial::SerialLink;
pub use sim::{SimBus, SimControl, SimImu};
pub use transport::{BusLink, BusStats, BusTransport, ServoBus, TransportConfig};
pub use worker::{BusHandle, BusWorker};
