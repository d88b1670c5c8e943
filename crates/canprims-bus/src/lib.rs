//! Bus ownership and filtered fan-out for motor-controller buses.
//!
//! The physical bus allows one reader and offers no per-recipient filtering.
//! This crate wraps it in two layers:
//! - [`BusManager`] owns the driver handle and reconnects after failures
//! - [`Router`] runs the single reader thread and fans frames out to
//!   filtered [`Listener`]s, one per logical conversation
//!
//! Drivers plug in through [`BusConnector`] and [`BusDriver`]: SocketCAN on
//! Linux and an in-process [`VirtualBus`] are provided.

pub mod deadline;
pub mod error;
pub mod manager;
pub mod router;
pub mod traits;
pub mod virtual_bus;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub use deadline::Deadline;
pub use error::{BusError, Result};
pub use manager::{BusConfig, BusManager, BusState};
pub use router::{Listener, Router, RouterConfig};
pub use traits::{BusConnector, BusDriver};
pub use virtual_bus::{VirtualBus, VirtualConnector, VirtualPort};

#[cfg(target_os = "linux")]
pub use socketcan::{SocketCan, SocketCanConnector};
