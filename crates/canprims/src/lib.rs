//! Host-side transport for motor-controller nodes on a shared CAN bus.
//!
//! canprims lets several logical conversations (discovery, endpoint
//! get/set, bulk transfer) share one bus connection that supports neither
//! per-recipient filtering nor concurrent readers.
//!
//! # Crate Structure
//!
//! - [`frame`]: frames, 11-bit addressing and the typed value codec
//! - [`bus`]: bus drivers, the reconnecting bus manager and the fan-out router
//! - [`node`]: discovery, transactions, segmented transfer and config
//!   persistence (behind the `node` feature)
//! - `logging`: `tracing-subscriber` setup (behind the `logging` feature)

/// Re-export frame types.
pub mod frame {
    pub use canprims_frame::*;
}

/// Re-export bus types.
pub mod bus {
    pub use canprims_bus::*;
}

/// Re-export node types (requires `node` feature).
#[cfg(feature = "node")]
pub mod node {
    pub use canprims_node::*;
}

#[cfg(feature = "logging")]
pub mod logging;
