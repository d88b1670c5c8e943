use std::time::Duration;

use canprims_frame::Frame;

use crate::error::Result;

/// An open bus handle.
///
/// Methods take `&self` so one thread can block in [`BusDriver::recv`] while
/// another sends. Any error returned here is treated by the manager as a
/// sign the handle may be dead.
pub trait BusDriver: Send + Sync {
    /// Transmit one frame.
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Wait up to `timeout` for the next frame.
    fn recv(&self, timeout: Duration) -> Result<Option<Frame>>;

    /// Return a frame only if one is already buffered.
    fn try_recv(&self) -> Result<Option<Frame>> {
        self.recv(Duration::ZERO)
    }
}

/// Opens bus handles. Called again for every reconnect.
pub trait BusConnector: Send + Sync {
    fn open(&self) -> Result<Box<dyn BusDriver>>;

    /// Name used in logs and errors, e.g. `can0`.
    fn describe(&self) -> String;
}
