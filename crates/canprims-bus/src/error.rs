/// Errors that can occur in bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No live bus handle and the reconnect attempt failed.
    #[error("bus disconnected")]
    Disconnected,

    /// The bus manager has been shut down.
    #[error("bus shut down")]
    Shutdown,

    /// Failed to open the bus.
    #[error("failed to open {bus}: {source}")]
    Open {
        bus: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the bus handle.
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] canprims_frame::FrameError),
}

impl BusError {
    /// True for failures that invalidate the current bus handle.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Open { .. } | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
