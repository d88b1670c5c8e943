/// Errors that can occur while building frames or packing values.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The node id does not fit in the address node field.
    #[error("node id {0} out of range (max {max})", max = crate::address::MAX_NODE_ID)]
    NodeIdOutOfRange(u32),

    /// The endpoint id does not fit in the address endpoint field.
    #[error("endpoint id {0} out of range (max {max})", max = crate::address::MAX_ENDPOINT_ID)]
    EndpointIdOutOfRange(u32),

    /// A raw identifier is wider than the address space.
    #[error("address 0x{0:x} out of range")]
    AddressOutOfRange(u32),

    /// The payload exceeds the frame capacity.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A value could not be packed into its declared type.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A buffer is too short for the requested types.
    #[error("decoding error: need {needed} bytes, buffer holds {available}")]
    Decoding { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
