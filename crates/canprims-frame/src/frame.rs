use bytes::Bytes;

use crate::address::Address;
use crate::error::{FrameError, Result};

/// Payload capacity of a classic CAN frame.
pub const CLASSIC_MAX_PAYLOAD: usize = 8;

/// Payload capacity of a CAN FD frame.
pub const FD_MAX_PAYLOAD: usize = 64;

/// An addressed bus frame.
///
/// Frames are immutable once built. A request frame is a zero-length
/// solicitation (a remote request on CAN); every other frame carries data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    address: Address,
    payload: Bytes,
    is_request: bool,
}

impl Frame {
    /// Create a data frame.
    pub fn new(address: Address, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > FD_MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: FD_MAX_PAYLOAD,
            });
        }
        Ok(Self {
            address,
            payload,
            is_request: false,
        })
    }

    /// Create a zero-length request frame.
    pub fn request(address: Address) -> Self {
        Self {
            address,
            payload: Bytes::new(),
            is_request: true,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn node_id(&self) -> u8 {
        self.address.node_id()
    }

    pub fn endpoint_id(&self) -> u8 {
        self.address.endpoint_id()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }
}
