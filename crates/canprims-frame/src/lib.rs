//! Frames, addressing and the value codec for motor-controller buses.
//!
//! This is the leaf layer of canprims. Every frame on the bus carries:
//! - An 11-bit address: a 5-bit node id followed by a 6-bit endpoint id
//! - Up to 8 payload bytes (64 on CAN FD)
//! - A remote-request flag for zero-length solicitations
//!
//! Endpoint arguments and results are packed with the fixed-width,
//! little-endian codec in [`codec`].

pub mod address;
pub mod codec;
pub mod error;
pub mod frame;

pub use address::{
    decode_address, encode_address, Address, ANNOUNCE, ENDPOINT_BITS, MAX_ENDPOINT_ID,
    MAX_NODE_ID, NODE_ID_BITS, PROTOCOL_INFO, TRANSFER_CONTROL, TRANSFER_DATA,
    USER_ENDPOINT_START,
};
pub use codec::{
    coerce, deserialize, encode_values, encoded_size, serialize, PrimitiveType, Value,
};
pub use error::{FrameError, Result};
pub use frame::{Frame, CLASSIC_MAX_PAYLOAD, FD_MAX_PAYLOAD};
