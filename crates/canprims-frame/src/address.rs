//! Node/endpoint address layout.
//!
//! An address packs a node id and an endpoint id into one standard 11-bit
//! identifier: `address = (node_id << ENDPOINT_BITS) | endpoint_id`.
//!
//! Endpoint ids 0-3 are reserved for the protocol itself.
//! Endpoint ids 4-63 are available for device-defined endpoints.

use std::fmt;

use crate::error::{FrameError, Result};

/// Width of the endpoint id field.
pub const ENDPOINT_BITS: u32 = 6;

/// Width of the node id field.
pub const NODE_ID_BITS: u32 = 5;

const ENDPOINT_MASK: u16 = (1 << ENDPOINT_BITS) - 1;

/// Largest endpoint id.
pub const MAX_ENDPOINT_ID: u8 = ENDPOINT_MASK as u8;

/// Largest node id.
pub const MAX_NODE_ID: u8 = (1 << NODE_ID_BITS) - 1;

/// Largest raw address.
pub const MAX_ADDRESS: u16 = (1 << (ENDPOINT_BITS + NODE_ID_BITS)) - 1;

/// Periodic node-presence announcements.
pub const ANNOUNCE: u8 = 0;

/// Protocol version and endpoint-table size.
pub const PROTOCOL_INFO: u8 = 1;

/// Segmented-transfer flow control.
pub const TRANSFER_CONTROL: u8 = 2;

/// Segmented-transfer chunks.
pub const TRANSFER_DATA: u8 = 3;

/// First device-defined endpoint id.
pub const USER_ENDPOINT_START: u8 = 4;

/// Returns a human-readable name for an endpoint id.
pub fn endpoint_name(id: u8) -> &'static str {
    match id {
        ANNOUNCE => "ANNOUNCE",
        PROTOCOL_INFO => "PROTOCOL_INFO",
        TRANSFER_CONTROL => "TRANSFER_CONTROL",
        TRANSFER_DATA => "TRANSFER_DATA",
        _ => "USER",
    }
}

/// Returns true if the endpoint id is reserved for the protocol.
pub fn is_reserved(id: u8) -> bool {
    id < USER_ENDPOINT_START
}

/// A validated bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u16);

impl Address {
    /// Build the address for `endpoint_id` on `node_id`.
    pub fn new(node_id: u8, endpoint_id: u8) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(FrameError::NodeIdOutOfRange(node_id.into()));
        }
        if endpoint_id > MAX_ENDPOINT_ID {
            return Err(FrameError::EndpointIdOutOfRange(endpoint_id.into()));
        }
        Ok(Self((u16::from(node_id) << ENDPOINT_BITS) | u16::from(endpoint_id)))
    }

    /// Announcement address of `node_id`.
    pub fn announcement(node_id: u8) -> Result<Self> {
        Self::new(node_id, ANNOUNCE)
    }

    /// Validate a raw identifier read off the bus.
    pub fn from_raw(raw: u32) -> Result<Self> {
        if raw > u32::from(MAX_ADDRESS) {
            return Err(FrameError::AddressOutOfRange(raw));
        }
        Ok(Self(raw as u16))
    }

    /// Raw 11-bit identifier.
    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn node_id(self) -> u8 {
        (self.0 >> ENDPOINT_BITS) as u8
    }

    pub const fn endpoint_id(self) -> u8 {
        (self.0 & ENDPOINT_MASK) as u8
    }

    /// True for addresses in the announcement range.
    pub const fn is_announcement(self) -> bool {
        self.endpoint_id() == ANNOUNCE
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:03x} (node {}, endpoint {})",
            self.0,
            self.node_id(),
            self.endpoint_id()
        )
    }
}

/// Encode `(node_id, endpoint_id)` into a raw address.
pub fn encode_address(node_id: u8, endpoint_id: u8) -> Result<u16> {
    Address::new(node_id, endpoint_id).map(Address::raw)
}

/// Decode a raw address into `(node_id, endpoint_id)`.
pub fn decode_address(raw: u32) -> Result<(u8, u8)> {
    let address = Address::from_raw(raw)?;
    Ok((address.node_id(), address.endpoint_id()))
}
