use std::time::Duration;

use canprims_bus::BusError;
use canprims_frame::Address;

use crate::transfer::TransferError;

/// Errors that can occur in node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Frame-level error (addressing, payload size, value codec).
    #[error("frame error: {0}")]
    Frame(#[from] canprims_frame::FrameError),

    /// Bus-level error outside a transaction.
    #[error("bus error: {0}")]
    Bus(#[from] canprims_bus::BusError),

    /// Arguments or a reply could not be packed or unpacked.
    #[error("node {node_id} endpoint {endpoint_id}: {source}")]
    Codec {
        node_id: u8,
        endpoint_id: u8,
        #[source]
        source: canprims_frame::FrameError,
    },

    /// The bus went away before or while a request was in flight.
    #[error("bus disconnected (node {node_id}, endpoint {endpoint_id})")]
    BusDisconnected { node_id: u8, endpoint_id: u8 },

    /// No reply with the request address arrived in time.
    #[error("node {node_id} did not answer endpoint {endpoint_id} within {timeout:?}")]
    NodeUnresponsive {
        node_id: u8,
        endpoint_id: u8,
        timeout: Duration,
    },

    /// A reply arrived for an address nobody is waiting on.
    #[error("reply from {actual} does not match request {expected}")]
    AddressMismatch { expected: Address, actual: Address },

    /// Segmented transfer failed; restart it from the beginning.
    #[error("transfer with node {node_id} failed: {source}")]
    Transfer {
        node_id: u8,
        #[source]
        source: TransferError,
    },

    /// The node speaks a protocol version this host does not.
    #[error("node {node_id} speaks protocol version {version} (expected {expected})")]
    IncompatibleProtocol {
        node_id: u8,
        version: u8,
        expected: u8,
    },

    /// A call was rejected before anything was sent.
    #[error("node {node_id}: {source}")]
    Call {
        node_id: u8,
        #[source]
        source: CallError,
    },

    /// The endpoint table is inconsistent.
    #[error("invalid endpoint table: {0}")]
    InvalidTable(String),

    /// Imported configuration does not fit the endpoint table.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NodeError {
    /// Classify a failed send to `address`.
    ///
    /// A dead or shut-down bus is [`NodeError::BusDisconnected`]; a frame the
    /// bus refused is a codec failure on that endpoint.
    pub fn from_send(err: BusError, address: Address) -> Self {
        let node_id = address.node_id();
        let endpoint_id = address.endpoint_id();
        match err {
            BusError::Frame(source) => Self::Codec {
                node_id,
                endpoint_id,
                source,
            },
            _ => Self::BusDisconnected {
                node_id,
                endpoint_id,
            },
        }
    }
}

/// Why an endpoint call was refused locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// No endpoint with this name in the node's table.
    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// The endpoint's direction does not allow the operation.
    #[error("endpoint '{endpoint}' is not {access}")]
    AccessDenied {
        endpoint: String,
        access: &'static str,
    },

    /// A field without default was omitted.
    #[error("endpoint '{endpoint}': missing value for field '{field}'")]
    MissingArgument { endpoint: String, field: String },

    /// More arguments than fields.
    #[error("endpoint '{endpoint}': takes {expected} arguments, got {actual}")]
    TooManyArguments {
        endpoint: String,
        expected: usize,
        actual: usize,
    },

    /// A named argument does not match any field.
    #[error("endpoint '{endpoint}' has no field '{field}'")]
    UnknownField { endpoint: String, field: String },
}

pub type Result<T> = std::result::Result<T, NodeError>;
