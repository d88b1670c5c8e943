//! Node-level protocol for motor-controller buses.
//!
//! This is the "talk to a device" layer. Discover nodes from their
//! announcements, call endpoints with typed arguments, move blobs that do not
//! fit in one frame, and save or restore persistent settings.

pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod node;
pub mod persist;
pub mod protocol;
pub mod responder;
pub mod transaction;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

pub use discovery::{Discovery, DiscoveryConfig, EndpointSource, NodeState};
pub use endpoint::{
    value_from_json, value_to_json, Direction, EndpointDescriptor, EndpointTable, FieldDescriptor,
};
pub use error::{CallError, NodeError, Result};
pub use node::{Node, NodeConfig};
pub use persist::ConfigMap;
pub use protocol::{Announcement, ProtocolInfo, BLOB_ENDPOINT_TABLE, BLOB_FIRMWARE, PROTOCOL_VERSION};
pub use responder::{NodeResponder, ResponderConfig};
pub use transaction::Transaction;
pub use transfer::{ControlMessage, Reassembler, Segmenter, TransferConfig, TransferError};
