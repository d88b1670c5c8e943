use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use canprims_bus::{Listener, Router};
use canprims_frame::{deserialize, serialize, Address, Frame, Value, PROTOCOL_INFO};
use tracing::{debug, warn};

use crate::discovery::EndpointSource;
use crate::endpoint::{Direction, EndpointDescriptor, EndpointTable};
use crate::error::{CallError, NodeError, Result};
use crate::protocol::{ProtocolInfo, BLOB_ENDPOINT_TABLE, BLOB_FIRMWARE, PROTOCOL_VERSION};
use crate::transaction::Transaction;
use crate::transfer::{self, TransferConfig};

/// Configuration for talking to one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a request waits for its reply.
    pub reply_timeout: Duration,
    /// `PROTOCOL_INFO` requests sent before a probe gives up.
    pub probe_attempts: u32,
    pub transfer: TransferConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(500),
            probe_attempts: 3,
            transfer: TransferConfig::default(),
        }
    }
}

/// Handle to one remote node.
///
/// Owns a listener for the node's address range. Calls are serialized: at
/// most one transaction or transfer is in flight per handle, so a `Node` can
/// be shared across threads behind an `Arc`.
pub struct Node {
    node_id: u8,
    router: Arc<Router>,
    link: Mutex<Listener>,
    table: Arc<EndpointTable>,
    config: NodeConfig,
}

impl Node {
    /// Handle for a node whose endpoint table is already known. No traffic.
    pub fn with_table(
        router: Arc<Router>,
        node_id: u8,
        table: Arc<EndpointTable>,
        config: NodeConfig,
    ) -> Self {
        let link = router.register_node(node_id);
        Self {
            node_id,
            router,
            link: Mutex::new(link),
            table,
            config,
        }
    }

    /// Check the node's protocol version and obtain its endpoint table.
    pub fn probe(
        router: Arc<Router>,
        node_id: u8,
        source: &EndpointSource,
        config: NodeConfig,
    ) -> Result<Self> {
        let link = router.register_node(node_id);
        let info = query_protocol_info(&link, node_id, &config)?;
        if info.version != PROTOCOL_VERSION {
            return Err(NodeError::IncompatibleProtocol {
                node_id,
                version: info.version,
                expected: PROTOCOL_VERSION,
            });
        }

        let table = match source {
            EndpointSource::Static(table) => Arc::clone(table),
            EndpointSource::Remote => {
                link.clear();
                let json = transfer::pull_blob(&link, node_id, BLOB_ENDPOINT_TABLE, &config.transfer)?;
                if json.len() != info.table_len as usize {
                    warn!(
                        node_id,
                        announced = info.table_len,
                        received = json.len(),
                        "endpoint table size differs from protocol info"
                    );
                }
                let max_payload = router.bus().config().max_payload;
                Arc::new(EndpointTable::from_slice(&json, max_payload)?)
            }
        };

        debug!(node_id, endpoints = table.len(), "node probed");
        Ok(Self {
            node_id,
            router,
            link: Mutex::new(link),
            table,
            config,
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn table(&self) -> &Arc<EndpointTable> {
        &self.table
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Query `PROTOCOL_INFO` once.
    pub fn protocol_info(&self) -> Result<ProtocolInfo> {
        let link = self.lock();
        request_protocol_info(&link, self.node_id, self.config.reply_timeout)
    }

    /// Call an endpoint by name.
    ///
    /// Read endpoints are read, write endpoints written. A read-write
    /// endpoint is read when `args` is empty and written otherwise. Omitted
    /// trailing write arguments take their field defaults.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        let endpoint = self.endpoint(name)?;
        match endpoint.direction {
            Direction::Read if !args.is_empty() => Err(self.rejected(CallError::TooManyArguments {
                endpoint: endpoint.name.clone(),
                expected: 0,
                actual: args.len(),
            })),
            Direction::Read => self.read_endpoint(endpoint),
            Direction::ReadWrite if args.is_empty() => self.read_endpoint(endpoint),
            Direction::Write | Direction::ReadWrite => {
                let values = endpoint.complete_args(args).map_err(|err| self.rejected(err))?;
                self.write_endpoint(endpoint, &values)
            }
        }
    }

    /// Call an endpoint with arguments given by field name.
    ///
    /// With no arguments a readable endpoint is read; otherwise the endpoint
    /// is written with omitted fields taken from their defaults.
    pub fn call_named(&self, name: &str, args: &[(&str, Value)]) -> Result<Vec<Value>> {
        let endpoint = self.endpoint(name)?;
        if args.is_empty() && endpoint.direction.can_read() {
            return self.read_endpoint(endpoint);
        }
        let endpoint = self.writable(endpoint)?;
        let values = endpoint.args_by_name(args).map_err(|err| self.rejected(err))?;
        self.write_endpoint(endpoint, &values)
    }

    /// Read the current values of an endpoint.
    pub fn read(&self, name: &str) -> Result<Vec<Value>> {
        let endpoint = self.endpoint(name)?;
        if !endpoint.direction.can_read() {
            return Err(self.rejected(CallError::AccessDenied {
                endpoint: endpoint.name.clone(),
                access: "readable",
            }));
        }
        self.read_endpoint(endpoint)
    }

    /// Write an endpoint and return the values the node committed.
    ///
    /// Write-only endpoints return no values.
    pub fn write(&self, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        let endpoint = self.writable(self.endpoint(name)?)?;
        let values = endpoint.complete_args(args).map_err(|err| self.rejected(err))?;
        self.write_endpoint(endpoint, &values)
    }

    /// Fetch a blob from the node with a segmented pull.
    pub fn fetch_blob(&self, blob: u8) -> Result<Bytes> {
        let link = self.lock();
        link.clear();
        transfer::pull_blob(&link, self.node_id, blob, &self.config.transfer)
    }

    /// Send a blob to the node with a segmented transfer.
    pub fn upload_blob(&self, blob: u8, data: impl Into<Bytes>) -> Result<()> {
        let link = self.lock();
        link.clear();
        transfer::send_blob(&link, self.node_id, blob, data.into(), &self.config.transfer)
    }

    /// Upload a firmware image.
    pub fn upload_firmware(&self, image: impl Into<Bytes>) -> Result<()> {
        self.upload_blob(BLOB_FIRMWARE, image)
    }

    /// Fetch and parse the endpoint table the node serves.
    pub fn fetch_endpoint_table(&self) -> Result<EndpointTable> {
        let json = self.fetch_blob(BLOB_ENDPOINT_TABLE)?;
        EndpointTable::from_slice(&json, self.router.bus().config().max_payload)
    }

    fn read_endpoint(&self, endpoint: &EndpointDescriptor) -> Result<Vec<Value>> {
        let address = self.address(endpoint)?;
        let reply = self.transact(&Frame::request(address))?;
        self.decode(endpoint, reply.payload())
    }

    fn write_endpoint(&self, endpoint: &EndpointDescriptor, values: &[Value]) -> Result<Vec<Value>> {
        let address = self.address(endpoint)?;
        let payload = serialize(values, &endpoint.field_types()).map_err(|source| {
            NodeError::Codec {
                node_id: self.node_id,
                endpoint_id: endpoint.id,
                source,
            }
        })?;
        let reply = self.transact(&Frame::new(address, payload)?)?;

        if endpoint.direction == Direction::Write {
            return Ok(Vec::new());
        }
        self.decode(endpoint, reply.payload())
    }

    fn decode(&self, endpoint: &EndpointDescriptor, payload: &[u8]) -> Result<Vec<Value>> {
        deserialize(payload, &endpoint.field_types()).map_err(|source| NodeError::Codec {
            node_id: self.node_id,
            endpoint_id: endpoint.id,
            source,
        })
    }

    fn transact(&self, request: &Frame) -> Result<Frame> {
        let link = self.lock();
        Transaction::new(&link, request.address(), self.config.reply_timeout).execute(request)
    }

    fn address(&self, endpoint: &EndpointDescriptor) -> Result<Address> {
        Ok(Address::new(self.node_id, endpoint.id)?)
    }

    fn endpoint(&self, name: &str) -> Result<&EndpointDescriptor> {
        self.table.endpoint(name).map_err(|err| self.rejected(err))
    }

    fn writable<'e>(&self, endpoint: &'e EndpointDescriptor) -> Result<&'e EndpointDescriptor> {
        if endpoint.direction.can_write() {
            Ok(endpoint)
        } else {
            Err(self.rejected(CallError::AccessDenied {
                endpoint: endpoint.name.clone(),
                access: "writable",
            }))
        }
    }

    fn rejected(&self, source: CallError) -> NodeError {
        NodeError::Call {
            node_id: self.node_id,
            source,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Listener> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("endpoints", &self.table.len())
            .field("config", &self.config)
            .finish()
    }
}

fn request_protocol_info(link: &Listener, node_id: u8, timeout: Duration) -> Result<ProtocolInfo> {
    let address = Address::new(node_id, PROTOCOL_INFO)?;
    let reply = Transaction::new(link, address, timeout).execute(&Frame::request(address))?;
    ProtocolInfo::decode(reply.payload()).map_err(|err| match err {
        NodeError::Frame(source) => NodeError::Codec {
            node_id,
            endpoint_id: PROTOCOL_INFO,
            source,
        },
        other => other,
    })
}

/// `PROTOCOL_INFO` with retries on silence.
fn query_protocol_info(link: &Listener, node_id: u8, config: &NodeConfig) -> Result<ProtocolInfo> {
    let attempts = config.probe_attempts.max(1);
    let mut attempt = 1;
    loop {
        match request_protocol_info(link, node_id, config.reply_timeout) {
            Err(NodeError::NodeUnresponsive { .. }) if attempt < attempts => {
                debug!(node_id, attempt, "protocol info unanswered, retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{NodeResponder, ResponderConfig};
    use crate::test_support::{fast_node_config, table, Harness};

    fn setup(node_id: u8) -> (Harness, NodeResponder, Node) {
        let harness = Harness::new();
        let responder = NodeResponder::start(
            Arc::clone(&harness.device),
            node_id,
            table(),
            ResponderConfig::default(),
        )
        .unwrap();
        let node = Node::with_table(Arc::clone(&harness.host), node_id, table(), fast_node_config());
        (harness, responder, node)
    }

    #[test]
    fn test_read_endpoint() {
        let (_harness, responder, node) = setup(3);
        assert_eq!(node.read("motor_speed").unwrap(), vec![Value::F32(0.0)]);

        responder
            .set_values("motor_speed", vec![Value::F32(1500.0)])
            .unwrap();
        assert_eq!(node.call("motor_speed", &[]).unwrap(), vec![Value::F32(1500.0)]);
    }

    #[test]
    fn test_write_fills_defaults_and_echoes() {
        let (_harness, responder, node) = setup(3);

        let committed = node.call("target_speed", &[Value::F64(1200.0)]).unwrap();
        assert_eq!(committed, vec![Value::F32(1200.0), Value::U16(250)]);
        assert_eq!(responder.values("target_speed"), Some(committed));

        assert_eq!(
            node.call("target_speed", &[]).unwrap(),
            vec![Value::F32(1200.0), Value::U16(250)]
        );
    }

    #[test]
    fn test_write_only_returns_nothing() {
        let (_harness, responder, node) = setup(3);
        assert!(node.call("reset", &[]).unwrap().is_empty());
        assert_eq!(responder.values("reset"), Some(vec![Value::Bool(true)]));
    }

    #[test]
    fn test_call_named() {
        let (_harness, responder, node) = setup(3);
        node.call_named("target_speed", &[("ramp_ms", Value::U16(10)), ("rpm", Value::F32(5.0))])
            .unwrap();
        assert_eq!(
            responder.values("target_speed"),
            Some(vec![Value::F32(5.0), Value::U16(10)])
        );
        assert_eq!(
            node.call_named("target_speed", &[]).unwrap(),
            vec![Value::F32(5.0), Value::U16(10)]
        );
    }

    #[test]
    fn test_argument_errors() {
        let (_harness, _responder, node) = setup(3);

        assert!(matches!(
            node.call("missing", &[]),
            Err(NodeError::Call {
                node_id: 3,
                source: CallError::UnknownEndpoint(_)
            })
        ));
        assert!(matches!(
            node.write("motor_speed", &[Value::F32(1.0)]),
            Err(NodeError::Call {
                node_id: 3,
                source: CallError::AccessDenied { access: "writable", .. }
            })
        ));
        assert!(matches!(
            node.read("reset"),
            Err(NodeError::Call {
                node_id: 3,
                source: CallError::AccessDenied { access: "readable", .. }
            })
        ));
        assert!(matches!(
            node.write("current_limit", &[]),
            Err(NodeError::Call {
                node_id: 3,
                source: CallError::MissingArgument { .. }
            })
        ));
        assert!(matches!(
            node.call("motor_speed", &[Value::F32(1.0)]),
            Err(NodeError::Call {
                node_id: 3,
                source: CallError::TooManyArguments { expected: 0, .. }
            })
        ));
        assert!(matches!(
            node.call_named("target_speed", &[("torque", Value::F32(1.0))]),
            Err(NodeError::Call {
                node_id: 3,
                source: CallError::UnknownField { .. }
            })
        ));
        assert!(matches!(
            node.call("current_limit", &[Value::I32(-1)]),
            Err(NodeError::Codec { endpoint_id: 6, .. })
        ));
    }

    #[test]
    fn test_transfers_report_lost_bus() {
        let (harness, _responder, node) = setup(8);
        harness.bus.set_online(false);

        assert!(matches!(
            node.upload_firmware(vec![1u8; 40]),
            Err(NodeError::BusDisconnected { node_id: 8, .. })
        ));
        assert!(matches!(
            node.fetch_blob(BLOB_FIRMWARE),
            Err(NodeError::BusDisconnected { node_id: 8, .. })
        ));
    }

    #[test]
    fn test_silent_node_is_unresponsive() {
        let (_harness, responder, node) = setup(3);
        responder.set_responsive(false);

        assert!(matches!(
            node.read("motor_speed"),
            Err(NodeError::NodeUnresponsive {
                node_id: 3,
                endpoint_id: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_probe_fetches_remote_table() {
        let harness = Harness::new();
        let _responder = NodeResponder::start(
            Arc::clone(&harness.device),
            8,
            table(),
            ResponderConfig::default(),
        )
        .unwrap();

        let node = Node::probe(
            Arc::clone(&harness.host),
            8,
            &EndpointSource::Remote,
            fast_node_config(),
        )
        .unwrap();
        assert_eq!(node.table().as_ref(), table().as_ref());
        assert_eq!(node.protocol_info().unwrap().version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_probe_rejects_other_protocol() {
        let harness = Harness::new();
        let _responder = NodeResponder::start(
            Arc::clone(&harness.device),
            8,
            table(),
            ResponderConfig {
                protocol_version: 9,
                ..ResponderConfig::default()
            },
        )
        .unwrap();

        let result = Node::probe(
            Arc::clone(&harness.host),
            8,
            &EndpointSource::Static(table()),
            fast_node_config(),
        );
        assert!(matches!(
            result,
            Err(NodeError::IncompatibleProtocol { version: 9, .. })
        ));
    }

    #[test]
    fn test_probe_without_node_gives_up() {
        let harness = Harness::new();
        let result = Node::probe(
            Arc::clone(&harness.host),
            12,
            &EndpointSource::Static(table()),
            NodeConfig {
                reply_timeout: Duration::from_millis(50),
                ..fast_node_config()
            },
        );
        assert!(matches!(result, Err(NodeError::NodeUnresponsive { .. })));
    }

    #[test]
    fn test_upload_firmware() {
        let (_harness, responder, node) = setup(3);
        let image: Vec<u8> = (0..200u8).collect();

        node.upload_firmware(image.clone()).unwrap();
        assert_eq!(responder.blob(BLOB_FIRMWARE).as_deref(), Some(&image[..]));
        assert_eq!(node.fetch_blob(BLOB_FIRMWARE).unwrap().as_ref(), &image[..]);
    }

    #[test]
    fn test_fetch_unknown_blob_aborts() {
        let (_harness, _responder, node) = setup(3);
        assert!(matches!(
            node.fetch_blob(42),
            Err(NodeError::Transfer {
                source: transfer::TransferError::Aborted(transfer::abort::UNKNOWN_BLOB),
                ..
            })
        ));
    }
}
