//! Node side of the protocol.
//!
//! [`NodeResponder`] answers for one node id on a bus: it announces itself,
//! serves `PROTOCOL_INFO`, reads and writes endpoints from an in-memory value
//! store, and takes part in segmented transfers. It backs loopback tests and
//! demos, and can stand in for a device in hardware-in-the-loop fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use canprims_bus::{Listener, Router};
use canprims_frame::{
    deserialize, serialize, Frame, Value, PROTOCOL_INFO, TRANSFER_CONTROL, TRANSFER_DATA,
};
use tracing::{debug, trace, warn};

use crate::endpoint::EndpointTable;
use crate::error::{NodeError, Result};
use crate::protocol::{Announcement, ProtocolInfo, BLOB_ENDPOINT_TABLE, PROTOCOL_VERSION};
use crate::transfer::{self, abort, ControlMessage, TransferConfig};

/// Configuration for a [`NodeResponder`].
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Serial number carried in announcements.
    pub serial_number: u32,
    /// Protocol version reported in announcements and `PROTOCOL_INFO`.
    pub protocol_version: u8,
    pub announce_interval: Duration,
    /// Longest wait for a request before re-checking announcements.
    pub poll_interval: Duration,
    pub transfer: TransferConfig,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            serial_number: 0,
            protocol_version: PROTOCOL_VERSION,
            announce_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            transfer: TransferConfig::default(),
        }
    }
}

/// Emulated node answering on its own router.
pub struct NodeResponder {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    node_id: u8,
    router: Arc<Router>,
    table: Arc<EndpointTable>,
    config: ResponderConfig,
    values: Mutex<HashMap<u8, Vec<Value>>>,
    blobs: Mutex<HashMap<u8, Bytes>>,
    announcing: AtomicBool,
    responsive: AtomicBool,
    running: AtomicBool,
    served: AtomicU64,
}

impl NodeResponder {
    /// Start answering for `node_id`. The first announcement goes out at once.
    pub fn start(
        router: Arc<Router>,
        node_id: u8,
        table: Arc<EndpointTable>,
        config: ResponderConfig,
    ) -> Result<Self> {
        let values = table
            .iter()
            .map(|endpoint| (endpoint.id, endpoint.initial_values()))
            .collect();
        let blobs = HashMap::from([(BLOB_ENDPOINT_TABLE, Bytes::from(table.to_json()?))]);

        let shared = Arc::new(Shared {
            node_id,
            router,
            table,
            config,
            values: Mutex::new(values),
            blobs: Mutex::new(blobs),
            announcing: AtomicBool::new(true),
            responsive: AtomicBool::new(true),
            running: AtomicBool::new(true),
            served: AtomicU64::new(0),
        });

        // Registered before the thread starts so no request is missed.
        let link = shared.router.register_node(node_id);
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("canprims-node-{node_id}"))
                .spawn(move || shared.run(link))?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn node_id(&self) -> u8 {
        self.shared.node_id
    }

    /// Current values of an endpoint.
    pub fn values(&self, name: &str) -> Option<Vec<Value>> {
        let id = self.shared.table.get(name)?.id;
        self.shared.lock_values().get(&id).cloned()
    }

    /// Replace the values of an endpoint, as the device firmware would.
    pub fn set_values(&self, name: &str, values: Vec<Value>) -> Result<()> {
        let endpoint = self.shared.table.endpoint(name).map_err(|source| NodeError::Call {
            node_id: self.shared.node_id,
            source,
        })?;
        let types = endpoint.field_types();
        let encoded = serialize(&values, &types).map_err(|source| NodeError::Codec {
            node_id: self.shared.node_id,
            endpoint_id: endpoint.id,
            source,
        })?;
        let values = deserialize(&encoded, &types)?;
        self.shared.lock_values().insert(endpoint.id, values);
        Ok(())
    }

    /// Blob stored under `blob`, including uploads received so far.
    pub fn blob(&self, blob: u8) -> Option<Bytes> {
        self.shared.lock_blobs().get(&blob).cloned()
    }

    /// Stop or resume periodic announcements.
    pub fn set_announcing(&self, announcing: bool) {
        self.shared.announcing.store(announcing, Ordering::SeqCst);
    }

    /// Ignore (false) or answer (true) incoming requests.
    pub fn set_responsive(&self, responsive: bool) {
        self.shared.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Send one announcement now.
    pub fn announce(&self) -> Result<()> {
        self.shared.announce()
    }

    /// Requests answered so far.
    pub fn requests_served(&self) -> u64 {
        self.shared.served.load(Ordering::Relaxed)
    }

    /// Stop and join the worker thread. Idempotent.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(node_id = self.shared.node_id, "responder thread panicked");
            }
        }
    }
}

impl Drop for NodeResponder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self, link: Listener) {
        debug!(node_id = self.node_id, "responder started");
        let mut next_announce = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if self.announcing.load(Ordering::SeqCst) && now >= next_announce {
                if let Err(err) = self.announce() {
                    debug!(node_id = self.node_id, error = %err, "announcement failed");
                }
                next_announce = now + self.config.announce_interval;
            }

            let Some(frame) = link.recv_timeout(self.config.poll_interval) else {
                continue;
            };
            if !self.responsive.load(Ordering::SeqCst) {
                trace!(address = %frame.address(), "unresponsive, ignoring frame");
                continue;
            }
            if let Err(err) = self.handle(&link, &frame) {
                warn!(node_id = self.node_id, address = %frame.address(), error = %err, "request failed");
            }
        }
        debug!(node_id = self.node_id, "responder stopped");
    }

    fn announce(&self) -> Result<()> {
        let announcement = Announcement {
            protocol_version: self.config.protocol_version,
            serial_number: self.config.serial_number,
        };
        self.router.send(&announcement.frame(self.node_id)?)?;
        Ok(())
    }

    fn handle(&self, link: &Listener, frame: &Frame) -> Result<()> {
        match frame.endpoint_id() {
            PROTOCOL_INFO if frame.is_request() => {
                let info = ProtocolInfo {
                    version: self.config.protocol_version,
                    table_len: self.table_len(),
                };
                self.reply(link, frame, info.encode()?)
            }
            TRANSFER_CONTROL if !frame.is_request() => self.handle_control(link, frame),
            TRANSFER_DATA => {
                trace!(node_id = self.node_id, "data chunk outside a transfer");
                Ok(())
            }
            endpoint_id => self.handle_endpoint(link, frame, endpoint_id),
        }
    }

    fn handle_control(&self, link: &Listener, frame: &Frame) -> Result<()> {
        let message = ControlMessage::decode(frame.payload()).map_err(|source| {
            NodeError::Transfer {
                node_id: self.node_id,
                source,
            }
        })?;

        match message {
            ControlMessage::Pull { blob } => {
                let data = self.lock_blobs().get(&blob).cloned();
                match data {
                    Some(data) => {
                        transfer::send_blob(link, self.node_id, blob, data, &self.config.transfer)?
                    }
                    None => transfer::abort_peer(link, self.node_id, abort::UNKNOWN_BLOB)?,
                }
            }
            ControlMessage::Start { blob, length } => {
                let data =
                    transfer::accept_blob(link, self.node_id, blob, length, &self.config.transfer)?;
                debug!(node_id = self.node_id, blob, len = data.len(), "blob received");
                self.lock_blobs().insert(blob, data);
            }
            other => trace!(node_id = self.node_id, ?other, "stray control message"),
        }
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn handle_endpoint(&self, link: &Listener, frame: &Frame, endpoint_id: u8) -> Result<()> {
        let Some(endpoint) = self.table.by_id(endpoint_id) else {
            debug!(node_id = self.node_id, endpoint_id, "request for unknown endpoint");
            return Ok(());
        };

        let values = if frame.is_request() {
            if !endpoint.direction.can_read() {
                return Ok(());
            }
            self.lock_values().get(&endpoint_id).cloned().unwrap_or_default()
        } else {
            if !endpoint.direction.can_write() {
                return Ok(());
            }
            let values = deserialize(frame.payload(), &endpoint.field_types()).map_err(
                |source| NodeError::Codec {
                    node_id: self.node_id,
                    endpoint_id,
                    source,
                },
            )?;
            self.lock_values().insert(endpoint_id, values.clone());
            values
        };

        let payload = serialize(&values, &endpoint.field_types())?;
        self.reply(link, frame, payload)
    }

    fn reply(&self, link: &Listener, request: &Frame, payload: Bytes) -> Result<()> {
        link.send(&Frame::new(request.address(), payload)?)?;
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn table_len(&self) -> u32 {
        self.lock_blobs()
            .get(&BLOB_ENDPOINT_TABLE)
            .map_or(0, |json| json.len() as u32)
    }

    fn lock_values(&self) -> std::sync::MutexGuard<'_, HashMap<u8, Vec<Value>>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, HashMap<u8, Bytes>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
