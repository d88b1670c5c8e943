//! Node discovery from periodic announcements.
//!
//! Every node announces itself on endpoint `ANNOUNCE` of its own address
//! range. [`Discovery`] watches that range, probes each newly seen node on a
//! short-lived thread and reports a node once its probe succeeds:
//!
//! ```text
//! Unseen -> Pending -> Known -> Lost (optional liveness timeout)
//!              ^                  |
//!              +------------------+
//! ```
//!
//! A probe that fails is logged and forgotten; the next announcement from
//! that node starts a new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use canprims_bus::{Listener, Router};
use canprims_frame::Frame;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointTable;
use crate::error::Result;
use crate::node::{Node, NodeConfig};
use crate::protocol::Announcement;

type AppearedFn = Box<dyn Fn(Arc<Node>, u8) + Send + Sync>;
type DisappearedFn = Box<dyn Fn(u8) + Send + Sync>;
type ProbeResult = (u8, Option<u32>, Result<Node>);

/// Where a probe takes a node's endpoint table from.
#[derive(Debug, Clone)]
pub enum EndpointSource {
    /// Every node shares this table.
    Static(Arc<EndpointTable>),
    /// Pull the table from each node with a segmented transfer.
    Remote,
}

/// Configuration for [`Discovery`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Longest wait for announcements before housekeeping runs.
    pub poll_interval: Duration,
    /// Silence after which a known node counts as lost. `None` disables it.
    pub lost_timeout: Option<Duration>,
    /// Configuration handed to every probed node.
    pub node: NodeConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            lost_timeout: None,
            node: NodeConfig::default(),
        }
    }
}

/// Lifecycle state of one node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unseen,
    Pending,
    Known,
    Lost,
}

enum Entry {
    Pending,
    Known {
        node: Arc<Node>,
        serial: Option<u32>,
        last_seen: Instant,
    },
    Lost,
}

/// Background node discovery.
pub struct Discovery {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    router: Arc<Router>,
    source: EndpointSource,
    config: DiscoveryConfig,
    entries: Mutex<HashMap<u8, Entry>>,
    probes: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    on_appeared: AppearedFn,
    on_disappeared: DisappearedFn,
}

enum Event {
    Appeared(Arc<Node>, u8),
    Disappeared(u8),
}

impl Discovery {
    /// Start watching announcements.
    ///
    /// `on_appeared` runs once per node that probes successfully;
    /// `on_disappeared` runs when a known node is lost or replaced by a
    /// device with another serial number. Both run on the discovery thread.
    pub fn start<A, D>(
        router: Arc<Router>,
        source: EndpointSource,
        config: DiscoveryConfig,
        on_appeared: A,
        on_disappeared: D,
    ) -> Result<Self>
    where
        A: Fn(Arc<Node>, u8) + Send + Sync + 'static,
        D: Fn(u8) + Send + Sync + 'static,
    {
        let announcements = router.register_announcements();
        let shared = Arc::new(Shared {
            router,
            source,
            config,
            entries: Mutex::new(HashMap::new()),
            probes: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            on_appeared: Box::new(on_appeared),
            on_disappeared: Box::new(on_disappeared),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("canprims-discovery".to_string())
                .spawn(move || shared.run(announcements))?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn state(&self, node_id: u8) -> NodeState {
        match self.shared.lock_entries().get(&node_id) {
            None => NodeState::Unseen,
            Some(Entry::Pending) => NodeState::Pending,
            Some(Entry::Known { .. }) => NodeState::Known,
            Some(Entry::Lost) => NodeState::Lost,
        }
    }

    /// Handle of a known node.
    pub fn node(&self, node_id: u8) -> Option<Arc<Node>> {
        match self.shared.lock_entries().get(&node_id) {
            Some(Entry::Known { node, .. }) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// Ids of all known nodes, ascending.
    pub fn known_nodes(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self
            .shared
            .lock_entries()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Known { .. }))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Stop the worker and wait for running probes. Idempotent.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("discovery thread panicked");
            }
        }

        let probes = std::mem::take(&mut *self.shared.lock_probes());
        for probe in probes {
            if probe.join().is_err() {
                warn!("probe thread panicked");
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(self: &Arc<Self>, announcements: Listener) {
        debug!("discovery started");
        let (results_tx, results_rx) = mpsc::channel::<ProbeResult>();

        while self.running.load(Ordering::SeqCst) {
            let mut events = Vec::new();

            if let Some(frame) = announcements.recv_timeout(self.config.poll_interval) {
                self.on_announcement(&frame, &results_tx, &mut events);
                while let Some(frame) = announcements.recv() {
                    self.on_announcement(&frame, &results_tx, &mut events);
                }
            }
            self.collect_probes(&results_rx, &mut events);
            self.expire(&mut events);

            for event in events {
                match event {
                    Event::Appeared(node, node_id) => (self.on_appeared)(node, node_id),
                    Event::Disappeared(node_id) => (self.on_disappeared)(node_id),
                }
            }
        }
        debug!("discovery stopped");
    }

    fn on_announcement(
        self: &Arc<Self>,
        frame: &Frame,
        results: &Sender<ProbeResult>,
        events: &mut Vec<Event>,
    ) {
        let node_id = frame.node_id();
        let serial = Announcement::decode(frame.payload()).map(|a| a.serial_number);

        let mut entries = self.lock_entries();
        match entries.get_mut(&node_id) {
            Some(Entry::Pending) => return,
            Some(Entry::Known {
                serial: known,
                last_seen,
                ..
            }) => {
                let replaced = matches!((*known, serial), (Some(old), Some(new)) if old != new);
                if !replaced {
                    *last_seen = Instant::now();
                    return;
                }
                info!(node_id, old = ?known, new = ?serial, "node replaced by another device");
                events.push(Event::Disappeared(node_id));
            }
            Some(Entry::Lost) | None => {}
        }

        entries.insert(node_id, Entry::Pending);
        drop(entries);
        self.spawn_probe(node_id, serial, results.clone());
    }

    fn spawn_probe(self: &Arc<Self>, node_id: u8, serial: Option<u32>, results: Sender<ProbeResult>) {
        let router = Arc::clone(&self.router);
        let source = self.source.clone();
        let config = self.config.node.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("canprims-probe-{node_id}"))
            .spawn(move || {
                let result = Node::probe(router, node_id, &source, config);
                // The receiver is gone only after shutdown.
                let _ = results.send((node_id, serial, result));
            });

        match spawned {
            Ok(handle) => {
                debug!(node_id, "probing node");
                let mut probes = self.lock_probes();
                probes.retain(|probe| !probe.is_finished());
                probes.push(handle);
            }
            Err(err) => {
                warn!(node_id, error = %err, "failed to start probe");
                self.lock_entries().remove(&node_id);
            }
        }
    }

    fn collect_probes(&self, results: &Receiver<ProbeResult>, events: &mut Vec<Event>) {
        while let Ok((node_id, serial, result)) = results.try_recv() {
            let mut entries = self.lock_entries();
            match result {
                Ok(node) => {
                    let node = Arc::new(node);
                    entries.insert(
                        node_id,
                        Entry::Known {
                            node: Arc::clone(&node),
                            serial,
                            last_seen: Instant::now(),
                        },
                    );
                    info!(node_id, endpoints = node.table().len(), "node discovered");
                    events.push(Event::Appeared(node, node_id));
                }
                Err(err) => {
                    warn!(node_id, error = %err, "node probe failed");
                    entries.remove(&node_id);
                }
            }
        }
    }

    fn expire(&self, events: &mut Vec<Event>) {
        let Some(timeout) = self.config.lost_timeout else {
            return;
        };

        let mut entries = self.lock_entries();
        for (node_id, entry) in entries.iter_mut() {
            if let Entry::Known { last_seen, .. } = entry {
                if last_seen.elapsed() > timeout {
                    info!(node_id = *node_id, "node lost");
                    *entry = Entry::Lost;
                    events.push(Event::Disappeared(*node_id));
                }
            }
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<u8, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_probes(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.probes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
