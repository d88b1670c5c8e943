use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use canprims_frame::Frame;
use tracing::{debug, trace, warn};

use crate::deadline::Deadline;
use crate::error::{BusError, Result};
use crate::manager::BusManager;

type FrameFilter = Box<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Configuration for the router's reader loop and listener queues.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long each bus read waits before the loop re-checks for shutdown.
    pub recv_timeout: Duration,
    /// Maximum frames queued per listener before new frames are dropped.
    pub listener_capacity: usize,
    /// Pause after a failed bus read.
    pub error_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_millis(20),
            listener_capacity: 256,
            error_backoff: Duration::from_millis(100),
        }
    }
}

/// Single bus reader that fans frames out to filtered listeners.
///
/// Each frame is offered to every registered listener whose filter matches,
/// in arrival order. A full listener queue never blocks the reader: the frame
/// is counted as dropped for that listener instead.
pub struct Router {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    bus: Arc<BusManager>,
    config: RouterConfig,
    listeners: RwLock<Vec<Arc<Slot>>>,
    next_listener_id: AtomicU64,
    running: AtomicBool,
    received: AtomicU64,
    dropped: AtomicU64,
}

struct Slot {
    id: u64,
    filter: FrameFilter,
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    dropped: AtomicU64,
}

impl Router {
    /// Start the reader thread with default configuration.
    pub fn start(bus: Arc<BusManager>) -> Result<Self> {
        Self::with_config(bus, RouterConfig::default())
    }

    /// Start the reader thread with explicit configuration.
    pub fn with_config(bus: Arc<BusManager>, config: RouterConfig) -> Result<Self> {
        if !bus.is_connected() {
            // Not fatal: the reader retries through the manager's reconnect path.
            if let Err(err) = bus.connect() {
                debug!(error = %err, "router starting without a connected bus");
            }
        }

        let shared = Arc::new(Shared {
            bus,
            config,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("canprims-router".to_string())
                .spawn(move || shared.run())?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register a listener that receives every frame matching `filter`.
    pub fn register<F>(&self, filter: F) -> Listener
    where
        F: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        let slot = Arc::new(Slot {
            id: self.shared.next_listener_id.fetch_add(1, Ordering::Relaxed),
            filter: Box::new(filter),
            frames: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        });
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&slot));
        debug!(listener = slot.id, "listener registered");

        Listener {
            slot,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Listener for all traffic of one node, announcements excluded.
    pub fn register_node(&self, node_id: u8) -> Listener {
        self.register(move |frame| {
            frame.node_id() == node_id && !frame.address().is_announcement()
        })
    }

    /// Listener for the announcement range.
    pub fn register_announcements(&self) -> Listener {
        self.register(|frame| frame.address().is_announcement())
    }

    /// Remove a listener; frames still queued for it are discarded.
    pub fn unregister(&self, listener: Listener) {
        drop(listener);
    }

    /// Send directly through the bus manager.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.shared.bus.send(frame)
    }

    pub fn bus(&self) -> &Arc<BusManager> {
        &self.shared.bus
    }

    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Frames read off the bus so far.
    pub fn frames_received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Frames dropped across all listeners because a queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop and join the reader thread. Idempotent.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("router thread panicked");
            }
            debug!("router stopped");
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        debug!("router started");
        while self.running.load(Ordering::SeqCst) {
            match self.bus.recv(self.config.recv_timeout) {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => {}
                Err(BusError::Shutdown) => break,
                Err(err) => {
                    warn!(error = %err, "bus receive failed");
                    std::thread::sleep(self.config.error_backoff);
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn dispatch(&self, frame: Frame) {
        trace!(address = %frame.address(), len = frame.payload().len(), "router rx");

        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for slot in listeners.iter().filter(|slot| (slot.filter)(&frame)) {
            if !slot.offer(frame.clone(), self.config.listener_capacity) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    listener = slot.id,
                    address = %frame.address(),
                    "listener queue full, dropping frame"
                );
            }
        }
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn remove(&self, id: u64) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|slot| slot.id != id);
        debug!(listener = id, "listener unregistered");
    }
}

impl Slot {
    fn offer(&self, frame: Frame, capacity: usize) -> bool {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.len() >= capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        frames.push_back(frame);
        self.ready.notify_one();
        true
    }
}

/// A filtered view of the bus handed out by [`Router::register`].
///
/// Dropping the listener unregisters it.
pub struct Listener {
    slot: Arc<Slot>,
    shared: Arc<Shared>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Pop the oldest queued frame without blocking.
    pub fn recv(&self) -> Option<Frame> {
        self.slot
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Pop the oldest queued frame, waiting up to `timeout` for one.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Deadline::after(timeout);
        let mut frames = self
            .slot
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(frame) = frames.pop_front() {
                return Some(frame);
            }
            let remaining = deadline.remaining()?;
            frames = self
                .slot
                .ready
                .wait_timeout(frames, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Send through the bus manager. Sends are neither queued nor filtered.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.shared.bus.send(frame)
    }

    /// Discard every queued frame, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut frames = self
            .slot
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let stale = frames.len();
        frames.clear();
        stale
    }

    /// Frames currently queued.
    pub fn pending(&self) -> usize {
        self.slot
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Frames dropped for this listener because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.bus.is_connected()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.remove(self.slot.id);
        self.clear();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.slot.id)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use canprims_frame::Address;

    use super::*;
    use crate::traits::BusDriver;
    use crate::virtual_bus::VirtualBus;

    fn frame(node_id: u8, endpoint_id: u8, seq: u8) -> Frame {
        Frame::new(Address::new(node_id, endpoint_id).unwrap(), vec![seq]).unwrap()
    }

    fn start_router(bus: &VirtualBus, config: RouterConfig) -> Router {
        let manager = Arc::new(BusManager::new(bus.connector()));
        manager.connect().unwrap();
        Router::with_config(manager, config).unwrap()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_disjoint_listeners_see_their_subsequence() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let node1 = router.register_node(1);
        let node2 = router.register_node(2);
        let peer = bus.open_port().unwrap();

        for seq in 0..20u8 {
            let node_id = if seq % 2 == 0 { 1 } else { 2 };
            peer.send(&frame(node_id, 4 + seq % 3, seq)).unwrap();
        }

        let collect = |listener: &Listener| -> Vec<(u8, u8)> {
            (0..10)
                .filter_map(|_| listener.recv_timeout(Duration::from_secs(2)))
                .map(|f| (f.node_id(), f.payload()[0]))
                .collect()
        };

        let seen1 = collect(&node1);
        let seen2 = collect(&node2);
        let expected1: Vec<(u8, u8)> = (0..20u8).step_by(2).map(|s| (1, s)).collect();
        let expected2: Vec<(u8, u8)> = (1..20u8).step_by(2).map(|s| (2, s)).collect();
        assert_eq!(seen1, expected1);
        assert_eq!(seen2, expected2);
        assert!(node1.recv().is_none());
        assert!(node2.recv().is_none());
    }

    #[test]
    fn test_overlapping_listeners_both_receive() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let everything = router.register(|_| true);
        let node1 = router.register_node(1);
        let peer = bus.open_port().unwrap();

        peer.send(&frame(1, 5, 7)).unwrap();

        assert_eq!(
            everything.recv_timeout(Duration::from_secs(2)),
            Some(frame(1, 5, 7))
        );
        assert_eq!(
            node1.recv_timeout(Duration::from_secs(2)),
            Some(frame(1, 5, 7))
        );
    }

    #[test]
    fn test_announcements_split_from_node_traffic() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let announcements = router.register_announcements();
        let node3 = router.register_node(3);
        let peer = bus.open_port().unwrap();

        peer.send(&frame(3, 0, 1)).unwrap();
        peer.send(&frame(3, 4, 2)).unwrap();

        assert_eq!(
            announcements.recv_timeout(Duration::from_secs(2)),
            Some(frame(3, 0, 1))
        );
        assert_eq!(
            node3.recv_timeout(Duration::from_secs(2)),
            Some(frame(3, 4, 2))
        );
        assert!(announcements.recv_timeout(Duration::from_millis(50)).is_none());
        assert!(node3.recv().is_none());
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let bus = VirtualBus::new();
        let router = start_router(
            &bus,
            RouterConfig {
                listener_capacity: 2,
                ..RouterConfig::default()
            },
        );
        let slow = router.register_node(1);
        let fast = router.register(|_| true);
        let peer = bus.open_port().unwrap();

        for seq in 0..5 {
            peer.send(&frame(1, 4, seq)).unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || router.frames_received() == 5));
        assert_eq!(slow.dropped(), 3);
        assert_eq!(fast.dropped(), 3);
        assert_eq!(router.dropped_frames(), 6);
        assert_eq!(slow.recv().map(|f| f.payload()[0]), Some(0));
        assert_eq!(slow.recv().map(|f| f.payload()[0]), Some(1));
        assert!(slow.recv().is_none());
    }

    #[test]
    fn test_unregister_discards_and_stops_delivery() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let listener = router.register(|_| true);
        let witness = router.register(|_| true);
        assert_eq!(router.listener_count(), 2);

        router.unregister(listener);
        assert_eq!(router.listener_count(), 1);

        let peer = bus.open_port().unwrap();
        peer.send(&frame(1, 4, 0)).unwrap();
        assert!(witness.recv_timeout(Duration::from_secs(2)).is_some());
    }

    #[test]
    fn test_listener_send_reaches_bus() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let listener = router.register(|_| true);
        let peer = bus.open_port().unwrap();

        listener.send(&frame(2, 6, 9)).unwrap();
        assert_eq!(
            peer.recv(Duration::from_secs(2)).unwrap(),
            Some(frame(2, 6, 9))
        );
        // The router's own port does not hear its transmissions.
        assert!(listener.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_recv_timeout_bounded() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let listener = router.register(|_| true);

        let start = Instant::now();
        assert!(listener.recv_timeout(Duration::from_millis(40)).is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_recv_timeout_accepts_unbounded_wait() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        let listener = router.register(|_| true);
        let peer = bus.open_port().unwrap();

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            peer.send(&frame(1, 4, 7)).unwrap();
        });
        assert_eq!(listener.recv_timeout(Duration::MAX), Some(frame(1, 4, 7)));
        sender.join().unwrap();
    }

    #[test]
    fn test_reader_survives_bus_outage() {
        let bus = VirtualBus::new();
        let router = start_router(
            &bus,
            RouterConfig {
                error_backoff: Duration::from_millis(10),
                ..RouterConfig::default()
            },
        );
        let listener = router.register(|_| true);

        bus.set_online(false);
        let bus_manager = Arc::clone(router.bus());
        assert!(wait_until(Duration::from_secs(2), || {
            !bus_manager.is_connected()
        }));
        bus.set_online(true);
        assert!(wait_until(Duration::from_secs(2), || bus_manager.is_connected()));

        let peer = bus.open_port().unwrap();
        peer.send(&frame(1, 4, 1)).unwrap();
        assert!(listener.recv_timeout(Duration::from_secs(2)).is_some());
        assert!(router.is_running());
    }

    #[test]
    fn test_shutdown_stops_reader() {
        let bus = VirtualBus::new();
        let router = start_router(&bus, RouterConfig::default());
        router.shutdown();
        router.shutdown();
        assert!(!router.is_running());
    }
}
