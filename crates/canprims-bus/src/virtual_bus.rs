use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use canprims_frame::Frame;
use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::error::{BusError, Result};
use crate::traits::{BusConnector, BusDriver};

/// In-process broadcast bus.
///
/// Every frame sent on a port is delivered to all other open ports, like a
/// physical bus without loopback of a node's own frames. The bus can be
/// taken offline to make every open port fail, which exercises reconnects.
#[derive(Clone)]
pub struct VirtualBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    ports: Mutex<Vec<Weak<PortQueue>>>,
    online: AtomicBool,
    next_port_id: AtomicU64,
}

struct PortQueue {
    id: u64,
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl PortQueue {
    fn close(&self) {
        let _frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                ports: Mutex::new(Vec::new()),
                online: AtomicBool::new(true),
                next_port_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a new port. Fails while the bus is offline.
    pub fn open_port(&self) -> Result<VirtualPort> {
        if !self.is_online() {
            return Err(BusError::Open {
                bus: "virtual".to_string(),
                source: io::Error::new(io::ErrorKind::NotConnected, "virtual bus is offline"),
            });
        }

        let queue = Arc::new(PortQueue {
            id: self.inner.next_port_id.fetch_add(1, Ordering::Relaxed),
            frames: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let mut ports = self.inner.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.retain(|port| port.strong_count() > 0);
        ports.push(Arc::downgrade(&queue));
        debug!(port = queue.id, "virtual port opened");

        Ok(VirtualPort {
            bus: Arc::clone(&self.inner),
            queue,
        })
    }

    /// Connector that opens a fresh port on every call.
    pub fn connector(&self) -> VirtualConnector {
        VirtualConnector { bus: self.clone() }
    }

    /// Take the bus offline (closing every open port) or bring it back.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if !online {
            let ports = self.inner.ports.lock().unwrap_or_else(PoisonError::into_inner);
            for port in ports.iter().filter_map(Weak::upgrade) {
                port.close();
            }
            debug!("virtual bus offline");
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Number of ports currently open.
    pub fn port_count(&self) -> usize {
        let ports = self.inner.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|port| !port.is_closed())
            .count()
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One attachment point on a [`VirtualBus`].
pub struct VirtualPort {
    bus: Arc<BusInner>,
    queue: Arc<PortQueue>,
}

impl VirtualPort {
    fn check_open(&self) -> Result<()> {
        if self.queue.is_closed() {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "virtual port closed",
            )));
        }
        Ok(())
    }
}

impl BusDriver for VirtualPort {
    fn send(&self, frame: &Frame) -> Result<()> {
        self.check_open()?;

        let ports = self.bus.ports.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports.iter().filter_map(Weak::upgrade) {
            if port.id == self.queue.id || port.is_closed() {
                continue;
            }
            port.frames
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(frame.clone());
            port.ready.notify_all();
        }
        trace!(port = self.queue.id, address = %frame.address(), "virtual tx");
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = Deadline::after(timeout);
        let mut frames = self
            .queue
            .frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            self.check_open()?;
            if let Some(frame) = frames.pop_front() {
                return Ok(Some(frame));
            }

            let Some(remaining) = deadline.remaining() else {
                return Ok(None);
            };
            frames = self
                .queue
                .ready
                .wait_timeout(frames, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        self.queue.close();
        debug!(port = self.queue.id, "virtual port closed");
    }
}

/// Opens [`VirtualPort`]s on a [`VirtualBus`].
#[derive(Clone)]
pub struct VirtualConnector {
    bus: VirtualBus,
}

impl BusConnector for VirtualConnector {
    fn open(&self) -> Result<Box<dyn BusDriver>> {
        Ok(Box::new(self.bus.open_port()?))
    }

    fn describe(&self) -> String {
        "virtual".to_string()
    }
}
