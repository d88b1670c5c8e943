use std::time::Duration;

use canprims_bus::{Deadline, Listener};
use canprims_frame::{Address, Frame};
use tracing::{debug, trace};

use crate::error::{NodeError, Result};

/// Longest single wait, so a dropped bus is noticed before the reply timeout.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// One request awaiting exactly one reply with the same address.
///
/// The listener must not be shared with another conversation while the
/// transaction runs; [`crate::Node`] serializes its calls for this reason.
#[derive(Debug)]
pub struct Transaction<'a> {
    listener: &'a Listener,
    address: Address,
    timeout: Duration,
}

impl<'a> Transaction<'a> {
    pub fn new(listener: &'a Listener, address: Address, timeout: Duration) -> Self {
        Self {
            listener,
            address,
            timeout,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Send `request` and wait for the matching reply.
    ///
    /// Frames already queued are stale and discarded first. A reply matches
    /// when it carries the request address and is not itself a request.
    pub fn execute(&self, request: &Frame) -> Result<Frame> {
        let stale = self.listener.clear();
        if stale > 0 {
            debug!(address = %self.address, stale, "discarded stale frames before request");
        }

        self.listener
            .send(request)
            .map_err(|err| NodeError::from_send(err, self.address))?;
        trace!(address = %self.address, request = request.is_request(), "request sent");

        let deadline = Deadline::after(self.timeout);
        loop {
            let Some(remaining) = deadline.remaining() else {
                return Err(NodeError::NodeUnresponsive {
                    node_id: self.address.node_id(),
                    endpoint_id: self.address.endpoint_id(),
                    timeout: self.timeout,
                });
            };

            match self.listener.recv_timeout(remaining.min(POLL_SLICE)) {
                Some(frame) if self.matches(&frame) => return Ok(frame),
                Some(frame) => {
                    let mismatch = NodeError::AddressMismatch {
                        expected: self.address,
                        actual: frame.address(),
                    };
                    debug!(error = %mismatch, "discarding unrelated frame");
                }
                None if !self.listener.is_connected() => return Err(self.disconnected()),
                None => {}
            }
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        frame.address() == self.address && !frame.is_request()
    }

    fn disconnected(&self) -> NodeError {
        NodeError::BusDisconnected {
            node_id: self.address.node_id(),
            endpoint_id: self.address.endpoint_id(),
        }
    }
}
