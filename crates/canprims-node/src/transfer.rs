//! Segmented transfer of payloads larger than one frame.
//!
//! Control messages travel on `TRANSFER_CONTROL`, chunks on `TRANSFER_DATA`,
//! both on the node's own address range. The sender announces the payload
//! with `Start`, the receiver answers with the window it accepts, and the
//! sender then alternates bursts of at most `window` chunks with waiting for
//! the receiver's cumulative `Ack`. Chunks carry a little-endian `u16` index
//! followed by their bytes.
//!
//! There is no resume: any failure aborts and the transfer restarts from
//! scratch.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use canprims_bus::{Deadline, Listener};
use canprims_frame::{
    deserialize, serialize, Address, Frame, PrimitiveType, Value,
    CLASSIC_MAX_PAYLOAD, TRANSFER_CONTROL, TRANSFER_DATA,
};
use tracing::{debug, trace, warn};

use crate::error::{NodeError, Result};

/// Longest single wait, so a dropped bus is noticed before the inactivity timeout.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Bytes of chunk index in front of every data frame.
const INDEX_LEN: usize = 2;

const OP_START: u8 = 0x01;
const OP_ACK: u8 = 0x02;
const OP_ABORT: u8 = 0x03;
const OP_PULL: u8 = 0x04;

/// Reason codes carried by `Abort`.
pub mod abort {
    pub const OUT_OF_ORDER: u8 = 1;
    pub const DUPLICATE: u8 = 2;
    pub const STALLED: u8 = 3;
    pub const TOO_LARGE: u8 = 4;
    pub const UNKNOWN_BLOB: u8 = 5;
}

/// Ways a segmented transfer can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("no progress within {0:?}")]
    Stalled(Duration),

    #[error("chunk {actual} arrived out of order (expected {expected})")]
    OutOfOrder { expected: u16, actual: u16 },

    #[error("chunk {0} received twice")]
    Duplicate(u16),

    #[error("chunk {index} carries {actual} bytes (expected {expected})")]
    ChunkLength {
        index: u16,
        expected: usize,
        actual: usize,
    },

    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("peer aborted the transfer (reason {0})")]
    Aborted(u8),

    #[error("unexpected transfer message: {0}")]
    Protocol(String),
}

impl TransferError {
    /// Reason code reported to the peer.
    pub fn abort_reason(&self) -> u8 {
        match self {
            Self::Stalled(_) => abort::STALLED,
            Self::Duplicate(_) => abort::DUPLICATE,
            Self::TooLarge { .. } => abort::TOO_LARGE,
            Self::OutOfOrder { .. }
            | Self::ChunkLength { .. }
            | Self::Aborted(_)
            | Self::Protocol(_) => abort::OUT_OF_ORDER,
        }
    }
}

/// Configuration for segmented transfers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunks the receiver accepts between acknowledgements.
    pub window: u8,
    /// Longest wait for the peer's next message.
    pub inactivity_timeout: Duration,
    /// Payload bytes per chunk, excluding the index. Both sides must agree.
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window: 8,
            inactivity_timeout: Duration::from_secs(1),
            chunk_size: CLASSIC_MAX_PAYLOAD - INDEX_LEN,
        }
    }
}

/// Flow-control message on `TRANSFER_CONTROL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Sender announces `length` bytes of blob `blob`.
    Start { blob: u8, length: u32 },
    /// Receiver expects chunk `next` and accepts `window` more.
    Ack { next: u16, window: u8 },
    /// Either side gives up.
    Abort { reason: u8 },
    /// Ask the peer to send blob `blob`.
    Pull { blob: u8 },
}

impl ControlMessage {
    pub fn encode(&self) -> canprims_frame::Result<Bytes> {
        use PrimitiveType::{UInt16, UInt32, UInt8};

        match *self {
            Self::Start { blob, length } => serialize(
                &[OP_START.into(), blob.into(), length.into()],
                &[UInt8, UInt8, UInt32],
            ),
            Self::Ack { next, window } => serialize(
                &[OP_ACK.into(), next.into(), window.into()],
                &[UInt8, UInt16, UInt8],
            ),
            Self::Abort { reason } => serialize(&[OP_ABORT.into(), reason.into()], &[UInt8, UInt8]),
            Self::Pull { blob } => serialize(&[OP_PULL.into(), blob.into()], &[UInt8, UInt8]),
        }
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, TransferError> {
        use PrimitiveType::{UInt16, UInt32, UInt8};

        let (&opcode, body) = payload
            .split_first()
            .ok_or_else(|| TransferError::Protocol("empty control message".to_string()))?;
        let malformed = || TransferError::Protocol(format!("malformed control message {payload:02x?}"));
        let fields = |types: &[PrimitiveType]| deserialize(body, types).map_err(|_| malformed());

        match opcode {
            OP_START => {
                let [Value::U8(blob), Value::U32(length)] = fields(&[UInt8, UInt32])?[..] else {
                    return Err(malformed());
                };
                Ok(Self::Start { blob, length })
            }
            OP_ACK => {
                let [Value::U16(next), Value::U8(window)] = fields(&[UInt16, UInt8])?[..] else {
                    return Err(malformed());
                };
                Ok(Self::Ack { next, window })
            }
            OP_ABORT => {
                let [Value::U8(reason)] = fields(&[UInt8])?[..] else {
                    return Err(malformed());
                };
                Ok(Self::Abort { reason })
            }
            OP_PULL => {
                let [Value::U8(blob)] = fields(&[UInt8])?[..] else {
                    return Err(malformed());
                };
                Ok(Self::Pull { blob })
            }
            other => Err(TransferError::Protocol(format!(
                "unknown opcode 0x{other:02x}"
            ))),
        }
    }

    /// Control frame for `node_id`.
    pub fn frame(&self, node_id: u8) -> Result<Frame> {
        Ok(Frame::new(
            Address::new(node_id, TRANSFER_CONTROL)?,
            self.encode()?,
        )?)
    }
}

/// Splits a payload into indexed chunks.
#[derive(Debug, Clone)]
pub struct Segmenter {
    data: Bytes,
    chunk_size: usize,
    chunk_count: u16,
    next: u16,
}

impl Segmenter {
    pub fn new(data: Bytes, chunk_size: usize) -> std::result::Result<Self, TransferError> {
        let chunk_count = chunk_count(data.len(), chunk_size)?;
        Ok(Self {
            data,
            chunk_size,
            chunk_count,
            next: 0,
        })
    }

    pub fn chunk_count(&self) -> u16 {
        self.chunk_count
    }

    /// Index of the next chunk to send; equals the chunks sent so far.
    pub fn next_index(&self) -> u16 {
        self.next
    }

    pub fn is_done(&self) -> bool {
        self.next >= self.chunk_count
    }

    /// Data frame payload of chunk `index`.
    pub fn chunk(&self, index: u16) -> Option<Bytes> {
        if index >= self.chunk_count {
            return None;
        }
        let start = usize::from(index) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());

        let mut payload = BytesMut::with_capacity(INDEX_LEN + end - start);
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&self.data[start..end]);
        Some(payload.freeze())
    }

    /// Next chunk in order, advancing the cursor.
    pub fn next_chunk(&mut self) -> Option<(u16, Bytes)> {
        let index = self.next;
        let chunk = self.chunk(index)?;
        self.next += 1;
        Some((index, chunk))
    }
}

/// Rebuilds a payload from strictly in-order chunks.
#[derive(Debug)]
pub struct Reassembler {
    buf: BytesMut,
    length: usize,
    chunk_size: usize,
    chunk_count: u16,
    next: u16,
}

impl Reassembler {
    pub fn new(length: u32, chunk_size: usize) -> std::result::Result<Self, TransferError> {
        let length = usize::try_from(length).map_err(|_| TransferError::TooLarge {
            size: usize::MAX,
            max: max_payload(chunk_size),
        })?;
        let chunk_count = chunk_count(length, chunk_size)?;
        Ok(Self {
            buf: BytesMut::with_capacity(length),
            length,
            chunk_size,
            chunk_count,
            next: 0,
        })
    }

    /// Accept one data frame payload. Returns true once the payload is complete.
    pub fn push(&mut self, payload: &[u8]) -> std::result::Result<bool, TransferError> {
        let Some((index, data)) = split_chunk(payload) else {
            return Err(TransferError::Protocol(format!(
                "data frame of {} bytes has no chunk index",
                payload.len()
            )));
        };

        if index < self.next {
            return Err(TransferError::Duplicate(index));
        }
        if index > self.next || index >= self.chunk_count {
            return Err(TransferError::OutOfOrder {
                expected: self.next,
                actual: index,
            });
        }

        let expected = self.chunk_size.min(self.length - self.buf.len());
        if data.len() != expected {
            return Err(TransferError::ChunkLength {
                index,
                expected,
                actual: data.len(),
            });
        }

        self.buf.extend_from_slice(data);
        self.next += 1;
        Ok(self.is_complete())
    }

    pub fn next_index(&self) -> u16 {
        self.next
    }

    pub fn chunk_count(&self) -> u16 {
        self.chunk_count
    }

    pub fn is_complete(&self) -> bool {
        self.next >= self.chunk_count
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

fn split_chunk(payload: &[u8]) -> Option<(u16, &[u8])> {
    let index = payload.get(..INDEX_LEN)?;
    Some((u16::from_le_bytes([index[0], index[1]]), &payload[INDEX_LEN..]))
}

fn max_payload(chunk_size: usize) -> usize {
    chunk_size.saturating_mul(usize::from(u16::MAX))
}

fn chunk_count(len: usize, chunk_size: usize) -> std::result::Result<u16, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::Protocol("chunk size must be non-zero".to_string()));
    }
    u16::try_from(len.div_ceil(chunk_size)).map_err(|_| TransferError::TooLarge {
        size: len,
        max: max_payload(chunk_size),
    })
}

/// Send `data` as blob `blob` to the peer behind `link`.
///
/// Returns once the receiver acknowledged the final chunk.
pub fn send_blob(
    link: &Listener,
    node_id: u8,
    blob: u8,
    data: Bytes,
    config: &TransferConfig,
) -> Result<()> {
    let fail = |source| NodeError::Transfer { node_id, source };

    let length = u32::try_from(data.len()).map_err(|_| {
        fail(TransferError::TooLarge {
            size: data.len(),
            max: max_payload(config.chunk_size),
        })
    })?;
    let mut segmenter = Segmenter::new(data, config.chunk_size).map_err(fail)?;
    let data_address = Address::new(node_id, TRANSFER_DATA)?;

    debug!(node_id, blob, length, chunks = segmenter.chunk_count(), "transfer send started");
    send(link, &ControlMessage::Start { blob, length }.frame(node_id)?)?;

    let window = match wait_control(link, node_id, config)? {
        ControlMessage::Ack { next: 0, window } => window.max(1),
        ControlMessage::Abort { reason } => return Err(fail(TransferError::Aborted(reason))),
        other => {
            return Err(fail(TransferError::Protocol(format!(
                "expected start acknowledgement, got {other:?}"
            ))))
        }
    };

    while !segmenter.is_done() {
        for _ in 0..window {
            let Some((index, chunk)) = segmenter.next_chunk() else {
                break;
            };
            trace!(node_id, index, "transfer chunk sent");
            send(link, &Frame::new(data_address, chunk)?)?;
        }

        let sent = segmenter.next_index();
        match wait_control(link, node_id, config)? {
            ControlMessage::Ack { next, .. } if next == sent => {}
            ControlMessage::Abort { reason } => return Err(fail(TransferError::Aborted(reason))),
            other => {
                abort_quietly(link, node_id, abort::OUT_OF_ORDER);
                return Err(fail(TransferError::Protocol(format!(
                    "expected acknowledgement of {sent} chunks, got {other:?}"
                ))));
            }
        }
    }

    debug!(node_id, blob, "transfer send complete");
    Ok(())
}

/// Receive a blob whose `Start` has already arrived.
///
/// Acknowledges the start with this side's window and reassembles the
/// chunks. Any ordering failure aborts the peer and is returned.
pub fn accept_blob(
    link: &Listener,
    node_id: u8,
    blob: u8,
    length: u32,
    config: &TransferConfig,
) -> Result<Bytes> {
    let fail = |source| NodeError::Transfer { node_id, source };
    let window = config.window.max(1);

    let mut reassembler = match Reassembler::new(length, config.chunk_size) {
        Ok(reassembler) => reassembler,
        Err(err) => {
            abort_quietly(link, node_id, err.abort_reason());
            return Err(fail(err));
        }
    };

    debug!(node_id, blob, length, "transfer receive started");
    send(link, &ControlMessage::Ack { next: 0, window }.frame(node_id)?)?;

    while !reassembler.is_complete() {
        let payload = match wait_data(link, node_id, config) {
            Ok(payload) => payload,
            Err(NodeError::Transfer { source, .. }) => {
                if matches!(source, TransferError::Stalled(_)) {
                    abort_quietly(link, node_id, abort::STALLED);
                }
                return Err(fail(source));
            }
            Err(err) => return Err(err),
        };

        match reassembler.push(&payload) {
            Ok(complete) => {
                let next = reassembler.next_index();
                if complete || next % u16::from(window) == 0 {
                    send(link, &ControlMessage::Ack { next, window }.frame(node_id)?)?;
                }
            }
            Err(err) => {
                warn!(node_id, blob, error = %err, "transfer aborted");
                abort_quietly(link, node_id, err.abort_reason());
                return Err(fail(err));
            }
        }
    }

    debug!(node_id, blob, length, "transfer receive complete");
    Ok(reassembler.finish())
}

/// Ask the peer for blob `blob` and receive it.
pub fn pull_blob(link: &Listener, node_id: u8, blob: u8, config: &TransferConfig) -> Result<Bytes> {
    send(link, &ControlMessage::Pull { blob }.frame(node_id)?)?;

    match wait_control(link, node_id, config)? {
        ControlMessage::Start { blob: sent, length } if sent == blob => {
            accept_blob(link, node_id, blob, length, config)
        }
        ControlMessage::Abort { reason } => Err(NodeError::Transfer {
            node_id,
            source: TransferError::Aborted(reason),
        }),
        other => Err(NodeError::Transfer {
            node_id,
            source: TransferError::Protocol(format!("expected start of blob {blob}, got {other:?}")),
        }),
    }
}

/// Tell the peer to give up on the current transfer.
pub fn abort_peer(link: &Listener, node_id: u8, reason: u8) -> Result<()> {
    send(link, &ControlMessage::Abort { reason }.frame(node_id)?)
}

/// Abort the peer while already failing; a lost notification is only logged.
fn abort_quietly(link: &Listener, node_id: u8, reason: u8) {
    if let Err(err) = abort_peer(link, node_id, reason) {
        debug!(node_id, reason, error = %err, "abort notification not sent");
    }
}

fn send(link: &Listener, frame: &Frame) -> Result<()> {
    link.send(frame)
        .map_err(|err| NodeError::from_send(err, frame.address()))
}

/// Next control message; data frames are ignored.
fn wait_control(link: &Listener, node_id: u8, config: &TransferConfig) -> Result<ControlMessage> {
    let frame = wait_for(link, node_id, config, &[TRANSFER_CONTROL])?;
    ControlMessage::decode(frame.payload()).map_err(|source| NodeError::Transfer { node_id, source })
}

/// Next data chunk. A control `Abort` from the peer ends the wait.
fn wait_data(link: &Listener, node_id: u8, config: &TransferConfig) -> Result<Bytes> {
    loop {
        let frame = wait_for(link, node_id, config, &[TRANSFER_DATA, TRANSFER_CONTROL])?;
        if frame.endpoint_id() == TRANSFER_DATA {
            return Ok(frame.payload().clone());
        }
        if let Ok(ControlMessage::Abort { reason }) = ControlMessage::decode(frame.payload()) {
            return Err(NodeError::Transfer {
                node_id,
                source: TransferError::Aborted(reason),
            });
        }
    }
}

/// Wait for a data frame on one of `endpoints`. Other frames are discarded:
/// a transfer owns the listener while it runs.
fn wait_for(
    link: &Listener,
    node_id: u8,
    config: &TransferConfig,
    endpoints: &[u8],
) -> Result<Frame> {
    let deadline = Deadline::after(config.inactivity_timeout);
    loop {
        let Some(remaining) = deadline.remaining() else {
            return Err(NodeError::Transfer {
                node_id,
                source: TransferError::Stalled(config.inactivity_timeout),
            });
        };
        match link.recv_timeout(remaining.min(POLL_SLICE)) {
            Some(frame) if !frame.is_request() && endpoints.contains(&frame.endpoint_id()) => {
                return Ok(frame);
            }
            Some(frame) => trace!(address = %frame.address(), "ignoring frame during transfer"),
            None if !link.is_connected() => {
                return Err(NodeError::BusDisconnected {
                    node_id,
                    endpoint_id: endpoints.first().copied().unwrap_or(TRANSFER_CONTROL),
                });
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::test_support::{fast_transfer, Harness};

    fn recv_control(link: &Listener) -> ControlMessage {
        let frame = link.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.endpoint_id(), TRANSFER_CONTROL);
        ControlMessage::decode(frame.payload()).unwrap()
    }

    #[test]
    fn test_control_message_layout() {
        let start = ControlMessage::Start {
            blob: 1,
            length: 0x0102_0304,
        };
        assert_eq!(start.encode().unwrap().as_ref(), &[1, 1, 4, 3, 2, 1]);
        assert_eq!(
            ControlMessage::Ack { next: 3, window: 8 }.encode().unwrap().as_ref(),
            &[2, 3, 0, 8]
        );

        for message in [
            start,
            ControlMessage::Ack { next: 513, window: 4 },
            ControlMessage::Abort { reason: abort::STALLED },
            ControlMessage::Pull { blob: 0 },
        ] {
            assert_eq!(ControlMessage::decode(&message.encode().unwrap()).unwrap(), message);
        }
    }

    #[test]
    fn test_control_message_rejects_garbage() {
        assert!(ControlMessage::decode(&[]).is_err());
        assert!(ControlMessage::decode(&[0x7f]).is_err());
        assert!(ControlMessage::decode(&[OP_START, 1, 2]).is_err());
    }

    #[test]
    fn test_segmenter_chunks() {
        let data = Bytes::from((0u8..20).collect::<Vec<_>>());
        let mut segmenter = Segmenter::new(data, 6).unwrap();
        assert_eq!(segmenter.chunk_count(), 4);

        let chunks: Vec<_> = std::iter::from_fn(|| segmenter.next_chunk()).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].1.as_ref(), &[0, 0, 0, 1, 2, 3, 4, 5]);
        assert_eq!(chunks[3].1.as_ref(), &[3, 0, 18, 19]);
        assert!(segmenter.is_done());
    }

    #[test]
    fn test_segmenter_limits() {
        assert!(Segmenter::new(Bytes::new(), 6).unwrap().is_done());
        assert!(matches!(
            Segmenter::new(Bytes::from(vec![0u8; 65_536]), 1),
            Err(TransferError::TooLarge { .. })
        ));
        assert!(Segmenter::new(Bytes::from_static(b"x"), 0).is_err());
    }

    #[test]
    fn test_reassembler_in_order() {
        let data = Bytes::from((0u8..20).collect::<Vec<_>>());
        let segmenter = Segmenter::new(data.clone(), 6).unwrap();
        let mut reassembler = Reassembler::new(20, 6).unwrap();

        for index in 0..3 {
            assert!(!reassembler.push(&segmenter.chunk(index).unwrap()).unwrap());
        }
        assert!(reassembler.push(&segmenter.chunk(3).unwrap()).unwrap());
        assert_eq!(reassembler.finish(), data);
    }

    #[test]
    fn test_reassembler_rejects_disorder() {
        let segmenter = Segmenter::new(Bytes::from(vec![7u8; 18]), 6).unwrap();

        let mut reassembler = Reassembler::new(18, 6).unwrap();
        assert_eq!(
            reassembler.push(&segmenter.chunk(1).unwrap()),
            Err(TransferError::OutOfOrder {
                expected: 0,
                actual: 1
            })
        );

        let mut reassembler = Reassembler::new(18, 6).unwrap();
        reassembler.push(&segmenter.chunk(0).unwrap()).unwrap();
        assert_eq!(
            reassembler.push(&segmenter.chunk(0).unwrap()),
            Err(TransferError::Duplicate(0))
        );

        let mut reassembler = Reassembler::new(18, 6).unwrap();
        assert!(matches!(
            reassembler.push(&[0, 0, 1, 2]),
            Err(TransferError::ChunkLength { index: 0, .. })
        ));
        assert!(reassembler.push(&[0]).is_err());
    }

    #[test]
    fn test_empty_payload_completes_immediately() {
        let reassembler = Reassembler::new(0, 6).unwrap();
        assert!(reassembler.is_complete());
        assert!(reassembler.finish().is_empty());
    }

    #[test]
    fn test_send_and_accept_over_bus() {
        let harness = Harness::new();
        let host = harness.host.register_node(3);
        let device = harness.device.register_node(3);
        let config = TransferConfig {
            window: 2,
            ..fast_transfer()
        };

        // 5 full chunks plus a 4 byte remainder.
        let data = Bytes::from((0u8..34).collect::<Vec<_>>());
        let receiver = {
            let config = config.clone();
            thread::spawn(move || {
                let ControlMessage::Start { blob, length } = recv_control(&device) else {
                    panic!("expected start");
                };
                accept_blob(&device, 3, blob, length, &config).unwrap()
            })
        };

        send_blob(&host, 3, 1, data.clone(), &config).unwrap();
        assert_eq!(receiver.join().unwrap(), data);
    }

    #[test]
    fn test_pull_blob() {
        let harness = Harness::new();
        let host = harness.host.register_node(4);
        let device = harness.device.register_node(4);
        let config = fast_transfer();

        let sender = {
            let config = config.clone();
            thread::spawn(move || {
                assert_eq!(recv_control(&device), ControlMessage::Pull { blob: 0 });
                send_blob(&device, 4, 0, Bytes::from_static(b"{\"hello\":1}"), &config).unwrap();
            })
        };

        let blob = pull_blob(&host, 4, 0, &config).unwrap();
        assert_eq!(blob.as_ref(), b"{\"hello\":1}");
        sender.join().unwrap();
    }

    #[test]
    fn test_empty_blob_transfers() {
        let harness = Harness::new();
        let host = harness.host.register_node(5);
        let device = harness.device.register_node(5);
        let config = fast_transfer();

        let receiver = {
            let config = config.clone();
            thread::spawn(move || {
                let ControlMessage::Start { blob, length } = recv_control(&device) else {
                    panic!("expected start");
                };
                accept_blob(&device, 5, blob, length, &config).unwrap()
            })
        };

        send_blob(&host, 5, 1, Bytes::new(), &config).unwrap();
        assert!(receiver.join().unwrap().is_empty());
    }

    #[test]
    fn test_out_of_order_chunk_aborts() {
        let harness = Harness::new();
        let host = harness.host.register_node(6);
        let device = harness.device.register_node(6);
        let config = fast_transfer();

        let receiver = {
            let config = config.clone();
            thread::spawn(move || accept_blob(&device, 6, 1, 12, &config))
        };

        assert_eq!(recv_control(&host), ControlMessage::Ack { next: 0, window: 8 });
        let segmenter = Segmenter::new(Bytes::from(vec![1u8; 12]), 6).unwrap();
        let data = Address::new(6, TRANSFER_DATA).unwrap();
        host.send(&Frame::new(data, segmenter.chunk(1).unwrap()).unwrap())
            .unwrap();

        assert!(matches!(
            receiver.join().unwrap(),
            Err(NodeError::Transfer {
                node_id: 6,
                source: TransferError::OutOfOrder {
                    expected: 0,
                    actual: 1
                }
            })
        ));
        assert_eq!(
            recv_control(&host),
            ControlMessage::Abort {
                reason: abort::OUT_OF_ORDER
            }
        );
    }

    #[test]
    fn test_silent_peer_stalls() {
        let harness = Harness::new();
        let host = harness.host.register_node(7);
        let config = TransferConfig {
            inactivity_timeout: Duration::from_millis(50),
            ..fast_transfer()
        };

        let start = Instant::now();
        let result = send_blob(&host, 7, 1, Bytes::from_static(b"firmware"), &config);
        assert!(matches!(
            result,
            Err(NodeError::Transfer {
                source: TransferError::Stalled(_),
                ..
            })
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_lost_bus_names_the_node() {
        let harness = Harness::new();
        let host = harness.host.register_node(7);
        harness.bus.set_online(false);

        let sent = send_blob(&host, 7, 1, Bytes::from_static(b"firmware"), &fast_transfer());
        assert!(matches!(
            sent,
            Err(NodeError::BusDisconnected {
                node_id: 7,
                endpoint_id: TRANSFER_CONTROL
            })
        ));
        assert!(matches!(
            pull_blob(&host, 7, 0, &fast_transfer()),
            Err(NodeError::BusDisconnected { node_id: 7, .. })
        ));
    }

    #[test]
    fn test_failed_abort_keeps_original_error() {
        let harness = Harness::new();
        let host = harness.host.register_node(7);
        harness.bus.set_online(false);

        assert!(matches!(
            accept_blob(&host, 7, 1, u32::MAX, &fast_transfer()),
            Err(NodeError::Transfer {
                node_id: 7,
                source: TransferError::TooLarge { .. }
            })
        ));
    }
}
