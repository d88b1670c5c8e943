use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use bytes::Bytes;
use canprims_frame::{Address, Frame, CLASSIC_MAX_PAYLOAD};
use tracing::{debug, trace};

use crate::error::{BusError, Result};
use crate::traits::{BusConnector, BusDriver};

const CAN_FRAME_LEN: usize = std::mem::size_of::<libc::can_frame>();

/// Raw SocketCAN handle bound to one interface (classic frames only).
#[derive(Debug)]
pub struct SocketCan {
    fd: OwnedFd,
    interface: String,
}

impl SocketCan {
    /// Open a raw CAN socket on `interface` (e.g. `can0`).
    pub fn open(interface: &str) -> Result<Self> {
        let open_err = |source: io::Error| BusError::Open {
            bus: interface.to_string(),
            source,
        };

        let name = CString::new(interface)
            .map_err(|err| open_err(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
        if raw < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_can is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_can = unsafe { std::mem::zeroed() };
        addr.can_family = libc::AF_CAN as libc::sa_family_t;
        addr.can_ifindex = ifindex as libc::c_int;
        // SAFETY: `addr` is an initialized sockaddr_can and the length passed matches its size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_can).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        debug!(interface, "opened socketcan interface");
        Ok(Self {
            fd,
            interface: interface.to_string(),
        })
    }

    /// Interface this socket is bound to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        loop {
            // SAFETY: `pfd` is a valid pollfd and we pass exactly one entry.
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BusError::Io(err));
            }
            if rc > 0 && pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(BusError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("{} reported a socket error", self.interface),
                )));
            }
            return Ok(rc > 0);
        }
    }
}

impl BusDriver for SocketCan {
    fn send(&self, frame: &Frame) -> Result<()> {
        let raw = encode_raw(frame)?;
        loop {
            // SAFETY: `raw` is a fully initialized can_frame and the length matches its size.
            let rc = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    (&raw as *const libc::can_frame).cast::<libc::c_void>(),
                    CAN_FRAME_LEN,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BusError::Io(err));
            }
            check_transferred(rc, io::ErrorKind::WriteZero)?;
            trace!(address = %frame.address(), len = frame.payload().len(), "socketcan tx");
            return Ok(());
        }
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Frame>> {
        loop {
            if !self.wait_readable(timeout)? {
                return Ok(None);
            }

            // SAFETY: can_frame is plain old data; all-zero is a valid value.
            let mut raw: libc::can_frame = unsafe { std::mem::zeroed() };
            // SAFETY: `raw` is writable for its full size, which is the length passed.
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut raw as *mut libc::can_frame).cast::<libc::c_void>(),
                    CAN_FRAME_LEN,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Ok(None),
                    _ => return Err(BusError::Io(err)),
                }
            }

            check_transferred(rc, io::ErrorKind::UnexpectedEof)?;

            match decode_raw(&raw)? {
                Some(frame) => return Ok(Some(frame)),
                None => trace!(can_id = raw.can_id, "skipping extended or error frame"),
            }
        }
    }
}

fn encode_raw(frame: &Frame) -> Result<libc::can_frame> {
    let payload = frame.payload();
    if payload.len() > CLASSIC_MAX_PAYLOAD {
        return Err(canprims_frame::FrameError::PayloadTooLarge {
            size: payload.len(),
            max: CLASSIC_MAX_PAYLOAD,
        }
        .into());
    }

    // SAFETY: can_frame is plain old data; all-zero is a valid value.
    let mut raw: libc::can_frame = unsafe { std::mem::zeroed() };
    raw.can_id = libc::canid_t::from(frame.address().raw());
    if frame.is_request() {
        raw.can_id |= libc::CAN_RTR_FLAG;
    }
    raw.can_dlc = payload.len() as u8;
    raw.data[..payload.len()].copy_from_slice(payload);
    Ok(raw)
}

/// `None` for extended-id and error frames, which this protocol does not use.
fn decode_raw(raw: &libc::can_frame) -> Result<Option<Frame>> {
    if raw.can_id & (libc::CAN_EFF_FLAG | libc::CAN_ERR_FLAG) != 0 {
        return Ok(None);
    }

    let address = Address::from_raw(raw.can_id & libc::CAN_SFF_MASK)?;
    if raw.can_id & libc::CAN_RTR_FLAG != 0 {
        return Ok(Some(Frame::request(address)));
    }
    let len = usize::from(raw.can_dlc).min(CLASSIC_MAX_PAYLOAD);
    Ok(Some(Frame::new(address, Bytes::copy_from_slice(&raw.data[..len]))?))
}

/// A raw socket moves whole frames; anything shorter is an I/O failure.
fn check_transferred(rc: isize, short: io::ErrorKind) -> Result<()> {
    if rc as usize == CAN_FRAME_LEN {
        return Ok(());
    }
    Err(BusError::Io(io::Error::new(
        short,
        format!("transferred {rc} of {CAN_FRAME_LEN} frame bytes"),
    )))
}

/// Opens [`SocketCan`] handles on a named interface.
#[derive(Debug, Clone)]
pub struct SocketCanConnector {
    interface: String,
}

impl SocketCanConnector {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

impl BusConnector for SocketCanConnector {
    fn open(&self) -> Result<Box<dyn BusDriver>> {
        Ok(Box::new(SocketCan::open(&self.interface)?))
    }

    fn describe(&self) -> String {
        format!("socketcan:{}", self.interface)
    }
}
