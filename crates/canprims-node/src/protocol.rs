//! Payloads of the reserved endpoints.

use bytes::Bytes;
use canprims_frame::{deserialize, serialize, Address, Frame, FrameError, PrimitiveType, Value};

use crate::error::Result;

/// Protocol generation spoken by this host.
pub const PROTOCOL_VERSION: u8 = 1;

/// Blob id of the endpoint table (JSON).
pub const BLOB_ENDPOINT_TABLE: u8 = 0;

/// Blob id of a firmware image.
pub const BLOB_FIRMWARE: u8 = 1;

const ANNOUNCEMENT_FIELDS: [PrimitiveType; 2] = [PrimitiveType::UInt8, PrimitiveType::UInt32];
const PROTOCOL_INFO_FIELDS: [PrimitiveType; 2] = [PrimitiveType::UInt8, PrimitiveType::UInt32];

/// Payload of a periodic announcement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub protocol_version: u8,
    /// Hardware serial, used to tell devices apart when a node id is reused.
    pub serial_number: u32,
}

impl Announcement {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(serialize(
            &[self.protocol_version.into(), self.serial_number.into()],
            &ANNOUNCEMENT_FIELDS,
        )?)
    }

    /// Parse an announcement payload. Short payloads carry no details.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match deserialize(payload, &ANNOUNCEMENT_FIELDS).ok()?.as_slice() {
            [Value::U8(protocol_version), Value::U32(serial_number)] => Some(Self {
                protocol_version: *protocol_version,
                serial_number: *serial_number,
            }),
            _ => None,
        }
    }

    /// Announcement frame for `node_id`.
    pub fn frame(&self, node_id: u8) -> Result<Frame> {
        Ok(Frame::new(Address::announcement(node_id)?, self.encode()?)?)
    }
}

/// Reply of the `PROTOCOL_INFO` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub version: u8,
    /// Size in bytes of the endpoint table blob.
    pub table_len: u32,
}

impl ProtocolInfo {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(serialize(
            &[self.version.into(), self.table_len.into()],
            &PROTOCOL_INFO_FIELDS,
        )?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let values = deserialize(payload, &PROTOCOL_INFO_FIELDS)?;
        match values.as_slice() {
            [Value::U8(version), Value::U32(table_len)] => Ok(Self {
                version: *version,
                table_len: *table_len,
            }),
            _ => Err(FrameError::Decoding {
                needed: 5,
                available: payload.len(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_layout() {
        let announcement = Announcement {
            protocol_version: PROTOCOL_VERSION,
            serial_number: 0xDEAD_BEEF,
        };
        let frame = announcement.frame(5).unwrap();

        assert!(frame.address().is_announcement());
        assert_eq!(frame.node_id(), 5);
        assert_eq!(frame.payload().as_ref(), &[1, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(Announcement::decode(frame.payload()), Some(announcement));
    }

    #[test]
    fn test_short_announcement_has_no_details() {
        assert_eq!(Announcement::decode(&[]), None);
        assert_eq!(Announcement::decode(&[1, 2]), None);
    }

    #[test]
    fn test_protocol_info_decode() {
        let info = ProtocolInfo::decode(&[1, 0x10, 0x02, 0, 0]).unwrap();
        assert_eq!(
            info,
            ProtocolInfo {
                version: 1,
                table_len: 0x210
            }
        );
        assert!(ProtocolInfo::decode(&[1]).is_err());
    }
}
