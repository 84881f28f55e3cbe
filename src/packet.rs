//! Wire frame codec (C2).
//!
//! Ground truth: `examples/original_source/dppackets.go`, whose Go structs
//! are serialized by a struct-tag-driven helper (`sfpacket:"len(Id)"`). We
//! hand-roll the equivalent push/read logic instead, the way the teacher
//! hand-rolls `Sample::parse`/`serialize` in `src/sample.rs` rather than
//! reaching for a derive macro — the length-prefix-derived-from-another-
//! field relationship doesn't fit a plain derive anyway.

use crate::error::{DppeError, Result};

/// Header byte identifying a frame on the wire.
pub mod header {
    /// Heartbeat: EUI-64 + uptime.
    pub const HEARTBEAT: u8 = 0x00;
    /// Parameter value, in reply to a get or set.
    pub const PARAMETER: u8 = 0x10;
    /// Get by name.
    pub const GET_BY_ID: u8 = 0x21;
    /// Get by sequence number.
    pub const GET_BY_SEQNUM: u8 = 0x22;
    /// Set by name.
    pub const SET_BY_ID: u8 = 0x31;
    /// Set by sequence number.
    pub const SET_BY_SEQNUM: u8 = 0x32;
    /// Error, addressed by name.
    pub const ERROR_BY_ID: u8 = 0xF0;
    /// Error, addressed by sequence number.
    pub const ERROR_BY_SEQNUM: u8 = 0xF1;
}

/// Maximum length of an `id` or `value` field: the length prefix is 8-bit.
pub const MAX_FIELD_LEN: usize = 255;

/// The eight protocol frame shapes (spec.md §4.2). All multi-byte integers
/// are big-endian; id/value fields are length-prefixed with an 8-bit
/// unsigned count and capped at [`MAX_FIELD_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `0x00` — EUI-64 + uptime-seconds.
    Heartbeat {
        /// Globally unique device id.
        eui64: u64,
        /// Seconds since device boot.
        uptime_secs: u32,
    },
    /// `0x10` — a parameter's current type/seqnum/id/value.
    Parameter {
        /// Wire type code.
        ty: u8,
        /// Device-assigned sequence number.
        seqnum: u8,
        /// Parameter name.
        id: Vec<u8>,
        /// Parameter value.
        value: Vec<u8>,
    },
    /// `0x21` — request a parameter by name.
    GetById {
        /// Parameter name.
        id: Vec<u8>,
    },
    /// `0x22` — request a parameter by sequence number.
    GetBySeqnum {
        /// Sequence number to fetch.
        seqnum: u8,
    },
    /// `0x31` — write a parameter by name.
    SetById {
        /// Parameter name.
        id: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// `0x32` — write a parameter by sequence number.
    SetBySeqnum {
        /// Sequence number to write.
        seqnum: u8,
        /// New value.
        value: Vec<u8>,
    },
    /// `0xF0` — error response, addressed by name.
    ErrorById {
        /// Whether the parameter exists on the device at all.
        exists: bool,
        /// Device error code (meaningful only if `exists`).
        err: u8,
        /// Parameter name the error is about.
        id: Vec<u8>,
    },
    /// `0xF1` — error response, addressed by sequence number.
    ErrorBySeqnum {
        /// Whether the parameter exists on the device at all.
        exists: bool,
        /// Device error code (meaningful only if `exists`).
        err: u8,
        /// Sequence number the error is about.
        seqnum: u8,
    },
}

fn check_field(name: &str, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_FIELD_LEN {
        return Err(DppeError::MalformedFrame(format!(
            "{name} is {} bytes, limit is {MAX_FIELD_LEN}",
            bytes.len()
        )));
    }
    Ok(())
}

impl Frame {
    /// Serialize into wire bytes. Fails rather than silently truncating an
    /// oversized `id`/`value`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Frame::Heartbeat {
                eui64,
                uptime_secs,
            } => {
                out.push(header::HEARTBEAT);
                out.extend_from_slice(&eui64.to_be_bytes());
                out.extend_from_slice(&uptime_secs.to_be_bytes());
            }
            Frame::Parameter {
                ty,
                seqnum,
                id,
                value,
            } => {
                check_field("id", id)?;
                check_field("value", value)?;
                out.push(header::PARAMETER);
                out.push(*ty);
                out.push(*seqnum);
                out.push(id.len() as u8);
                out.push(value.len() as u8);
                out.extend_from_slice(id);
                out.extend_from_slice(value);
            }
            Frame::GetById { id } => {
                check_field("id", id)?;
                out.push(header::GET_BY_ID);
                out.push(id.len() as u8);
                out.extend_from_slice(id);
            }
            Frame::GetBySeqnum { seqnum } => {
                out.push(header::GET_BY_SEQNUM);
                out.push(*seqnum);
            }
            Frame::SetById { id, value } => {
                check_field("id", id)?;
                check_field("value", value)?;
                out.push(header::SET_BY_ID);
                out.push(id.len() as u8);
                out.push(value.len() as u8);
                out.extend_from_slice(id);
                out.extend_from_slice(value);
            }
            Frame::SetBySeqnum { seqnum, value } => {
                check_field("value", value)?;
                out.push(header::SET_BY_SEQNUM);
                out.push(*seqnum);
                out.push(value.len() as u8);
                out.extend_from_slice(value);
            }
            Frame::ErrorById { exists, err, id } => {
                check_field("id", id)?;
                out.push(header::ERROR_BY_ID);
                out.push(*exists as u8);
                out.push(*err);
                out.push(id.len() as u8);
                out.extend_from_slice(id);
            }
            Frame::ErrorBySeqnum {
                exists,
                err,
                seqnum,
            } => {
                out.push(header::ERROR_BY_SEQNUM);
                out.push(*exists as u8);
                out.push(*err);
                out.push(*seqnum);
            }
        }
        Ok(out)
    }

    /// Decode a frame from a buffer. Rejects frames whose declared lengths
    /// exceed the remaining buffer rather than reading out of bounds.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let h = r.u8("header")?;
        let frame = match h {
            header::HEARTBEAT => Frame::Heartbeat {
                eui64: r.u64("eui64")?,
                uptime_secs: r.u32("uptime")?,
            },
            header::PARAMETER => {
                let ty = r.u8("type")?;
                let seqnum = r.u8("seqnum")?;
                let id_len = r.u8("idLen")? as usize;
                let value_len = r.u8("valueLen")? as usize;
                let id = r.bytes("id", id_len)?;
                let value = r.bytes("value", value_len)?;
                Frame::Parameter {
                    ty,
                    seqnum,
                    id,
                    value,
                }
            }
            header::GET_BY_ID => {
                let id_len = r.u8("idLen")? as usize;
                let id = r.bytes("id", id_len)?;
                Frame::GetById { id }
            }
            header::GET_BY_SEQNUM => Frame::GetBySeqnum {
                seqnum: r.u8("seqnum")?,
            },
            header::SET_BY_ID => {
                let id_len = r.u8("idLen")? as usize;
                let value_len = r.u8("valueLen")? as usize;
                let id = r.bytes("id", id_len)?;
                let value = r.bytes("value", value_len)?;
                Frame::SetById { id, value }
            }
            header::SET_BY_SEQNUM => {
                let seqnum = r.u8("seqnum")?;
                let value_len = r.u8("valueLen")? as usize;
                let value = r.bytes("value", value_len)?;
                Frame::SetBySeqnum { seqnum, value }
            }
            header::ERROR_BY_ID => {
                let exists = r.u8("exists")? != 0;
                let err = r.u8("err")?;
                let id_len = r.u8("idLen")? as usize;
                let id = r.bytes("id", id_len)?;
                Frame::ErrorById { exists, err, id }
            }
            header::ERROR_BY_SEQNUM => {
                let exists = r.u8("exists")? != 0;
                let err = r.u8("err")?;
                let seqnum = r.u8("seqnum")?;
                Frame::ErrorBySeqnum {
                    exists,
                    err,
                    seqnum,
                }
            }
            other => {
                return Err(DppeError::MalformedFrame(format!(
                    "unknown frame header 0x{other:02x}"
                )));
            }
        };
        Ok(frame)
    }

    /// Header byte this frame would serialize to. Used by the transport
    /// layer to filter subscriptions without a full decode.
    pub fn header(&self) -> u8 {
        match self {
            Frame::Heartbeat { .. } => header::HEARTBEAT,
            Frame::Parameter { .. } => header::PARAMETER,
            Frame::GetById { .. } => header::GET_BY_ID,
            Frame::GetBySeqnum { .. } => header::GET_BY_SEQNUM,
            Frame::SetById { .. } => header::SET_BY_ID,
            Frame::SetBySeqnum { .. } => header::SET_BY_SEQNUM,
            Frame::ErrorById { .. } => header::ERROR_BY_ID,
            Frame::ErrorBySeqnum { .. } => header::ERROR_BY_SEQNUM,
        }
    }
}

/// Small cursor over a byte buffer that turns short reads into
/// [`DppeError::MalformedFrame`] instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self, field: &str) -> Result<u8> {
        let b = self.bytes(field, 1)?;
        Ok(b[0])
    }

    fn u32(&mut self, field: &str) -> Result<u32> {
        let b = self.bytes(field, 4)?;
        Ok(u32::from_be_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self, field: &str) -> Result<u64> {
        let b = self.bytes(field, 8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn bytes(&mut self, field: &str, len: usize) -> Result<Vec<u8>> {
        if self.pos + len > self.buf.len() {
            return Err(DppeError::MalformedFrame(format!(
                "truncated frame reading {field}: need {len} bytes, have {}",
                self.buf.len() - self.pos
            )));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_serialize() {
        let f = Frame::Parameter {
            ty: 0x01,
            seqnum: 0,
            id: b"test".to_vec(),
            value: vec![1, 2, 3],
        };
        let bytes = f.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0x10, 0x01, 0x00, 0x04, 0x03, b't', b'e', b's', b't', 1, 2, 3]
        );
        assert_eq!(Frame::decode(&bytes).unwrap(), f);
    }

    #[test]
    fn round_trip_all_variants() {
        let frames = vec![
            Frame::Heartbeat {
                eui64: 0x0102030405060708,
                uptime_secs: 42,
            },
            Frame::GetById {
                id: b"radio_channel".to_vec(),
            },
            Frame::GetBySeqnum { seqnum: 5 },
            Frame::SetById {
                id: b"x".to_vec(),
                value: vec![9],
            },
            Frame::SetBySeqnum {
                seqnum: 1,
                value: vec![9, 9],
            },
            Frame::ErrorById {
                exists: false,
                err: 0,
                id: b"dummy".to_vec(),
            },
            Frame::ErrorBySeqnum {
                exists: true,
                err: 6,
                seqnum: 4,
            },
        ];
        for f in frames {
            let bytes = f.encode().unwrap();
            assert_eq!(Frame::decode(&bytes).unwrap(), f);
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = vec![0x10, 0x01, 0x00, 0x04, 0x03, b't', b'e'];
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn oversized_field_is_rejected_at_encode() {
        let f = Frame::GetById {
            id: vec![0u8; 256],
        };
        assert!(f.encode().is_err());
    }

    #[test]
    fn unknown_header_is_rejected() {
        assert!(Frame::decode(&[0x55]).is_err());
    }
}
