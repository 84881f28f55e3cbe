//! Parameter type tags and the typed value codec (C1).
//!
//! Ground truth: `examples/original_source/parameters.go`. Numeric types are
//! parsed/formatted big-endian, matching the wire codec (C2); sign
//! extension is never performed, so a decoded `i8` of `0xFF` prints `-1`
//! but is never reinterpreted as any other width.

use crate::error::{DppeError, Result};
use std::fmt;
use std::time::SystemTime;

/// Tagged enumeration of the wire-level parameter types.
///
/// Each non-RAW, non-STRING, non-NIL variant fixes an exact byte width;
/// [`ParameterType::width`] encodes that invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterType {
    /// Opaque bytes, formatted as uppercase hex.
    Raw,
    /// Unsigned 8-bit.
    Uint8,
    /// Unsigned 16-bit.
    Uint16,
    /// Unsigned 32-bit.
    Uint32,
    /// Unsigned 64-bit.
    Uint64,
    /// UTF-8 text, no NUL terminator.
    Str,
    /// Signed 8-bit.
    Int8,
    /// Signed 16-bit.
    Int16,
    /// Signed 32-bit.
    Int32,
    /// Signed 64-bit.
    Int64,
    /// Sentinel meaning "unspecified". Never appears on the wire.
    Nil,
}

impl ParameterType {
    /// The wire code for this type, per spec.md §3.
    pub fn code(self) -> u8 {
        match self {
            ParameterType::Raw => 0x00,
            ParameterType::Uint8 => 0x01,
            ParameterType::Uint16 => 0x02,
            ParameterType::Uint32 => 0x04,
            ParameterType::Uint64 => 0x08,
            ParameterType::Str => 0x80,
            ParameterType::Int8 => 0x81,
            ParameterType::Int16 => 0x82,
            ParameterType::Int32 => 0x84,
            ParameterType::Int64 => 0x88,
            ParameterType::Nil => 0xFF,
        }
    }

    /// Decode a wire code. Unknown codes are rejected by the caller, not
    /// silently mapped to [`ParameterType::Nil`].
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => ParameterType::Raw,
            0x01 => ParameterType::Uint8,
            0x02 => ParameterType::Uint16,
            0x04 => ParameterType::Uint32,
            0x08 => ParameterType::Uint64,
            0x80 => ParameterType::Str,
            0x81 => ParameterType::Int8,
            0x82 => ParameterType::Int16,
            0x84 => ParameterType::Int32,
            0x88 => ParameterType::Int64,
            0xFF => ParameterType::Nil,
            other => {
                return Err(DppeError::MalformedFrame(format!(
                    "unknown parameter type code 0x{other:02x}"
                )));
            }
        })
    }

    /// Fixed byte width for integer types; `None` for RAW/STRING/NIL, whose
    /// width is determined by the payload itself.
    pub fn width(self) -> Option<usize> {
        match self {
            ParameterType::Uint8 | ParameterType::Int8 => Some(1),
            ParameterType::Uint16 | ParameterType::Int16 => Some(2),
            ParameterType::Uint32 | ParameterType::Int32 => Some(4),
            ParameterType::Uint64 | ParameterType::Int64 => Some(8),
            ParameterType::Raw | ParameterType::Str | ParameterType::Nil => None,
        }
    }

    /// Short token used in the task file and CLI (`raw`, `u8`, ..., `nil`).
    pub fn type_name(self) -> &'static str {
        match self {
            ParameterType::Raw => "raw",
            ParameterType::Uint8 => "u8",
            ParameterType::Uint16 => "u16",
            ParameterType::Uint32 => "u32",
            ParameterType::Uint64 => "u64",
            ParameterType::Str => "str",
            ParameterType::Int8 => "i8",
            ParameterType::Int16 => "i16",
            ParameterType::Int32 => "i32",
            ParameterType::Int64 => "i64",
            ParameterType::Nil => "nil",
        }
    }

    /// Inverse of [`ParameterType::type_name`].
    pub fn parse_name(name: &str) -> Result<Self> {
        Ok(match name {
            "raw" => ParameterType::Raw,
            "u8" => ParameterType::Uint8,
            "u16" => ParameterType::Uint16,
            "u32" => ParameterType::Uint32,
            "u64" => ParameterType::Uint64,
            "str" => ParameterType::Str,
            "i8" => ParameterType::Int8,
            "i16" => ParameterType::Int16,
            "i32" => ParameterType::Int32,
            "i64" => ParameterType::Int64,
            "nil" => ParameterType::Nil,
            other => {
                return Err(DppeError::InvalidParameterValue(format!(
                    "{other} is not a valid parameter type"
                )));
            }
        })
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl std::str::FromStr for ParameterType {
    type Err = DppeError;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse_name(s)
    }
}

/// Parse a textual value into its wire bytes for the given type.
///
/// RAW hex-decodes, STRING takes UTF-8 bytes verbatim, NIL always yields an
/// empty buffer, and integer types parse base-10 and range-check against
/// their width before encoding big-endian.
pub fn parse(ty: ParameterType, text: &str) -> Result<Vec<u8>> {
    match ty {
        ParameterType::Raw => hex::decode(text)
            .map_err(|e| DppeError::InvalidParameterValue(format!("bad hex value: {e}"))),
        ParameterType::Str => Ok(text.as_bytes().to_vec()),
        ParameterType::Nil => Ok(Vec::new()),
        ParameterType::Uint8 => text
            .parse::<u8>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Uint16 => text
            .parse::<u16>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Uint32 => text
            .parse::<u32>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Uint64 => text
            .parse::<u64>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Int8 => text
            .parse::<i8>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Int16 => text
            .parse::<i16>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Int32 => text
            .parse::<i32>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
        ParameterType::Int64 => text
            .parse::<i64>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|e| overflow_err(ty, text, e)),
    }
}

fn overflow_err(ty: ParameterType, text: &str, e: impl fmt::Display) -> DppeError {
    DppeError::InvalidParameterValue(format!("'{text}' is not a valid {ty} value: {e}"))
}

/// Format wire bytes for the given type back into text.
///
/// Integer types require the payload to be exactly their declared width;
/// if it isn't, this falls back to a decimal dump of the raw bytes and
/// returns [`DppeError::MalformedValue`] alongside that fallback text so
/// the caller can still display *something* (matching the Go source's
/// `s := fmt.Sprintf("%v", value)` default before attempting the typed
/// decode).
pub fn format(ty: ParameterType, bytes: &[u8]) -> std::result::Result<String, (String, DppeError)> {
    match ty {
        ParameterType::Raw | ParameterType::Nil => Ok(hex::encode_upper(bytes)),
        ParameterType::Str => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(e) => Err((
                hex::encode_upper(bytes),
                DppeError::MalformedValue(format!("not valid UTF-8: {e}")),
            )),
        },
        ParameterType::Uint8 => format_int(bytes, 1, |b| u8::from_be_bytes([b[0]]).to_string()),
        ParameterType::Uint16 => {
            format_int(bytes, 2, |b| u16::from_be_bytes([b[0], b[1]]).to_string())
        }
        ParameterType::Uint32 => format_int(bytes, 4, |b| {
            u32::from_be_bytes(b.try_into().unwrap()).to_string()
        }),
        ParameterType::Uint64 => format_int(bytes, 8, |b| {
            u64::from_be_bytes(b.try_into().unwrap()).to_string()
        }),
        ParameterType::Int8 => format_int(bytes, 1, |b| i8::from_be_bytes([b[0]]).to_string()),
        ParameterType::Int16 => {
            format_int(bytes, 2, |b| i16::from_be_bytes([b[0], b[1]]).to_string())
        }
        ParameterType::Int32 => format_int(bytes, 4, |b| {
            i32::from_be_bytes(b.try_into().unwrap()).to_string()
        }),
        ParameterType::Int64 => format_int(bytes, 8, |b| {
            i64::from_be_bytes(b.try_into().unwrap()).to_string()
        }),
    }
}

fn format_int(
    bytes: &[u8],
    width: usize,
    decode: impl Fn(&[u8]) -> String,
) -> std::result::Result<String, (String, DppeError)> {
    if bytes.len() == width {
        Ok(decode(bytes))
    } else {
        let dump = bytes
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Err((
            dump,
            DppeError::MalformedValue(format!(
                "expected {width} bytes, got {}",
                bytes.len()
            )),
        ))
    }
}

/// One device parameter, as observed by the engine (spec.md §3).
#[derive(Debug)]
pub struct Parameter {
    /// ASCII name, 1..16 bytes, unique within a device.
    pub name: String,
    /// Wire type, as reported by the device (the device is authoritative).
    pub ty: ParameterType,
    /// Device-assigned sequence number.
    pub seqnum: u8,
    /// Current value bytes.
    pub value: Vec<u8>,
    /// When this observation was made.
    pub timestamp: SystemTime,
    /// Set if this entry represents a failed retrieval (used by
    /// [`crate::session::DppeSession::get_list`] when retries are
    /// exhausted for a seqnum).
    pub error: Option<DppeError>,
}

impl Parameter {
    /// Render the value the way [`format`] would, falling back to the raw
    /// decimal dump on a malformed width instead of panicking.
    pub fn display_value(&self) -> String {
        match format(self.ty, &self.value) {
            Ok(s) => s,
            Err((dump, _)) => dump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_integers() {
        for (name, ty) in [
            ("u8", ParameterType::Uint8),
            ("u16", ParameterType::Uint16),
            ("u32", ParameterType::Uint32),
            ("u64", ParameterType::Uint64),
            ("i8", ParameterType::Int8),
            ("i16", ParameterType::Int16),
            ("i32", ParameterType::Int32),
            ("i64", ParameterType::Int64),
        ] {
            assert_eq!(ParameterType::parse_name(name).unwrap(), ty);
            assert_eq!(ty.type_name(), name);
        }
    }

    #[test]
    fn parse_and_format_u8() {
        let bytes = parse(ParameterType::Uint8, "11").unwrap();
        assert_eq!(bytes, vec![0x0B]);
        assert_eq!(format(ParameterType::Uint8, &bytes).unwrap(), "11");
    }

    #[test]
    fn negative_int16_is_bit_exact() {
        let bytes = parse(ParameterType::Int16, "-1").unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFF]);
        assert_eq!(format(ParameterType::Int16, &bytes).unwrap(), "-1");
    }

    #[test]
    fn overflow_is_rejected() {
        assert!(parse(ParameterType::Uint8, "256").is_err());
    }

    #[test]
    fn raw_is_hex() {
        let bytes = parse(ParameterType::Raw, "0b").unwrap();
        assert_eq!(bytes, vec![0x0b]);
        assert_eq!(format(ParameterType::Raw, &bytes).unwrap(), "0B");
    }

    #[test]
    fn malformed_width_falls_back_to_decimal_dump() {
        let (dump, err) = format(ParameterType::Uint32, &[1, 2]).unwrap_err();
        assert_eq!(dump, "1 2");
        assert!(matches!(err, DppeError::MalformedValue(_)));
    }

    #[test]
    fn string_is_utf8_verbatim() {
        let bytes = parse(ParameterType::Str, "hello").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(format(ParameterType::Str, &bytes).unwrap(), "hello");
    }
}
