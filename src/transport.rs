//! Transport adapter contract (C3).
//!
//! The packet transport itself — the serial-framed link or TCP forwarder,
//! with its wire-framing and CRC — is an external collaborator per
//! spec.md §1; only the interface the engine consumes lives here. The one
//! concrete implementation this crate ships is [`crate::mock_transport::MockTransport`],
//! used by tests; a real deployment links in a transport crate that
//! implements [`Transport`] against actual hardware.

use crate::error::{DppeError, Result};
use std::sync::mpsc::Sender;

/// A 16-bit active-message address. `0` and `0xFFFF` are reserved (spec.md
/// §3's `DirectorTask::address` invariant); the transport layer treats `0`
/// as "no destination set" (serial-raw / broadcast).
pub type Addr = u16;

/// Serial-type byte used to subscribe to device-parameter frames in
/// serial-raw mode.
pub const TOS_SERIAL_DEVICE_PARAMETERS_ID: u8 = 0x80;

/// Active-message id used for the device-parameter protocol.
pub const AMID_DEVICE_PARAMETERS: u8 = 0x82;

/// A single transport-level packet: an opaque payload plus, in
/// active-message mode, addressing fields.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    payload: Vec<u8>,
    destination: Option<Addr>,
    amid: Option<u8>,
    source: Option<Addr>,
}

impl Packet {
    /// Payload bytes.
    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload bytes.
    pub fn set_payload(&mut self, bytes: Vec<u8>) {
        self.payload = bytes;
    }

    /// Set the destination address. Only meaningful in active-message mode.
    pub fn set_destination(&mut self, addr: Addr) {
        self.destination = Some(addr);
    }

    /// Destination address, if set.
    pub fn destination(&self) -> Option<Addr> {
        self.destination
    }

    /// Set the active-message id. Only meaningful in active-message mode.
    pub fn set_type(&mut self, amid: u8) {
        self.amid = Some(amid);
    }

    /// Active-message id, if set.
    pub fn amid(&self) -> Option<u8> {
        self.amid
    }

    /// Origin address of a received frame, used for filtering.
    pub fn source(&self) -> Option<Addr> {
        self.source
    }

    /// Record the origin address. Called by a `Transport` implementation
    /// when it hands a received frame to a subscriber.
    pub fn set_source(&mut self, addr: Addr) {
        self.source = Some(addr);
    }
}

/// How a `Transport` addresses packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// One byte stream per device; frames are tagged with a single type
    /// byte (spec.md: "subscribe by type byte 0x80").
    SerialRaw,
    /// An addressed bus; frames carry `(group, source, destination, amid)`.
    ActiveMessage {
        /// AM group the local node is on.
        group: u16,
        /// Local node's own AM address.
        local: Addr,
    },
}

/// What a subscriber wants to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Serial-raw: match frames tagged with this type byte.
    RawType(u8),
    /// Active-message: match frames with this `(group, local, amid)`.
    /// Source-address filtering beyond this is the engine's job (spec.md
    /// §4.3).
    ActiveMessage {
        /// AM group.
        group: u16,
        /// Local address the subscription is registered under.
        local: Addr,
        /// Active-message id to match.
        amid: u8,
    },
}

/// Opaque handle returned by [`Transport::subscribe`], passed back to
/// [`Transport::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration(pub u64);

/// The contract the engine consumes from the transport (spec.md §4.3).
///
/// Implementations must be usable from the background-receiver thread a
/// [`crate::session::DppeSession`] spawns, hence `Send + Sync`.
pub trait Transport: Send + Sync {
    /// Addressing mode this transport operates in.
    fn mode(&self) -> TransportMode;

    /// Allocate an empty packet appropriate for this transport's mode.
    fn new_packet(&self) -> Packet {
        Packet::default()
    }

    /// Best-effort enqueue. The engine performs retries regardless of
    /// whether this returns an error.
    fn send(&self, packet: Packet) -> Result<()>;

    /// Register a receive queue matched by `selector`. Returns a handle
    /// for [`Transport::unsubscribe`].
    fn subscribe(&self, selector: Selector, queue: Sender<Packet>) -> Registration;

    /// Unregister a receive queue. Idempotent on closed sessions.
    fn unsubscribe(&self, registration: Registration);
}

/// What a connection string resolves to. Parsing stops here — dialing the
/// socket or opening the serial port is the transport crate's job, per
/// spec.md §1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// `sf@HOST:PORT` — connect to a TCP-forwarder ("serial forwarder").
    SerialForwarder {
        /// Hostname or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// `serial@PORT:BAUD` — open a local serial device directly.
    Serial {
        /// Device path (e.g. `/dev/ttyUSB0`).
        port: String,
        /// Baud rate.
        baud: u32,
    },
}

/// Parse a `sf@host:port` or `serial@port:baud` connection string
/// (spec.md §6).
pub fn parse_connection_string(s: &str) -> Result<ConnectionTarget> {
    let (scheme, rest) = s.split_once('@').ok_or_else(|| {
        DppeError::InvalidParameterValue(format!(
            "'{s}' is not a valid connection string (expected sf@host:port or serial@port:baud)"
        ))
    })?;
    let (left, right) = rest.rsplit_once(':').ok_or_else(|| {
        DppeError::InvalidParameterValue(format!("'{s}' is missing a ':' separator"))
    })?;
    match scheme {
        "sf" => {
            let port: u16 = right.parse().map_err(|e| {
                DppeError::InvalidParameterValue(format!("'{right}' is not a valid port: {e}"))
            })?;
            Ok(ConnectionTarget::SerialForwarder {
                host: left.to_string(),
                port,
            })
        }
        "serial" => {
            let baud: u32 = right.parse().map_err(|e| {
                DppeError::InvalidParameterValue(format!("'{right}' is not a valid baud rate: {e}"))
            })?;
            Ok(ConnectionTarget::Serial {
                port: left.to_string(),
                baud,
            })
        }
        other => Err(DppeError::InvalidParameterValue(format!(
            "unknown connection scheme '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial_forwarder() {
        assert_eq!(
            parse_connection_string("sf@localhost:9002").unwrap(),
            ConnectionTarget::SerialForwarder {
                host: "localhost".into(),
                port: 9002
            }
        );
    }

    #[test]
    fn parses_serial() {
        assert_eq!(
            parse_connection_string("serial@/dev/ttyUSB0:115200").unwrap(),
            ConnectionTarget::Serial {
                port: "/dev/ttyUSB0".into(),
                baud: 115200
            }
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_connection_string("udp@host:1").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_connection_string("sf@localhost").is_err());
    }
}
