#![warn(missing_docs)]
//! Device Parameter Protocol Engine (DPPE) and Fleet Director.
//!
//! This crate talks a small request/response protocol to embedded
//! network motes that expose a handful of named, typed "parameters"
//! (radio channel, transmit power, calibration constants, and so on).
//! [`session::DppeSession`] drives that protocol against one device at a
//! time; [`director::FleetDirector`] walks a durable, resumable queue of
//! such operations across many devices, persisting progress to a plain
//! CSV work file after every completed task.
//!
//! The packet transport itself — the serial-framed link or TCP forwarder
//! a real deployment dials into, with its own wire-framing and CRC — is
//! not this crate's concern. [`transport::Transport`] is the contract the
//! engine consumes; [`mock_transport::MockTransport`] (behind the
//! `test-util` feature) is the only concrete implementation shipped here,
//! used to drive the test suite without real hardware.

/// Crate-wide error type and the retry/block-task predicates built on it.
pub mod error;
/// Wire frame codec: the eight DPPE packet shapes.
pub mod packet;
/// Parameter type tags and the typed value codec.
pub mod types;
/// The contract the engine consumes from the underlying packet link.
pub mod transport;

/// In-memory `Transport` used by this crate's own tests. Exposed to
/// downstream crates under the same feature name tokio itself uses for
/// its mock clock and runtime scaffolding.
#[cfg(feature = "test-util")]
pub mod mock_transport;

/// The device parameter protocol engine, bound to one target at a time.
pub mod session;
/// Six-column CSV work-file codec with atomic, rename-based durability.
pub mod taskfile;
/// Fleet-wide task queue orchestration.
pub mod director;

pub use error::{DppeError, Result};
