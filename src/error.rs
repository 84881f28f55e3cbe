//! Crate-wide error type.
//!
//! The original Go implementation discriminates errors by type-asserting
//! on a handful of private struct types (`ParameterError`,
//! `InvalidParameterValueError`, `ValueMismatchError`, `TimeoutError`) and
//! falls back to a generic `errors.New(...)` for anything else. We collapse
//! that into one tagged enum so callers match on `DppeError` directly
//! instead of downcasting.

use thiserror::Error;

/// Every way a DPPE operation, packet decode, or task file read can fail.
#[derive(Debug, Error)]
pub enum DppeError {
    /// No correlated reply arrived within the session timeout (and all
    /// retries were exhausted).
    #[error("timeout waiting for reply")]
    Timeout,

    /// The device reported that the named id or seqnum does not exist.
    #[error("parameter not found on device")]
    ParameterNotFound,

    /// The device rejected a `set` with EINVAL (error code 6).
    #[error("invalid value for parameter")]
    InvalidValue,

    /// A `set` succeeded but the device's returned value differs from what
    /// was requested.
    #[error("device applied a different value than requested: requested {requested:02x?}, actual {actual:02x?}")]
    ValueMismatch {
        /// Bytes that were sent in the `SetById`/`SetBySeqnum` request.
        requested: Vec<u8>,
        /// Bytes the device echoed back.
        actual: Vec<u8>,
    },

    /// The device reported some other error code for the parameter.
    #[error("device reported error code {0}")]
    DeviceError(u8),

    /// The transport was closed while an operation was in flight.
    #[error("transport closed")]
    TransportClosed,

    /// A received frame could not be decoded, or a frame to be sent
    /// violates the wire format (oversized id/value).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A value could not be parsed into, or formatted out of, its declared
    /// [`crate::types::ParameterType`].
    #[error("invalid parameter value: {0}")]
    InvalidParameterValue(String),

    /// A value decoded off the wire does not match the declared type's
    /// width; it is still rendered (as a decimal dump of the raw bytes)
    /// but flagged as malformed.
    #[error("malformed parameter value: {0}")]
    MalformedValue(String),

    /// The work-file is not valid six-column CSV, or a row fails
    /// validation (bad address, bad name, unknown type, ...).
    #[error("malformed work file: {0}")]
    MalformedWorkFile(String),

    /// Underlying I/O failure (opening/reading/writing files or the
    /// transport's byte stream).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding/decoding failure not otherwise classified as a
    /// work-file validation error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DppeError {
    /// Whether the caller should retry the request that produced this
    /// error. Only [`DppeError::Timeout`] is retryable; every other
    /// protocol-level error reflects a terminal device response.
    ///
    /// Replaces the Go source's `switch err.(type)` in `manager.go:GetValue`
    /// and `director.go:run` with a pure predicate (per spec.md §9's
    /// "error discrimination by runtime type" redesign note).
    pub fn retryable(&self) -> bool {
        matches!(self, DppeError::Timeout)
    }

    /// Whether this error should mark a [`crate::taskfile::DirectorTask`]
    /// as permanently blocked, as opposed to left pending for the next
    /// outer Director loop iteration.
    pub fn blocks_task(&self) -> bool {
        matches!(
            self,
            DppeError::ParameterNotFound
                | DppeError::InvalidValue
                | DppeError::ValueMismatch { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DppeError>;
