//! Error types for callbridge.
//!
//! Every failure is reported per call: nothing here is fatal to the process.
//! [`ErrorDescriptor`] is the serializable failure shape carried in error
//! response frames and produced by the local invoker, so callers see the
//! same [`BridgeError`] variant whichever side ran the function.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correlation::CallId;

/// Main error type for all bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A remote call was issued with no usable connection and queuing disabled.
    #[error("not connected")]
    NotConnected,

    /// The outbound queue for calls made while disconnected is at capacity.
    #[error("outbound call queue is full")]
    QueueFull,

    /// An in-flight call was invalidated because the transport dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed or unrecognized wire payload.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value does not fit its declared schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The called function itself failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// A response referenced an id with no pending call. Logged, never
    /// delivered to a caller.
    #[error("no pending call for correlation id {0}")]
    UnknownCorrelation(CallId),

    /// No function with this name is registered on the executing side.
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// The endpoint cannot change while a connection is open or opening.
    #[error("endpoint cannot change while a connection is open")]
    EndpointLocked,

    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Protocol error (invalid frame, wrong flags, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An encoded payload is larger than the frame limit.
    #[error("payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: u32 },

    /// Two different record definitions share one tag.
    #[error("conflicting record definitions for tag {0}")]
    RecordConflict(String),

    /// The writer queue is saturated.
    #[error("writer queue is saturated")]
    Backpressure,

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// The process-wide bridge has not been installed yet.
    #[error("bridge is not initialized")]
    NotInitialized,

    /// The process-wide bridge was already installed.
    #[error("bridge is already initialized")]
    AlreadyInitialized,
}

impl From<rmp_serde::decode::Error> for BridgeError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        BridgeError::Decode(err.to_string())
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Category of a failure reported by the executing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The function ran and returned an error.
    Remote,
    /// No function with the requested name exists.
    UnknownFunction,
    /// The arguments could not be decoded.
    Decode,
    /// The arguments or result did not fit the declared schema.
    SchemaMismatch,
}

/// Failure outcome of a call, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure raised by the function body.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Remote, message)
    }

    /// Describe a bridge error raised while executing a call.
    ///
    /// Errors without a dedicated kind are reported as `Remote`.
    pub fn from_error(err: &BridgeError) -> Self {
        match err {
            BridgeError::UnknownFunction(name) => Self::new(ErrorKind::UnknownFunction, name),
            BridgeError::Decode(detail) => Self::new(ErrorKind::Decode, detail),
            BridgeError::SchemaMismatch(detail) => Self::new(ErrorKind::SchemaMismatch, detail),
            BridgeError::Remote(message) => Self::remote(message),
            other => Self::remote(other.to_string()),
        }
    }

    /// Convert into the error surfaced to the caller.
    pub fn into_error(self) -> BridgeError {
        match self.kind {
            ErrorKind::Remote => BridgeError::Remote(self.message),
            ErrorKind::UnknownFunction => BridgeError::UnknownFunction(self.message),
            ErrorKind::Decode => BridgeError::Decode(self.message),
            ErrorKind::SchemaMismatch => BridgeError::SchemaMismatch(self.message),
        }
    }
}
