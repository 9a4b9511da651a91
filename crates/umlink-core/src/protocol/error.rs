//! Protocol errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read timed out")]
    ReadTimedOut,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Too much unhandled data received: {len} bytes buffered, limit is {max}")]
    OversizedBuffer { len: usize, max: usize },

    #[error("Invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Permanent connection fault.
///
/// Recorded at most once per connection. Unlike [`ProtocolError`] it is
/// `Clone` so every caller that hits the poisoned connection gets its own copy.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Too much unhandled data received: {len} bytes buffered, limit is {max}")]
    OversizedBuffer { len: usize, max: usize },
}

impl From<Fault> for ProtocolError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::WriteFailed(reason) => ProtocolError::WriteFailed(reason),
            Fault::ConnectionClosed => ProtocolError::ConnectionClosed,
            Fault::OversizedBuffer { len, max } => ProtocolError::OversizedBuffer { len, max },
        }
    }
}
