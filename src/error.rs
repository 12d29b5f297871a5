//! Error types for the iSCSI protocol core

use thiserror::Error;

/// Errors produced by the PDU codec, connection state machine and task layer.
///
/// `ProtocolViolation` is always fatal to the current PDU and usually to the
/// connection. `DigestMismatch` is kept distinct because with
/// ErrorRecoveryLevel > 0 the caller may request retransmission instead of
/// dropping the connection. `UnsupportedOpcode` is recovered by emitting a
/// Reject PDU.
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("digest mismatch: expected 0x{expected:08x}, computed 0x{actual:08x}")]
    DigestMismatch { expected: u32, actual: u32 },

    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),

    #[error("session error: {0}")]
    Session(String),
}

impl IscsiError {
    /// Shorthand for a protocol violation carrying the offending field name.
    pub fn violation(msg: impl Into<String>) -> Self {
        IscsiError::ProtocolViolation(msg.into())
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, IscsiError>;
