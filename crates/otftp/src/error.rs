//! Error types for the transfer engine
//!
//! [`PacketError`] is produced by the packet codec, [`TransferError`] explains
//! why a session stopped before completing and which ERROR packet (if any)
//! the peer is owed.

use std::io;

use thiserror::Error;

use crate::protocol::{Packet, TftpErrorCode};

/// Failure to decode a datagram
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Truncated datagram, unknown opcode or missing NUL terminator
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A well-formed request naming a mode other than netascii/octet
    #[error("unsupported transfer mode: {0}")]
    UnsupportedMode(String),
}

impl PacketError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Reason a transfer session was aborted
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file not found")]
    FileNotFound,

    #[error("access violation")]
    AccessViolation,

    #[error("file already exists")]
    FileAlreadyExists,

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    /// Retry budget exhausted without hearing from the peer
    #[error("no acknowledgment after {retries} retransmissions")]
    AckTimeoutExceeded { retries: u32 },

    /// Overall transfer deadline reached
    #[error("connection timed out")]
    ConnTimeoutExceeded,

    /// The peer terminated the transfer with an ERROR packet
    #[error("peer error {code}: {message}")]
    PeerError { code: u16, message: String },

    /// Local I/O failure after the file was opened
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Classify a failure to open a file for reading.
    pub fn from_read_open(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::AccessViolation,
        }
    }

    /// Classify a failure to exclusively create a file for writing.
    pub fn from_write_open(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AlreadyExists => Self::FileAlreadyExists,
            _ => Self::AccessViolation,
        }
    }

    /// The ERROR packet owed to the peer, `None` for silent aborts.
    pub fn error_packet(&self) -> Option<Packet> {
        let code = match self {
            Self::FileNotFound => TftpErrorCode::FileNotFound,
            Self::AccessViolation => TftpErrorCode::AccessViolation,
            Self::FileAlreadyExists => TftpErrorCode::FileAlreadyExists,
            Self::IllegalOperation(msg) => {
                return Some(Packet::error(TftpErrorCode::IllegalOperation, msg.clone()));
            }
            Self::Io(err) => return Some(Packet::error(TftpErrorCode::NotDefined, err.to_string())),
            Self::AckTimeoutExceeded { .. } | Self::ConnTimeoutExceeded | Self::PeerError { .. } => return None,
        };
        Some(Packet::error(code, code.default_message()))
    }
}
