//! Core TFTP types: opcodes, error codes, protocol constants and the crate error.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Fixed number of payload bytes carried by every non-terminal DATA packet.
pub const BLOCK_SIZE: usize = 512;

/// Opcode (2B) + block number (2B).
pub const DATA_HEADER_LEN: usize = 4;

/// Largest DATA packet on the wire.
pub const MAX_DATA_PACKET_LEN: usize = DATA_HEADER_LEN + BLOCK_SIZE;

/// Receive buffer size. Large enough to see (and reject) oversized packets.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Well-known server port from RFC 1350.
pub const DEFAULT_PORT: u16 = 69;

/// The only transfer mode this server speaks.
pub const OCTET_MODE: &str = "octet";

/// A transfer identity: the client's address and source port.
///
/// It stays constant for the whole transfer; datagrams from any other
/// address belong to someone else.
pub type TransferId = SocketAddr;

/// The five TFTP packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Read request (RRQ)
    ReadRequest = 1,
    /// Write request (WRQ)
    WriteRequest = 2,
    /// Data (DATA)
    Data = 3,
    /// Acknowledgement (ACK)
    Ack = 4,
    /// Error (ERROR)
    Error = 5,
}

impl Opcode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::ReadRequest),
            2 => Ok(Opcode::WriteRequest),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            other => Err(TftpError::UnknownOpcode(other)),
        }
    }
}

/// Error codes carried by ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Maps a wire value to a code. Values outside 0..=7 are treated as
    /// `NotDefined`; the accompanying message is all a peer can act on then.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }

    /// The RFC 1350 wording for this code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransferId => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.description())
    }
}

/// Which way the file flows, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The server reads a file and streams it out (RRQ).
    Sending,
    /// The server accepts a file being streamed in (WRQ).
    Receiving,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sending => f.write_str("sending"),
            Role::Receiving => f.write_str("receiving"),
        }
    }
}

/// Advance a block counter, refusing to wrap past 65535.
pub fn next_block(block: u16) -> Result<u16> {
    block
        .checked_add(1)
        .ok_or(TftpError::BlockOutOfRange(u32::from(block) + 1))
}

/// Errors produced by the TFTP server.
#[derive(Debug, Error)]
pub enum TftpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("packet truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("request field '{0}' is not NUL terminated")]
    MissingTerminator(&'static str),

    #[error("unsupported transfer mode '{0}'")]
    UnsupportedMode(String),

    #[error("request field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidText(&'static str),

    #[error("data payload of {0} bytes exceeds the block size")]
    PayloadTooLarge(usize),

    #[error("{0} contains an embedded NUL byte")]
    EmbeddedNul(&'static str),

    #[error("malformed {opcode:?} packet: {len} bytes")]
    BadLength { opcode: Opcode, len: usize },

    #[error("block number {0} exceeds 65535")]
    BlockOutOfRange(u32),

    #[error("ACK for block {acked} while block {expected} is in flight")]
    AckAhead { acked: u16, expected: u16 },

    #[error("DATA block {received} skips ahead of expected block {expected}")]
    BlockGap { received: u16, expected: u16 },

    #[error("no response for block {block} after {attempts} retransmissions")]
    RetriesExhausted {
        block: u16,
        attempts: u32,
        terminal: bool,
    },

    #[error("peer sent error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("transfer was aborted")]
    Aborted,
}

impl TftpError {
    /// Sequence violations that abort a session without a reply.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TftpError::AckAhead { .. } | TftpError::BlockGap { .. } | TftpError::BlockOutOfRange(_)
        )
    }

    /// The peer stopped answering and is assumed gone.
    pub fn is_presumed_dead(&self) -> bool {
        matches!(self, TftpError::RetriesExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_match_rfc() {
        for (raw, op) in [
            (1, Opcode::ReadRequest),
            (2, Opcode::WriteRequest),
            (3, Opcode::Data),
            (4, Opcode::Ack),
            (5, Opcode::Error),
        ] {
            assert_eq!(Opcode::from_u16(raw).unwrap(), op);
            assert_eq!(op.as_u16(), raw);
        }
        assert!(matches!(
            Opcode::from_u16(0),
            Err(TftpError::UnknownOpcode(0))
        ));
        assert!(matches!(
            Opcode::from_u16(6),
            Err(TftpError::UnknownOpcode(6))
        ));
    }

    #[test]
    fn unknown_error_codes_fold_to_not_defined() {
        assert_eq!(ErrorCode::from_u16(5), ErrorCode::UnknownTransferId);
        assert_eq!(ErrorCode::from_u16(8), ErrorCode::NotDefined);
        assert_eq!(ErrorCode::from_u16(u16::MAX), ErrorCode::NotDefined);
    }

    #[test]
    fn block_counter_refuses_to_wrap() {
        assert_eq!(next_block(0).unwrap(), 1);
        assert_eq!(next_block(65534).unwrap(), 65535);
        assert!(matches!(
            next_block(65535),
            Err(TftpError::BlockOutOfRange(65536))
        ));
    }

    #[test]
    fn error_classification() {
        assert!(TftpError::BlockGap {
            received: 3,
            expected: 1
        }
        .is_protocol_violation());
        assert!(TftpError::RetriesExhausted {
            block: 1,
            attempts: 20,
            terminal: false
        }
        .is_presumed_dead());
        assert!(!TftpError::UnknownOpcode(9).is_protocol_violation());
    }
}
