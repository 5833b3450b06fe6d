//! # tftpd - a concurrent TFTP server
//!
//! A server-side implementation of the Trivial File Transfer Protocol
//! (RFC 1350):
//!
//! * **Octet mode only**, fixed 512-byte blocks, no option negotiation
//! * **Stop-and-wait**: every DATA block is acknowledged before the next is sent
//! * **One task per transfer**, each on its own ephemeral UDP socket
//! * **Bounded retries**: an unresponsive client is presumed gone, never waited on forever
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tftpd::{MemoryStorage, ServerConfig, TftpServer};
//!
//! # async fn serve() -> Result<(), tftpd::TftpError> {
//! let storage = MemoryStorage::new();
//! storage.insert("pxelinux.0", b"boot image".to_vec());
//!
//! let config = ServerConfig {
//!     bind_addr: "127.0.0.1:6969".parse().unwrap(),
//!     ..ServerConfig::default()
//! };
//! let server = TftpServer::bind_with_storage(config, Arc::new(storage)).await?;
//! server.run().await
//! # }
//! ```
//!
//! ## Packet Overview
//!
//! Every packet starts with a 2-byte big-endian opcode:
//!
//! | Opcode | Name  | Layout after the opcode                   |
//! |--------|-------|-------------------------------------------|
//! | 1      | RRQ   | filename, `0x00`, mode, `0x00`            |
//! | 2      | WRQ   | filename, `0x00`, mode, `0x00`            |
//! | 3      | DATA  | block (2B BE), payload (0..=512 bytes)    |
//! | 4      | ACK   | block (2B BE)                             |
//! | 5      | ERROR | error code (2B BE), message, `0x00`       |
//!
//! A DATA payload shorter than 512 bytes ends the transfer. A file whose
//! length is a multiple of 512 therefore ends with an empty DATA block.
//!
//! ## Transfers
//!
//! A client is identified by its transfer ID (TID), the address and port
//! its request came from. The listener admits at most one transfer per TID
//! into the [`Registry`]; the transfer then runs as a [`Session`] that
//! talks to that TID alone and ignores datagrams from anyone else.

pub mod config;
pub mod packet;
pub mod registry;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;
pub mod udp;

// Re-export main types for convenience
pub use config::{ServerConfig, TransferPolicy};
pub use packet::Packet;
pub use registry::{Registration, Registry, SessionInfo};
pub use session::{Progress, Session, SessionState};
pub use storage::{ByteSource, DirStorage, MemoryStorage, Storage};
pub use transport::{LossyTransport, Transport};
pub use types::{
    ErrorCode, Opcode, Result, Role, TftpError, TransferId, BLOCK_SIZE, DEFAULT_PORT,
};
pub use udp::TftpServer;
