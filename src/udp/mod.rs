//! UDP front end: the well-known listener that admits transfers.

pub mod server;

pub use server::TftpServer;
