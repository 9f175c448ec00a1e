//! Oberon TFTP Library
//!
//! A small TFTP (RFC 1350) server for Project Oberon workstations and
//! emulators. Requests are served from a root directory; when that root
//! lives inside an `Oberon` tree, files are looked up from the root upwards
//! and finally in the shared `Lib` directory.
//!
//! # Features
//!
//! - **Transfers**: read and write requests in octet and netascii mode
//!   - Lock-step 512-byte blocks with retransmission on ack timeout
//!   - A hard deadline on every transfer
//!   - One dedicated UDP endpoint per transfer, many transfers at once
//!
//! - **Oberon resolution**: project files override library modules
//!
//! - **Safety**: requested names are confined to the served root and
//!   writes never overwrite an existing file
//!

pub mod error;
pub mod file_io;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod transfer;

pub use error::*;
pub use file_io::*;
pub use protocol::*;
pub use resolver::*;
pub use server::*;
pub use transfer::*;
