//! Carriers: byte transports joining two interfaces.
//!
//! Any reliable, ordered, bidirectional byte stream works as a carrier;
//! `tokio::net::TcpStream` qualifies as-is. This module only provides the
//! in-memory variant used by tests and single-process setups.

use tokio::io::DuplexStream;

const MEMORY_LINK_CAPACITY: usize = 256 * 1024;

/// An in-memory full-duplex byte pipe. Hand one end to each interface.
pub fn memory_link() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(MEMORY_LINK_CAPACITY)
}
