//! # VEIL Transport
//!
//! Transport layer for VEIL sessions.
//!
//! This crate provides:
//! - The `PacketConn` datagram abstraction, with UDP and in-memory backends
//! - Datagram framing (random nonce, CRC32) and whole-datagram encryption
//! - KCP-driven reliable sessions configured once from immutable parameters
//! - A listener demultiplexing one conn into many sessions
//!
//! The ARQ engine itself is the `kcp` crate; this crate drives its clock,
//! feeds it decoded segments and ships what it flushes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod dial;
pub mod listener;
pub mod memory;
pub mod params;
pub mod session;
pub mod transport;
pub mod udp_async;

pub use codec::DatagramCodec;
pub use dial::{dial, dial_with_conv, listen, resolve_addr, serve_conn};
pub use listener::Listener;
pub use memory::{MemoryNetwork, MemoryPacketConn};
pub use params::{FecShards, SessionParams};
pub use session::{Session, SessionStats};
pub use transport::{
    PacketConn, SharedConn, TransportError, TransportResult, TransportStats, Tuning, TuningReport,
};
pub use udp_async::UdpPacketConn;
