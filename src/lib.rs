//! framelink: a TCP connection framework.
//!
//! - Length-prefixed little-endian frames with four packet types
//! - Stream reassembly that survives arbitrary chunk boundaries
//! - Pooled connections whose receive buffers come from one arena
//! - Heartbeat requests and acks with lifetime-based eviction
//! - Server and client roles over one tokio-based connection runtime
//!
//! Applications implement [`Peer`] and talk through a [`Session`].

pub mod client;
pub mod config;
pub mod listener;
pub mod peer;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::{Client, ClientConfig, ClientError};
pub use peer::{Peer, Session};
pub use protocol::{Packet, PacketType};
pub use runtime::ConnState;
pub use server::{Server, ServerConfig, ServerError};
