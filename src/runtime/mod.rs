//! Connection runtime.
//!
//! - `BufferArena`: one allocation sliced into per-connection receive buffers
//! - `Connection`: state machine plus receive and send pumps
//! - `ConnectionPool`: fixed set of reusable connections
//! - `ConnectionRegistry`: live connections and heartbeat expiry

mod buffer;
mod connection;
mod pool;
mod registry;

pub use buffer::{ArenaError, BufferArena};
pub use connection::{ConnState, Connection};
pub use pool::{ConnectionPool, PoolError};
pub use registry::ConnectionRegistry;
