//! Application boundary.
//!
//! Applications implement [`Peer`] to receive user messages and learn when a
//! connection goes away, and talk back through a [`Session`].
//!
//! A pooled connection is reused after it closes, so a `Session` is pinned to
//! the session epoch it was created in. Once the connection has been recycled
//! every call on an old handle is a no-op and `state()` reports `Closed`.

use crate::protocol::Packet;
use crate::runtime::{ConnState, Connection};
use std::net::SocketAddr;
use std::sync::Arc;

/// Receiver of connection events.
///
/// Both callbacks run on the connection's receive task (or on whichever task
/// closes it) and should not block. A panic in either is caught and treated
/// as a failure of that connection only.
pub trait Peer: Send + Sync {
    /// A `UserMessage` frame arrived; the cursor is past the type byte.
    fn on_receive(&self, packet: Packet);

    /// The connection is closing. Called exactly once per session.
    fn on_removed(&self);
}

/// Handle to one session of a connection.
#[derive(Clone)]
pub struct Session {
    conn: Arc<Connection>,
    epoch: u64,
}

impl Session {
    pub(crate) fn new(conn: Arc<Connection>, epoch: u64) -> Self {
        Self { conn, epoch }
    }

    /// Pool index of the underlying connection.
    pub fn id(&self) -> usize {
        self.conn.id()
    }

    /// Attach the handler for this session. Returns false if the session
    /// already ended.
    pub fn set_peer(&self, peer: Arc<dyn Peer>) -> bool {
        self.conn.set_peer(self.epoch, peer)
    }

    /// A fresh user-message packet sized to the connection's buffer.
    pub fn packet(&self) -> Packet {
        Packet::user_message(self.conn.buffer_size())
    }

    /// Seal and queue `packet`. Returns false (and drops it) unless the
    /// session is connected.
    pub fn send(&self, packet: Packet) -> bool {
        self.conn.send(Some(self.epoch), packet)
    }

    /// Send a disconnect signal and half-close once queued frames are out.
    pub fn disconnect(&self) {
        self.conn.disconnect(Some(self.epoch), true);
    }

    /// Tear the session down immediately.
    pub fn close(&self) {
        self.conn.close_session(Some(self.epoch));
    }

    pub fn state(&self) -> ConnState {
        if self.is_current() {
            self.conn.state()
        } else {
            ConnState::Closed
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// False once the connection has been recycled for another session.
    pub fn is_current(&self) -> bool {
        self.conn.epoch() == self.epoch
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        if self.is_current() {
            self.conn.peer_addr()
        } else {
            None
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.conn.id())
            .field("epoch", &self.epoch)
            .field("state", &self.state())
            .finish()
    }
}
