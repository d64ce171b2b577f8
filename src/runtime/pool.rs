//! Fixed-capacity pool of reusable connections.
//!
//! All connections are built up front, each with its own slice of the
//! receive arena. `acquire` hands one out; a connection returns itself via
//! `release` once its pumps have stopped, already reset to `Idle` under a new
//! session epoch. Exhaustion is reported, never papered over with a fresh
//! allocation.

use super::buffer::{ArenaError, BufferArena};
use super::connection::Connection;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{error, trace};

/// Error returned when no idle connection is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("connection pool exhausted: all {capacity} connections in use")]
    Exhausted { capacity: usize },
}

struct PoolInner {
    idle: Vec<Arc<Connection>>,
    checked_out: usize,
}

/// Pool of pre-built connections.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl ConnectionPool {
    /// Build `capacity` connections, each with a receive slice from `arena`.
    pub fn new(capacity: usize, arena: &mut BufferArena) -> Result<Arc<Self>, ArenaError> {
        let buffers = (0..capacity)
            .map(|_| arena.assign())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Arc::new_cyclic(|pool| {
            // Hand out low ids first
            let idle = buffers
                .into_iter()
                .enumerate()
                .rev()
                .map(|(id, buf)| Arc::new(Connection::pooled(id, buf, pool.clone())))
                .collect();
            Self {
                inner: Mutex::new(PoolInner {
                    idle,
                    checked_out: 0,
                }),
                capacity,
            }
        }))
    }

    fn inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle connection.
    pub fn acquire(&self) -> Result<Arc<Connection>, PoolError> {
        let mut inner = self.inner();
        let Some(conn) = inner.idle.pop() else {
            error!(capacity = self.capacity, "connection pool exhausted");
            return Err(PoolError::Exhausted {
                capacity: self.capacity,
            });
        };
        inner.checked_out += 1;
        conn.checked_out.store(true, Ordering::SeqCst);
        trace!(conn_id = conn.id(), "connection acquired");
        Ok(conn)
    }

    /// Return a connection. Releasing one that is not checked out is ignored.
    pub fn release(&self, conn: Arc<Connection>) {
        if !conn.checked_out.swap(false, Ordering::SeqCst) {
            return;
        }
        trace!(conn_id = conn.id(), "connection released");
        let mut inner = self.inner();
        inner.checked_out -= 1;
        inner.idle.push(conn);
    }

    /// Number of idle connections.
    pub fn available(&self) -> usize {
        self.inner().idle.len()
    }

    /// Number of connections currently handed out.
    pub fn checked_out(&self) -> usize {
        self.inner().checked_out
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
