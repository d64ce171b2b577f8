//! Registry of live connections and the heartbeat sweep.
//!
//! Slab-backed so insert and remove are O(1) and keys are reused. Each
//! registered connection remembers its key and removes itself on close. The
//! sweep closes connections whose last heartbeat is older than the configured
//! lifetime. Closing always happens outside the registry lock because close
//! re-enters the registry to deregister.

use super::connection::Connection;
use slab::Slab;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Set of connections subject to heartbeat expiry.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<Connection>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionRegistry {
    /// Create a registry with room for `capacity` connections before growing.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Slab::with_capacity(capacity)),
            sweep_task: Mutex::new(None),
        })
    }

    /// Add a connection. It removes itself when closed.
    pub fn register(self: &Arc<Self>, conn: &Arc<Connection>) -> usize {
        let key = lock(&self.connections).insert(Arc::clone(conn));
        conn.set_registration(Arc::downgrade(self), key);
        key
    }

    /// Remove `conn` if it still occupies `key`.
    pub(crate) fn remove_slot(&self, key: usize, conn: &Arc<Connection>) {
        let mut connections = lock(&self.connections);
        if connections
            .get(key)
            .is_some_and(|held| Arc::ptr_eq(held, conn))
        {
            connections.remove(key);
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    /// Close every connection whose heartbeat is older than `now - lifetime`.
    ///
    /// Returns the number of connections closed.
    pub fn sweep(&self, now: Instant, lifetime: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(lifetime) else {
            return 0;
        };

        let expired: Vec<Arc<Connection>> = lock(&self.connections)
            .iter()
            .filter(|(_, conn)| !conn.check_heartbeat(cutoff))
            .map(|(_, conn)| Arc::clone(conn))
            .collect();

        for conn in &expired {
            warn!(conn_id = conn.id(), peer = ?conn.peer_addr(), "heartbeat expired, closing");
            conn.close();
        }
        expired.len()
    }

    /// Run `sweep` every `interval` on the current runtime.
    ///
    /// Starting an already running sweep does nothing.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration, lifetime: Duration) {
        let mut task = lock(&self.sweep_task);
        if task.is_some() {
            return;
        }

        let registry = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let closed = registry.sweep(Instant::now(), lifetime);
                if closed > 0 {
                    info!(closed, remaining = registry.len(), "heartbeat sweep");
                }
            }
        }));
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat sweep started");
    }

    /// Stop the periodic sweep.
    pub fn stop_heartbeat(&self) {
        if let Some(task) = lock(&self.sweep_task).take() {
            task.abort();
        }
    }

    /// Close and remove every registered connection.
    pub fn close_all(&self) {
        loop {
            let next = {
                let mut connections = lock(&self.connections);
                let Some(key) = connections.iter().map(|(key, _)| key).next() else {
                    break;
                };
                connections.remove(key)
            };
            next.close();
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::ConnState;

    fn started(registry: &Arc<ConnectionRegistry>) -> (Arc<Connection>, tokio::io::DuplexStream) {
        let conn = Connection::standalone(64);
        let (local, remote) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(local);
        assert!(conn.start_io(reader, writer));
        registry.register(&conn);
        (conn, remote)
    }

    #[tokio::test]
    async fn test_register_and_close_deregisters() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = started(&registry);
        let (_b, _rb) = started(&registry);
        assert_eq!(registry.len(), 2);

        a.close();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired() {
        let registry = ConnectionRegistry::new(4);
        let (a, _ra) = started(&registry);
        let (b, _rb) = started(&registry);

        // Nothing is stale yet
        assert_eq!(registry.sweep(Instant::now(), Duration::from_secs(60)), 0);
        assert_eq!(registry.len(), 2);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.sweep(later, Duration::from_secs(60)), 2);

        assert!(registry.is_empty());
        assert_eq!(a.state(), ConnState::Closed);
        assert_eq!(b.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_refreshed_connection_survives() {
        let registry = ConnectionRegistry::new(4);
        let (fresh, _rf) = started(&registry);
        let (stale, _rs) = started(&registry);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fresh.refresh_heartbeat();
            registry.sweep(Instant::now(), Duration::from_millis(20));
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(fresh.state(), ConnState::Connected);
        assert_eq!(stale.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new(4);
        let conns: Vec<_> = (0..3).map(|_| started(&registry)).collect();

        registry.close_all();

        assert!(registry.is_empty());
        assert!(conns.iter().all(|(c, _)| c.state() == ConnState::Closed));
    }

    #[tokio::test]
    async fn test_periodic_sweep() {
        let registry = ConnectionRegistry::new(4);
        let (conn, _remote) = started(&registry);

        registry.start_heartbeat(Duration::from_millis(10), Duration::from_millis(0));
        registry.start_heartbeat(Duration::from_millis(10), Duration::from_millis(0));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweep did not run");
        assert_eq!(conn.state(), ConnState::Closed);

        registry.stop_heartbeat();
    }
}
