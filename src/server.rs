//! Server-role service.
//!
//! Owns the receive arena, the connection pool, the registry with its
//! heartbeat sweep and the acceptor. Every accepted socket is paired with a
//! pooled connection on the accept loop, then handed off on a separate task:
//! announced to the application through the session-created callback,
//! registered and started.

use crate::config::ConfigError;
use crate::listener::Acceptor;
use crate::peer::Session;
use crate::protocol::MIN_FRAME_SIZE;
use crate::runtime::{ArenaError, BufferArena, Connection, ConnectionPool, ConnectionRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Callback fired for every new session.
pub type SessionHandler = Arc<dyn Fn(Session) + Send + Sync>;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("server has not been initialized")]
    NotInitialized,
}

/// Settings for a server-role service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    /// Pool size, i.e. the ceiling on concurrent connections.
    pub max_connections: usize,
    /// Receive buffer per connection; also the largest accepted frame.
    pub buffer_size: usize,
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are closed by the sweep.
    pub heartbeat_lifetime: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7000,
            backlog: 100,
            max_connections: 1000,
            buffer_size: 4096,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_lifetime: Duration::from_millis(60_000),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero".into()));
        }
        validate_connection(
            self.buffer_size,
            self.heartbeat_interval,
            self.heartbeat_lifetime,
        )
    }
}

/// Checks shared by the server and client settings.
pub(crate) fn validate_connection(
    buffer_size: usize,
    interval: Duration,
    lifetime: Duration,
) -> Result<(), ConfigError> {
    if buffer_size < MIN_FRAME_SIZE {
        return Err(ConfigError::Invalid(format!(
            "buffer_size {buffer_size} cannot hold a frame header and type byte"
        )));
    }
    if interval.is_zero() {
        return Err(ConfigError::Invalid("heartbeat interval must be non-zero".into()));
    }
    if lifetime.is_zero() {
        return Err(ConfigError::Invalid("heartbeat lifetime must be non-zero".into()));
    }
    Ok(())
}

/// Accepting side of the framework.
pub struct Server {
    config: ServerConfig,
    pool: OnceLock<Arc<ConnectionPool>>,
    registry: Arc<ConnectionRegistry>,
    acceptor: Arc<Acceptor>,
    on_session_created: Mutex<Option<SessionHandler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        Ok(Arc::new(Self {
            registry: ConnectionRegistry::new(config.max_connections),
            config,
            pool: OnceLock::new(),
            acceptor: Acceptor::new(),
            on_session_created: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Set the callback that receives each new session before it starts.
    ///
    /// The callback should attach a peer with `Session::set_peer`. Closing
    /// the session from inside the callback rejects the connection.
    pub fn on_session_created<F>(&self, handler: F)
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        *lock(&self.on_session_created) = Some(Arc::new(handler));
    }

    /// Allocate the receive arena and build the connection pool.
    ///
    /// Calling it again is a no-op.
    pub fn initialize(&self) -> Result<(), ServerError> {
        if self.pool.get().is_some() {
            return Ok(());
        }

        let total = self.config.max_connections * self.config.buffer_size;
        let mut arena = BufferArena::allocate(total, self.config.buffer_size);
        let pool = ConnectionPool::new(self.config.max_connections, &mut arena)?;

        if self.pool.set(pool).is_ok() {
            info!(
                max_connections = self.config.max_connections,
                buffer_size = self.config.buffer_size,
                arena_kb = total / 1024,
                "connection pool ready"
            );
        }
        Ok(())
    }

    /// Initialize if needed and listen with the configured settings.
    pub fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        self.initialize()?;
        let config = &self.config;
        self.listen(
            &config.host,
            config.port,
            config.backlog,
            config.heartbeat_interval,
            config.heartbeat_lifetime,
        )
    }

    /// Start accepting connections and the heartbeat sweep.
    ///
    /// Must be called within a tokio runtime after `initialize`. Returns the
    /// bound address.
    pub fn listen(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        backlog: u32,
        heartbeat_interval: Duration,
        heartbeat_lifetime: Duration,
    ) -> Result<SocketAddr, ServerError> {
        if self.pool.get().is_none() {
            return Err(ServerError::NotInitialized);
        }
        validate_connection(self.config.buffer_size, heartbeat_interval, heartbeat_lifetime)?;

        let server = Arc::downgrade(self);
        let addr = self.acceptor.start(host, port, backlog, move |stream, peer| {
            if let Some(server) = Weak::upgrade(&server) {
                server.on_accept(stream, peer);
            }
        })?;

        self.registry.start_heartbeat(heartbeat_interval, heartbeat_lifetime);
        info!(
            addr = %addr,
            heartbeat_interval_ms = heartbeat_interval.as_millis() as u64,
            heartbeat_lifetime_ms = heartbeat_lifetime.as_millis() as u64,
            "server listening"
        );
        Ok(addr)
    }

    /// Runs on the accept loop. Only pool admission happens inline; the
    /// application hand-off runs on its own task.
    fn on_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let Some(pool) = self.pool.get() else {
            return;
        };
        let conn = match pool.acquire() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "rejecting connection");
                return;
            }
        };

        let server = Arc::clone(self);
        tokio::spawn(async move { server.hand_off(conn, stream, peer) });
    }

    fn hand_off(&self, conn: Arc<Connection>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }

        let session = conn.session();
        let handler = lock(&self.on_session_created).clone();
        if let Some(handler) = handler {
            handler(session.clone());
        }
        if !session.is_current() {
            debug!(conn_id = conn.id(), peer = %peer, "session rejected by application");
            return;
        }

        self.registry.register(&conn);
        // `close` may have swept the registry before this registration
        if self.acceptor.is_closed() {
            session.close();
            return;
        }
        if !conn.start(session.epoch(), stream) {
            session.close();
        }
    }

    /// Address the acceptor is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Idle connections left in the pool.
    pub fn available(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.available())
    }

    /// Stop accepting, stop the sweep and close every connection.
    pub fn close(&self) {
        self.acceptor.close();
        self.registry.stop_heartbeat();
        self.registry.close_all();
        info!("server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;
    use crate::protocol::{FrameCodec, Packet, PacketType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Replies to every text message with its upper-cased form.
    struct Upper {
        session: Session,
        removed: Arc<AtomicUsize>,
    }

    impl Peer for Upper {
        fn on_receive(&self, mut packet: Packet) {
            let text = packet.pop_string().unwrap();
            let mut reply = self.session.packet();
            reply.push_string(&text.to_uppercase());
            self.session.send(reply);
        }

        fn on_removed(&self) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_config(max_connections: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            buffer_size: 256,
            ..ServerConfig::default()
        }
    }

    fn upper_server(max_connections: usize) -> (Arc<Server>, Arc<AtomicUsize>) {
        let server = Server::new(test_config(max_connections)).unwrap();
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removed);
        server.on_session_created(move |session| {
            let peer = Arc::new(Upper {
                session: session.clone(),
                removed: Arc::clone(&counter),
            });
            session.set_peer(peer);
        });
        (server, removed)
    }

    async fn read_frame(stream: &mut TcpStream) -> Packet {
        let mut codec = FrameCodec::new(256);
        let mut buf = [0u8; 64];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the stream");
            let mut frames = Vec::new();
            codec.feed(&buf[..n], |f| frames.push(f)).unwrap();
            if let Some(frame) = frames.pop() {
                return Packet::from_frame(frame);
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn test_config_validation() {
        assert!(ServerConfig::default().validate().is_ok());

        let zero = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));

        let tiny = ServerConfig {
            buffer_size: 4,
            ..ServerConfig::default()
        };
        assert!(tiny.validate().is_err());

        let no_lifetime = ServerConfig {
            heartbeat_lifetime: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(Server::new(no_lifetime).is_err());
    }

    #[tokio::test]
    async fn test_listen_requires_initialize() {
        let server = Server::new(test_config(1)).unwrap();
        let result = server.listen(
            "127.0.0.1",
            0,
            16,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(ServerError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_heartbeat_and_user_message() {
        let (server, removed) = upper_server(4);
        let addr = server.start().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0, 0, 0, 0x01]).await.unwrap();
        let mut ack = [0u8; 5];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0x05, 0, 0, 0, 0x02]);

        let mut packet = Packet::user_message(64);
        packet.push_string("hello");
        packet.record_length();
        stream.write_all(&packet.into_frame()).await.unwrap();

        let mut reply = read_frame(&mut stream).await;
        assert_eq!(reply.pop_packet_type(), Ok(PacketType::UserMessage));
        assert_eq!(reply.pop_string().unwrap(), "HELLO");

        drop(stream);
        wait_until(|| removed.load(Ordering::SeqCst) == 1).await;
        server.close();
    }

    #[tokio::test]
    async fn test_pool_recycles_across_sessions() {
        let (server, removed) = upper_server(2);
        let addr = server.start().unwrap();

        for round in 1..=5 {
            let a = TcpStream::connect(addr).await.unwrap();
            let b = TcpStream::connect(addr).await.unwrap();
            wait_until(|| server.connection_count() == 2).await;
            assert_eq!(server.available(), 0);

            drop(a);
            drop(b);
            wait_until(|| server.available() == 2).await;
            assert_eq!(server.connection_count(), 0);
            assert_eq!(removed.load(Ordering::SeqCst), round * 2);
        }

        server.close();
    }

    #[tokio::test]
    async fn test_connections_beyond_ceiling_are_dropped() {
        let (server, _) = upper_server(1);
        let addr = server.start().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_until(|| server.connection_count() == 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        server.close();
    }

    #[tokio::test]
    async fn test_close_tears_everything_down() {
        let (server, removed) = upper_server(4);
        let addr = server.start().unwrap();

        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_until(|| server.connection_count() == 3).await;

        server.close();
        server.close();

        assert_eq!(server.connection_count(), 0);
        assert_eq!(removed.load(Ordering::SeqCst), 3);
        wait_until(|| server.available() == 4).await;

        for mut stream in streams {
            let mut buf = [0u8; 8];
            assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_session_callback_does_not_stall_accepts() {
        use std::sync::atomic::AtomicBool;

        let server = Server::new(test_config(4)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let first_done = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        {
            let calls = Arc::clone(&calls);
            let first_done = Arc::clone(&first_done);
            let overlapped = Arc::clone(&overlapped);
            server.on_session_created(move |_session| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_millis(500));
                    first_done.store(true, Ordering::SeqCst);
                } else if !first_done.load(Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
            });
        }
        let addr = server.start().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;

        let _second = TcpStream::connect(addr).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
        assert!(overlapped.load(Ordering::SeqCst));

        wait_until(|| server.connection_count() == 2).await;
        server.close();
    }

    #[tokio::test]
    async fn test_application_can_reject_session() {
        let server = Server::new(test_config(1)).unwrap();
        server.on_session_created(|session| session.close());
        let addr = server.start().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.available(), 1);

        server.close();
    }
}
