//! Client-role service.
//!
//! Holds one outbound connection. The connection's pumps run on their own
//! tasks; the client adds a caller-driven tick that sends a heartbeat request
//! once per interval and closes the connection itself when no heartbeat has
//! been seen for longer than the lifetime.

use crate::config::ConfigError;
use crate::peer::Session;
use crate::protocol::PacketType;
use crate::runtime::{ConnState, Connection};
use crate::server::{validate_connection, SessionHandler};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("client already has a live connection")]
    AlreadyConnected,
    #[error("connection closed before it started")]
    Aborted,
}

/// Settings for a client-role service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    /// How often `service()` sends a heartbeat request.
    pub heartbeat_interval: Duration,
    /// The client closes its connection after this long without a heartbeat.
    pub heartbeat_lifetime: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7000,
            buffer_size: 4096,
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_lifetime: Duration::from_millis(60_000),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_connection(
            self.buffer_size,
            self.heartbeat_interval,
            self.heartbeat_lifetime,
        )
    }
}

/// Connecting side of the framework.
pub struct Client {
    config: ClientConfig,
    conn: Mutex<Option<Arc<Connection>>>,
    on_connected: Mutex<Option<SessionHandler>>,
    last_request: Mutex<Option<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            conn: Mutex::new(None),
            on_connected: Mutex::new(None),
            last_request: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Set the callback fired once a connection is established, before its
    /// pumps start. It should attach a peer with `Session::set_peer`.
    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        *lock(&self.on_connected) = Some(Arc::new(handler));
    }

    /// Connect to the configured host and port.
    pub async fn start(&self) -> Result<Session, ClientError> {
        let config = &self.config;
        self.connect(&config.host, config.port).await
    }

    /// Open a connection to `host:port`.
    ///
    /// Fails with `AlreadyConnected` while a previous connection is still
    /// connected or closing.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Session, ClientError> {
        if self.is_live() {
            return Err(ClientError::AlreadyConnected);
        }

        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let conn = Connection::standalone(self.config.buffer_size);
        let session = conn.session();
        {
            let mut current = lock(&self.conn);
            if current
                .as_ref()
                .is_some_and(|c| matches!(c.state(), ConnState::Connected | ConnState::Closing))
            {
                return Err(ClientError::AlreadyConnected);
            }
            *current = Some(Arc::clone(&conn));
        }
        *lock(&self.last_request) = None;

        let handler = lock(&self.on_connected).clone();
        if let Some(handler) = handler {
            handler(session.clone());
        }

        if !conn.start(session.epoch(), stream) {
            return Err(ClientError::Aborted);
        }
        info!(host, port, "connected");
        Ok(session)
    }

    fn is_live(&self) -> bool {
        lock(&self.conn)
            .as_ref()
            .is_some_and(|c| matches!(c.state(), ConnState::Connected | ConnState::Closing))
    }

    /// Session for the current connection, if any.
    pub fn session(&self) -> Option<Session> {
        lock(&self.conn).as_ref().map(|c| c.session())
    }

    /// State of the current connection; `Closed` when there is none.
    pub fn state(&self) -> ConnState {
        lock(&self.conn)
            .as_ref()
            .map_or(ConnState::Closed, |c| c.state())
    }

    /// One heartbeat tick.
    ///
    /// Sends a `HeartbeatRequest` if connected and a full interval has
    /// passed since the last one, then closes the connection if the last
    /// heartbeat seen is older than the lifetime. The lifetime check runs in
    /// `Closing` too. Returns the resulting state.
    pub fn service(&self) -> ConnState {
        let Some(conn) = lock(&self.conn).clone() else {
            return ConnState::Closed;
        };
        let state = conn.state();
        if !matches!(state, ConnState::Connected | ConnState::Closing) {
            return state;
        }

        let now = Instant::now();
        if state == ConnState::Connected {
            let mut last_request = lock(&self.last_request);
            let due = last_request
                .map_or(true, |sent| now.duration_since(sent) >= self.config.heartbeat_interval);
            if due {
                conn.send_system(PacketType::HeartbeatRequest);
                *last_request = Some(now);
                debug!("heartbeat request sent");
            }
        }

        if let Some(cutoff) = now.checked_sub(self.config.heartbeat_lifetime) {
            if !conn.check_heartbeat(cutoff) {
                warn!(
                    lifetime_ms = self.config.heartbeat_lifetime.as_millis() as u64,
                    "no heartbeat within lifetime, closing"
                );
                conn.close();
            }
        }
        conn.state()
    }

    /// Drive `service()` every `tick` until the connection is closed.
    pub async fn run(&self, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.service() == ConnState::Closed {
                break;
            }
        }
        debug!("client tick loop stopped");
    }

    /// Ask the server to close gracefully.
    pub fn disconnect(&self) {
        if let Some(session) = self.session() {
            session.disconnect();
        }
    }

    /// Close the current connection immediately.
    pub fn close(&self) {
        if let Some(conn) = lock(&self.conn).clone() {
            conn.close();
        }
    }
}
