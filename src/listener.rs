//! TCP acceptor.
//!
//! Binds a listening socket through socket2 so the backlog and address reuse
//! can be set explicitly, then runs an accept loop on the tokio runtime that
//! hands each accepted stream to a callback. Accept errors are logged and the
//! loop backs off briefly; after `close()` they are expected and ignored.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Callback invoked with every accepted connection.
///
/// Runs on the accept loop; the next accept waits for it to return.
pub type AcceptHandler = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Listening socket plus its accept loop.
pub struct Acceptor {
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    handler: Mutex<Option<AcceptHandler>>,
    local_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve `host:port`; `0.0.0.0` binds every interface.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for {host}:{port}"),
        )
    })
}

/// Create a non-blocking listener with SO_REUSEADDR and the given backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

impl Acceptor {
    pub fn new() -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            closed: AtomicBool::new(false),
            stop,
            handler: Mutex::new(None),
            local_addr: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Bind and start accepting. Must be called within a tokio runtime.
    ///
    /// Returns the bound address, which carries the real port when `port`
    /// is 0.
    pub fn start<F>(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        backlog: u32,
        handler: F,
    ) -> io::Result<SocketAddr>
    where
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "acceptor is closed"));
        }
        let mut task = lock(&self.task);
        if task.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "acceptor already started",
            ));
        }

        let addr = resolve(host, port)?;
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        let listener = TcpListener::from_std(create_listener(addr, backlog)?)?;
        let local_addr = listener.local_addr()?;

        *lock(&self.handler) = Some(Arc::new(handler));
        *lock(&self.local_addr) = Some(local_addr);
        *task = Some(tokio::spawn(Arc::clone(self).accept_loop(listener)));

        info!(addr = %local_addr, backlog, "listening");
        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.stop.subscribe();
        let mut backoff = MIN_BACKOFF;

        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    backoff = MIN_BACKOFF;
                    debug!(peer = %addr, "accepted connection");
                    let handler = lock(&self.handler).clone();
                    match handler {
                        Some(handler) => handler(stream, addr),
                        None => break,
                    }
                }
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "accept failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        debug!("accept loop stopped");
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting and release the listening socket. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.send_replace(true);
        lock(&self.handler).take();
        if let Some(task) = lock(&self.task).take() {
            // Dropping the listener inside the task closes the socket.
            task.abort();
        }
        info!("acceptor closed");
    }
}
