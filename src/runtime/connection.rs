//! Connection state machine and I/O pumps.
//!
//! Each connection moves through `Idle -> Connected -> Closing -> Closed`.
//! While started it runs two tokio tasks:
//!
//! - the receive pump reads into the connection's arena slice, feeds the
//!   `FrameCodec` and dispatches every completed frame;
//! - the send pump owns the socket's write half. It drains the send queue
//!   into one ordered segment list, issues a single vectored write, trims
//!   whatever a short write left behind and retries until the list is empty.
//!   Being the only writer, it guarantees at most one outstanding write.
//!
//! `close()` publishes a watch signal both pumps select on, so in-flight I/O
//! is abandoned and the socket halves are dropped. Once both pumps have
//! exited a pooled connection resets itself to `Idle` under a new session
//! epoch and goes back to its pool.
//!
//! ## Locking
//!
//! `inner` guards state, queues, heartbeat and peer. No I/O is performed while
//! it is held: the pumps take short critical sections before and after each
//! socket call. The codec has its own lock so teardown can wait for an
//! in-progress `feed` without touching `inner`.

use crate::peer::{Peer, Session};
use crate::protocol::{FrameCodec, FrameError, Packet, PacketError, PacketType};
use crate::runtime::pool::ConnectionPool;
use crate::runtime::registry::ConnectionRegistry;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed or recycled, no socket attached.
    Idle,
    /// Socket attached, both pumps running.
    Connected,
    /// Graceful teardown requested; queued frames still drain.
    Closing,
    /// Terminal for the current session.
    Closed,
}

/// Why the receive pump gave up on a connection.
#[derive(Debug, Error)]
enum ReceiveError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("peer panicked while handling a message")]
    PeerPanicked,
}

/// Registry slot held by a registered connection.
struct Registration {
    registry: Weak<ConnectionRegistry>,
    key: usize,
}

/// State guarded by the connection lock.
struct Inner {
    state: ConnState,
    /// Bumped every time the connection is recycled.
    epoch: u64,
    peer: Option<Arc<dyn Peer>>,
    /// Frames waiting for the next drain.
    send_queue: VecDeque<Bytes>,
    /// Segments of the drain in flight; partially written ones are trimmed.
    sending: VecDeque<Bytes>,
    last_heartbeat: Instant,
    closed_tx: Option<watch::Sender<bool>>,
    /// Running pumps plus any close in progress; the pool gets the
    /// connection back when this drops to zero.
    holds: usize,
    registration: Option<Registration>,
    peer_addr: Option<SocketAddr>,
}

/// What the send pump should do next.
enum SendStep {
    Write(Vec<Bytes>),
    Wait,
    HalfClose,
    Stop,
}

/// One TCP session, pooled on the server side.
pub struct Connection {
    id: usize,
    buffer_size: usize,
    pool: Weak<ConnectionPool>,
    inner: Mutex<Inner>,
    codec: Mutex<FrameCodec>,
    /// Receive slice; lent to the receive pump while the connection runs.
    recv_buf: Mutex<Option<BytesMut>>,
    send_ready: Notify,
    /// Set while the connection is handed out by its pool.
    pub(crate) checked_out: AtomicBool,
    writes_in_flight: AtomicUsize,
    #[cfg(test)]
    max_writes_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Create a connection owned by `pool`, reading into `recv_buf`.
    pub(crate) fn pooled(id: usize, recv_buf: BytesMut, pool: Weak<ConnectionPool>) -> Self {
        let buffer_size = recv_buf.len();
        Self {
            id,
            buffer_size,
            pool,
            inner: Mutex::new(Inner {
                state: ConnState::Idle,
                epoch: 0,
                peer: None,
                send_queue: VecDeque::new(),
                sending: VecDeque::new(),
                last_heartbeat: Instant::now(),
                closed_tx: None,
                holds: 0,
                registration: None,
                peer_addr: None,
            }),
            codec: Mutex::new(FrameCodec::new(buffer_size)),
            recv_buf: Mutex::new(Some(recv_buf)),
            send_ready: Notify::new(),
            checked_out: AtomicBool::new(false),
            writes_in_flight: AtomicUsize::new(0),
            #[cfg(test)]
            max_writes_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a connection with its own receive buffer and no pool.
    pub fn standalone(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self::pooled(0, BytesMut::zeroed(buffer_size), Weak::new()))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn codec(&self) -> MutexGuard<'_, FrameCodec> {
        lock(&self.codec)
    }

    /// Pool index (0 for standalone connections).
    pub fn id(&self) -> usize {
        self.id
    }

    /// Configured buffer size, which is also the largest frame accepted.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn state(&self) -> ConnState {
        self.inner().state
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.inner().epoch
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner().peer_addr
    }

    /// Handle for the current session.
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self), self.epoch())
    }

    // Lifecycle

    /// Attach a TCP socket and start both pumps.
    ///
    /// Ignored (and the socket dropped) unless the connection is idle and
    /// still in session `epoch`.
    pub(crate) fn start(self: &Arc<Self>, epoch: u64, stream: TcpStream) -> bool {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        self.start_with_addr(epoch, reader, writer, peer_addr)
    }

    /// Start both pumps over arbitrary stream halves.
    pub fn start_io<R, W>(self: &Arc<Self>, reader: R, writer: W) -> bool
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let epoch = self.epoch();
        self.start_with_addr(epoch, reader, writer, None)
    }

    fn start_with_addr<R, W>(
        self: &Arc<Self>,
        epoch: u64,
        reader: R,
        writer: W,
        peer_addr: Option<SocketAddr>,
    ) -> bool
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_tx, closed_rx) = watch::channel(false);
        let recv_buf = {
            let mut inner = self.inner();
            if inner.state != ConnState::Idle || inner.epoch != epoch {
                debug!(conn_id = self.id, state = ?inner.state, "start ignored");
                return false;
            }
            let Some(recv_buf) = lock(&self.recv_buf).take() else {
                warn!(conn_id = self.id, "receive buffer missing, start refused");
                return false;
            };
            inner.state = ConnState::Connected;
            inner.last_heartbeat = Instant::now();
            inner.closed_tx = Some(closed_tx);
            inner.holds = 2;
            inner.peer_addr = peer_addr;
            recv_buf
        };

        debug!(conn_id = self.id, peer = ?peer_addr, "connection started");

        tokio::spawn(Arc::clone(self).receive_pump(
            Box::new(reader),
            recv_buf,
            closed_rx.clone(),
        ));
        tokio::spawn(Arc::clone(self).send_pump(Box::new(writer), closed_rx));
        true
    }

    /// Attach the application handler for session `epoch`.
    pub(crate) fn set_peer(&self, epoch: u64, peer: Arc<dyn Peer>) -> bool {
        let mut inner = self.inner();
        if inner.epoch != epoch || inner.state == ConnState::Closed {
            return false;
        }
        inner.peer = Some(peer);
        true
    }

    /// Begin a graceful close: `Connected -> Closing`.
    ///
    /// The peer is notified and detached. With `signal` set a
    /// `DisconnectSignal` frame is queued ahead of the transition; the send
    /// pump half-closes the socket once everything queued has been written.
    /// `epoch` of `None` applies to whatever session is current.
    pub(crate) fn disconnect(&self, epoch: Option<u64>, signal: bool) {
        let peer = {
            let mut inner = self.inner();
            if inner.state != ConnState::Connected || epoch.is_some_and(|e| e != inner.epoch) {
                return;
            }
            if signal {
                inner
                    .send_queue
                    .push_back(sealed(Packet::system(PacketType::DisconnectSignal)));
            }
            inner.state = ConnState::Closing;
            inner.peer.take()
        };

        debug!(conn_id = self.id, signal, "connection closing");
        self.send_ready.notify_one();

        if let Some(peer) = peer {
            notify_removed(self.id, peer);
        }
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Signals both pumps to drop the socket, waits for any in-progress frame
    /// reassembly, clears the send queue, leaves the registry and notifies the
    /// peer if `disconnect` has not already done so. The connection returns to
    /// its pool after both pumps have exited.
    pub fn close(self: &Arc<Self>) {
        self.close_session(None);
    }

    pub(crate) fn close_session(self: &Arc<Self>, epoch: Option<u64>) {
        let (peer, registration) = {
            let mut inner = self.inner();
            if inner.state == ConnState::Closed || epoch.is_some_and(|e| e != inner.epoch) {
                return;
            }
            // Keeps the connection out of the pool until teardown is done
            inner.holds += 1;
            inner.state = ConnState::Closed;
            if let Some(closed_tx) = inner.closed_tx.take() {
                let _ = closed_tx.send(true);
            }
            inner.send_queue.clear();
            inner.sending.clear();
            (inner.peer.take(), inner.registration.take())
        };

        self.codec().stop();

        if let Some(registration) = registration {
            if let Some(registry) = registration.registry.upgrade() {
                registry.remove_slot(registration.key, self);
            }
        }

        if let Some(peer) = peer {
            notify_removed(self.id, peer);
        }

        debug!(conn_id = self.id, "connection closed");
        self.release_hold();
    }

    /// Record the registry slot this connection occupies.
    pub(crate) fn set_registration(&self, registry: Weak<ConnectionRegistry>, key: usize) {
        self.inner().registration = Some(Registration { registry, key });
    }

    /// Called by each pump on exit and by `close_session` once teardown is
    /// done; the last holder out recycles the connection.
    fn release_hold(self: &Arc<Self>) {
        let last = {
            let mut inner = self.inner();
            inner.holds -= 1;
            inner.holds == 0
        };
        if last {
            self.recycle();
        }
    }

    /// Reset to `Idle` under a new epoch and hand back to the pool.
    fn recycle(self: &Arc<Self>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        {
            let mut inner = self.inner();
            inner.state = ConnState::Idle;
            inner.epoch += 1;
            inner.peer = None;
            inner.send_queue.clear();
            inner.sending.clear();
            inner.closed_tx = None;
            inner.registration = None;
            inner.peer_addr = None;
            inner.last_heartbeat = Instant::now();
        }
        self.codec().stop();

        pool.release(Arc::clone(self));
    }

    // Heartbeat

    /// Refresh the liveness timestamp. Ignored unless connected.
    pub fn refresh_heartbeat(&self) {
        let mut inner = self.inner();
        if inner.state == ConnState::Connected {
            inner.last_heartbeat = Instant::now();
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.inner().last_heartbeat
    }

    /// True if the last heartbeat is newer than `cutoff`.
    pub fn check_heartbeat(&self, cutoff: Instant) -> bool {
        self.inner().last_heartbeat > cutoff
    }

    // Send

    /// Queue a packet for session `epoch`. Dropped unless connected.
    pub(crate) fn send(&self, epoch: Option<u64>, mut packet: Packet) -> bool {
        let wake = {
            let mut inner = self.inner();
            if inner.state != ConnState::Connected || epoch.is_some_and(|e| e != inner.epoch) {
                return false;
            }
            packet.record_length();
            inner.send_queue.push_back(packet.into_frame());
            inner.sending.is_empty()
        };
        if wake {
            self.send_ready.notify_one();
        }
        true
    }

    /// Queue a payload-less system frame on the current session.
    pub(crate) fn send_system(&self, kind: PacketType) -> bool {
        self.send(None, Packet::system(kind))
    }

    fn next_send_step(&self) -> SendStep {
        let mut inner = self.inner();
        match inner.state {
            ConnState::Closed | ConnState::Idle => return SendStep::Stop,
            ConnState::Connected | ConnState::Closing => {}
        }

        if inner.sending.is_empty() && !inner.send_queue.is_empty() {
            let queued = std::mem::take(&mut inner.send_queue);
            inner.sending.extend(queued);
        }

        if !inner.sending.is_empty() {
            SendStep::Write(inner.sending.iter().cloned().collect())
        } else if inner.state == ConnState::Closing {
            SendStep::HalfClose
        } else {
            SendStep::Wait
        }
    }

    /// Account for `written` bytes of the in-flight segments.
    fn complete_send(&self, written: usize) {
        let mut inner = self.inner();
        let requested: usize = inner.sending.iter().map(Bytes::len).sum();
        if written < requested {
            trace!(conn_id = self.id, written, requested, "short write, retrying remainder");
        }

        let mut remaining = written;
        while remaining > 0 {
            let Some(front) = inner.sending.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                inner.sending.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
    }

    async fn write_segments(&self, writer: &mut BoxedWriter, segments: &[Bytes]) -> io::Result<usize> {
        let _guard = WriteGuard::enter(self);
        let slices: Vec<IoSlice<'_>> = segments.iter().map(|s| IoSlice::new(s)).collect();
        match writer.write_vectored(&slices).await {
            Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            other => other,
        }
    }

    async fn send_pump(self: Arc<Self>, mut writer: BoxedWriter, mut closed: watch::Receiver<bool>) {
        loop {
            match self.next_send_step() {
                SendStep::Write(segments) => {
                    let written = tokio::select! {
                        res = self.write_segments(&mut writer, &segments) => res,
                        _ = wait_closed(&mut closed) => break,
                    };
                    match written {
                        Ok(n) => self.complete_send(n),
                        Err(e) => {
                            debug!(conn_id = self.id, error = %e, "send failed");
                            self.close();
                            break;
                        }
                    }
                }
                SendStep::Wait => {
                    tokio::select! {
                        _ = self.send_ready.notified() => {}
                        _ = wait_closed(&mut closed) => break,
                    }
                }
                SendStep::HalfClose => {
                    tokio::select! {
                        res = writer.shutdown() => {
                            if let Err(e) = res {
                                debug!(conn_id = self.id, error = %e, "half-close failed");
                            }
                        }
                        _ = wait_closed(&mut closed) => break,
                    }
                    // Nothing more may be written; wait for the remote to finish.
                    wait_closed(&mut closed).await;
                    break;
                }
                SendStep::Stop => break,
            }
        }

        drop(writer);
        self.release_hold();
    }

    // Receive

    async fn receive_pump(
        self: Arc<Self>,
        mut reader: BoxedReader,
        mut buf: BytesMut,
        mut closed: watch::Receiver<bool>,
    ) {
        loop {
            let read = tokio::select! {
                res = reader.read(&mut buf[..]) => res,
                _ = wait_closed(&mut closed) => break,
            };

            match read {
                Ok(0) => {
                    debug!(conn_id = self.id, "connection closed by remote");
                    self.close();
                    break;
                }
                Ok(n) => {
                    if let Err(e) = self.on_bytes(&buf[..n]) {
                        warn!(conn_id = self.id, error = %e, "protocol error, closing");
                        self.close();
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "receive failed");
                    self.close();
                    break;
                }
            }
        }

        drop(reader);
        *lock(&self.recv_buf) = Some(buf);
        self.release_hold();
    }

    /// Reassemble `chunk` and dispatch completed frames in order.
    fn on_bytes(&self, chunk: &[u8]) -> Result<(), ReceiveError> {
        let mut frames = Vec::new();
        let fed = self.codec().feed(chunk, |frame| frames.push(frame));

        for frame in frames {
            self.dispatch(frame)?;
        }
        Ok(fed?)
    }

    fn dispatch(&self, frame: BytesMut) -> Result<(), ReceiveError> {
        let mut packet = Packet::from_frame(frame);
        let kind = packet.pop_packet_type()?;
        trace!(conn_id = self.id, ?kind, len = packet.capacity(), "frame received");

        match kind {
            PacketType::HeartbeatRequest => {
                self.refresh_heartbeat();
                self.send_system(PacketType::HeartbeatAck);
            }
            PacketType::HeartbeatAck => self.refresh_heartbeat(),
            PacketType::DisconnectSignal => self.disconnect(None, false),
            PacketType::UserMessage => {
                let peer = self.inner().peer.clone();
                if let Some(peer) = peer {
                    panic::catch_unwind(AssertUnwindSafe(|| peer.on_receive(packet)))
                        .map_err(|_| ReceiveError::PeerPanicked)?;
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn max_writes_in_flight(&self) -> usize {
        self.max_writes_in_flight.load(Ordering::SeqCst)
    }
}

/// Tracks the outstanding-write count for the duration of one write call.
struct WriteGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> WriteGuard<'a> {
    fn enter(conn: &'a Connection) -> Self {
        let prev = conn.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        debug_assert_eq!(prev, 0, "overlapping writes on connection {}", conn.id);
        #[cfg(test)]
        conn.max_writes_in_flight.fetch_max(prev + 1, Ordering::SeqCst);
        Self {
            in_flight: &conn.writes_in_flight,
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolve once `close()` has been published for this session.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

fn sealed(mut packet: Packet) -> Bytes {
    packet.record_length();
    packet.into_frame()
}

/// Run `on_removed`, swallowing a panic so teardown always completes.
fn notify_removed(conn_id: usize, peer: Arc<dyn Peer>) {
    if panic::catch_unwind(AssertUnwindSafe(|| peer.on_removed())).is_err() {
        warn!(conn_id, "peer panicked in on_removed, ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::mpsc;

    /// Peer that forwards everything it sees to a channel.
    struct ChannelPeer {
        messages: mpsc::UnboundedSender<String>,
        removed: Arc<AtomicUsize>,
    }

    impl Peer for ChannelPeer {
        fn on_receive(&self, mut packet: Packet) {
            let text = packet.pop_string().unwrap();
            let _ = self.messages.send(text);
        }

        fn on_removed(&self) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn attach_peer(conn: &Arc<Connection>) -> (mpsc::UnboundedReceiver<String>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let removed = Arc::new(AtomicUsize::new(0));
        let peer = Arc::new(ChannelPeer {
            messages: tx,
            removed: Arc::clone(&removed),
        });
        assert!(conn.session().set_peer(peer));
        (rx, removed)
    }

    /// Start `conn` over an in-memory pipe, returning the remote end.
    fn start_piped(conn: &Arc<Connection>, pipe_size: usize) -> DuplexStream {
        let (local, remote) = duplex(pipe_size);
        let (reader, writer) = tokio::io::split(local);
        assert!(conn.start_io(reader, writer));
        remote
    }

    fn user_frame(text: &str) -> Vec<u8> {
        let mut packet = Packet::user_message(256);
        packet.push_string(text);
        packet.record_length();
        packet.into_frame().to_vec()
    }

    async fn read_frames(remote: &mut DuplexStream, count: usize) -> Vec<BytesMut> {
        let mut codec = FrameCodec::new(1024);
        let mut frames = Vec::new();
        let mut buf = [0u8; 64];
        while frames.len() < count {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended after {} frames", frames.len());
            codec.feed(&buf[..n], |f| frames.push(f)).unwrap();
        }
        frames
    }

    async fn wait_for_state(conn: &Connection, state: ConnState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn test_heartbeat_request_gets_ack() {
        let conn = Connection::standalone(256);
        let mut remote = start_piped(&conn, 1024);

        remote.write_all(&[0x05, 0, 0, 0, 0x01]).await.unwrap();

        let mut reply = [0u8; 5];
        remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0, 0, 0, 0x02]);
    }

    #[tokio::test]
    async fn test_scripted_reader_heartbeat_then_eof() {
        let conn = Connection::standalone(64);
        let reader = tokio_test::io::Builder::new()
            .read(&[0x05, 0, 0])
            .read(&[0, 0x01])
            .wait(Duration::from_millis(50))
            .build();
        let (writer, mut remote) = duplex(64);
        assert!(conn.start_io(reader, writer));

        let mut reply = [0u8; 5];
        remote.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0, 0, 0, 0x02]);

        // The script ends after the wait, which reads as end-of-stream
        wait_for_state(&conn, ConnState::Closed).await;
    }

    #[tokio::test]
    async fn test_heartbeat_refresh() {
        let conn = Connection::standalone(256);
        let mut remote = start_piped(&conn, 1024);
        let started = conn.last_heartbeat();

        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(&[0x05, 0, 0, 0, 0x02]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while conn.last_heartbeat() == started {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat not refreshed");
        assert!(conn.check_heartbeat(started));
    }

    #[tokio::test]
    async fn test_user_messages_reach_peer_in_order() {
        let conn = Connection::standalone(256);
        let (mut messages, _) = attach_peer(&conn);
        let mut remote = start_piped(&conn, 1024);

        let mut stream = Vec::new();
        for i in 0..10 {
            stream.extend(user_frame(&format!("m{i}")));
        }
        // Deliver in awkward pieces
        for chunk in stream.chunks(3) {
            remote.write_all(chunk).await.unwrap();
        }

        for i in 0..10 {
            assert_eq!(messages.recv().await.unwrap(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn test_sends_are_fifo_and_single_flight() {
        let conn = Connection::standalone(256);
        // A tiny pipe forces short writes and pending writes
        let mut remote = start_piped(&conn, 7);

        let mut tasks = Vec::new();
        for t in 0..4 {
            let session = conn.session();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    let mut packet = session.packet();
                    packet.push_string(&format!("{t}:{i}"));
                    assert!(session.send(packet));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let frames = read_frames(&mut remote, 100).await;
        for task in tasks {
            task.await.unwrap();
        }

        // Per-sender order is preserved
        let mut next = [0usize; 4];
        for frame in frames {
            let mut packet = Packet::from_frame(frame);
            assert_eq!(packet.pop_packet_type(), Ok(PacketType::UserMessage));
            let text = packet.pop_string().unwrap();
            let (t, i) = text.split_once(':').unwrap();
            let (t, i): (usize, usize) = (t.parse().unwrap(), i.parse().unwrap());
            assert_eq!(i, next[t]);
            next[t] += 1;
        }
        assert_eq!(next, [25; 4]);
        assert_eq!(conn.max_writes_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_close_twice_notifies_once() {
        let conn = Connection::standalone(256);
        let (_messages, removed) = attach_peer(&conn);
        let _remote = start_piped(&conn, 1024);

        conn.close();
        conn.close();

        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_then_close_notifies_once() {
        let conn = Connection::standalone(256);
        let (_messages, removed) = attach_peer(&conn);
        let mut remote = start_piped(&conn, 1024);

        conn.session().disconnect();
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // The remote sees the signal followed by end-of-stream
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x05, 0, 0, 0, 0x03]);

        conn.close();
        conn.close();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_dropped_unless_connected() {
        let conn = Connection::standalone(256);
        let session = conn.session();
        assert!(!session.send(session.packet()));

        let _remote = start_piped(&conn, 1024);
        assert!(session.send(session.packet()));

        session.disconnect();
        assert!(!session.send(session.packet()));
    }

    #[tokio::test]
    async fn test_remote_disconnect_signal() {
        let conn = Connection::standalone(256);
        let (_messages, removed) = attach_peer(&conn);
        let mut remote = start_piped(&conn, 1024);

        remote.write_all(&[0x05, 0, 0, 0, 0x03]).await.unwrap();
        wait_for_state(&conn, ConnState::Closing).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // No signal is echoed back; the write side is simply half-closed
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        drop(remote);
        wait_for_state(&conn, ConnState::Closed).await;
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let conn = Connection::standalone(64);
        let (_messages, removed) = attach_peer(&conn);
        let mut remote = start_piped(&conn, 1024);

        remote.write_all(&[0xFF, 0, 0, 0, 0x04]).await.unwrap();
        wait_for_state(&conn, ConnState::Closed).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_connection() {
        let conn = Connection::standalone(64);
        let remote = start_piped(&conn, 1024);

        drop(remote);
        wait_for_state(&conn, ConnState::Closed).await;
    }

    #[tokio::test]
    async fn test_panicking_peer_does_not_block_teardown() {
        struct Grumpy;
        impl Peer for Grumpy {
            fn on_receive(&self, _packet: Packet) {}
            fn on_removed(&self) {
                panic!("boom");
            }
        }

        let conn = Connection::standalone(64);
        conn.session().set_peer(Arc::new(Grumpy));
        let _remote = start_piped(&conn, 1024);

        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_not_recycled_until_close_finishes() {
        use crate::runtime::BufferArena;

        /// Records what the pool looks like while teardown is still running.
        struct SlowRemoval {
            pool: Arc<ConnectionPool>,
            seen: mpsc::UnboundedSender<(usize, u64)>,
            conn: Arc<Connection>,
        }

        impl Peer for SlowRemoval {
            fn on_receive(&self, _packet: Packet) {}
            fn on_removed(&self) {
                // Long enough for both pumps to see the close and exit
                std::thread::sleep(Duration::from_millis(100));
                let _ = self.seen.send((self.pool.available(), self.conn.epoch()));
            }
        }

        let mut arena = BufferArena::allocate(64, 64);
        let pool = ConnectionPool::new(1, &mut arena).unwrap();
        let conn = pool.acquire().unwrap();
        let epoch = conn.epoch();

        let (tx, mut seen) = mpsc::unbounded_channel();
        conn.session().set_peer(Arc::new(SlowRemoval {
            pool: Arc::clone(&pool),
            seen: tx,
            conn: Arc::clone(&conn),
        }));
        let _remote = start_piped(&conn, 1024);

        conn.close();

        assert_eq!(seen.recv().await.unwrap(), (0, epoch));
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.available() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection not returned to the pool");
        assert_eq!(conn.epoch(), epoch + 1);
    }
}
