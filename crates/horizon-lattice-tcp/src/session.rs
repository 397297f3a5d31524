//! A single TCP connection shared between the caller and the I/O thread.
//!
//! A [`Session`] is reference-counted: the owning facade holds one `Arc`, and
//! every task running on the event loop (the receive loop, the in-flight
//! write, a pending connect) holds another. Both sides touch the receive
//! buffer and the send queue, so each is guarded by its own lock.
//!
//! # Receive path
//!
//! While active, the receive loop reads at least one byte at a time and
//! appends it to the tail of the receive buffer. If the unread total would
//! exceed the configured cap the session closes with
//! [`TcpError::NoBufferSpaceAvailable`].
//!
//! # Send path
//!
//! [`Session::send`] copies the caller's bytes into a chunk at the tail of the
//! send queue. When no write is in flight the write half is checked out of the
//! queue and a write task starts on the head chunk. Each completed chunk is
//! popped and the next one started, so at most one write is in flight and
//! bytes leave in call order. When the queue drains the write half is put back.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytemuck::Pod;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::config::TcpSocketConfig;
use crate::error::TcpError;
use crate::logging::targets;
use crate::state::SessionState;

/// Identifier of a server-side session.
///
/// Allocated from a per-server counter starting at 1. Zero is reserved and
/// never handed out; identifiers are never reused by the same server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a session ID from its raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One-shot cancellation flag that async tasks can wait on.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    /// Fire the signal. Returns `false` if it had already fired.
    pub(crate) fn fire(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub(crate) async fn fired(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
            if self.is_fired() {
                return;
            }
        }
    }
}

/// Outbound chunks and the write half they are written to.
struct SendQueue {
    chunks: VecDeque<Bytes>,
    /// `None` while a write is in flight or after close.
    writer: Option<OwnedWriteHalf>,
    in_flight: bool,
}

/// The live state of one TCP connection.
pub struct Session {
    id: AtomicU64,
    state: Mutex<SessionState>,
    error: Mutex<TcpError>,
    peer_addr: Mutex<Option<SocketAddr>>,
    close_signal: CloseSignal,
    received: Mutex<BytesMut>,
    sending: Mutex<SendQueue>,
    handle: Handle,
    read_buffer_size: usize,
    max_buffer_size: usize,
}

impl Session {
    /// Create a session in the `Created` state.
    ///
    /// `handle` is the event loop the session's I/O tasks are spawned on.
    pub(crate) fn new(handle: Handle, config: &TcpSocketConfig) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU64::new(0),
            state: Mutex::new(SessionState::Created),
            error: Mutex::new(TcpError::Ok),
            peer_addr: Mutex::new(None),
            close_signal: CloseSignal::default(),
            received: Mutex::new(BytesMut::new()),
            sending: Mutex::new(SendQueue {
                chunks: VecDeque::new(),
                writer: None,
                in_flight: false,
            }),
            handle,
            read_buffer_size: config.read_buffer_size.max(1),
            max_buffer_size: config.max_buffer_size,
        })
    }

    /// Activate the session on a connected stream and begin the receive path.
    ///
    /// Client sessions use id 0. Returns `false` if the session was closed
    /// before the attempt completed; a closed session never becomes active
    /// again and the stream is dropped.
    pub(crate) fn init(self: &Arc<Self>, id: u64, stream: TcpStream) -> bool {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                return false;
            }
            self.id.store(id, Ordering::Release);
            *self.peer_addr.lock() = peer_addr;
            self.sending.lock().writer = Some(writer);
            *state = SessionState::Active;
        }

        tracing::trace!(target: targets::SESSION, "Session [{}] created", id);
        self.handle.spawn(self.clone().receive_loop(reader));
        true
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut buffer = vec![0u8; self.read_buffer_size];

        loop {
            let result = tokio::select! {
                _ = self.close_signal.fired() => return,
                result = reader.read(&mut buffer) => result,
            };

            match result {
                Ok(0) => {
                    tracing::info!(
                        target: targets::SESSION,
                        "Session [{}]: EOF",
                        self.raw_id()
                    );
                    self.fail(TcpError::EoF);
                    return;
                }
                Ok(n) => {
                    if !self.append_received(&buffer[..n]) {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        target: targets::SESSION,
                        "Session [{}]: receive failed: {}",
                        self.raw_id(),
                        e
                    );
                    self.fail(TcpError::Error);
                    return;
                }
            }
        }
    }

    /// Append bytes to the receive buffer, closing on overflow.
    fn append_received(&self, data: &[u8]) -> bool {
        {
            let mut received = self.received.lock();
            if self.close_signal.is_fired() {
                return false;
            }
            if received.len() + data.len() <= self.max_buffer_size {
                received.extend_from_slice(data);
                return true;
            }
        }

        tracing::error!(
            target: targets::SESSION,
            "Session [{}]: receive exceeded the maximum buffer size ({} bytes)",
            self.raw_id(),
            self.max_buffer_size
        );
        self.fail(TcpError::NoBufferSpaceAvailable);
        false
    }

    async fn write_loop(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        loop {
            let chunk = {
                let mut queue = self.sending.lock();
                if self.close_signal.is_fired() {
                    return;
                }
                match queue.chunks.front() {
                    Some(chunk) => chunk.clone(),
                    None => {
                        queue.writer = Some(writer);
                        queue.in_flight = false;
                        return;
                    }
                }
            };

            let result = tokio::select! {
                _ = self.close_signal.fired() => return,
                result = writer.write_all(&chunk) => result,
            };

            if let Err(e) = result {
                tracing::error!(
                    target: targets::SESSION,
                    "Session [{}]: send failed: {}",
                    self.raw_id(),
                    e
                );
                self.fail(TcpError::Error);
                return;
            }

            let mut queue = self.sending.lock();
            if self.close_signal.is_fired() {
                return;
            }
            queue.chunks.pop_front();
            if queue.chunks.is_empty() {
                queue.writer = Some(writer);
                queue.in_flight = false;
                return;
            }
        }
    }

    /// Record a transport failure and close.
    fn fail(&self, error: TcpError) {
        {
            let mut current = self.error.lock();
            if current.is_ok() && !self.close_signal.is_fired() {
                *current = error;
            }
        }
        self.close();
    }

    /// Close the session.
    ///
    /// Cancels the pending read, write or connect, releases the socket and
    /// clears both buffers. Idempotent and safe to call from any thread.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.close_signal.fire();

        {
            let mut queue = self.sending.lock();
            queue.chunks.clear();
            queue.writer = None;
            queue.in_flight = false;
        }
        self.received.lock().clear();

        tracing::trace!(
            target: targets::SESSION,
            "Session [{}] closed",
            self.raw_id()
        );
    }

    /// Resolves once the session has been closed.
    pub(crate) async fn closed(&self) {
        self.close_signal.fired().await
    }

    fn raw_id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    /// The server-assigned ID, or `None` for client sessions and sessions that
    /// never became active.
    pub fn id(&self) -> Option<SessionId> {
        match self.raw_id() {
            0 => None,
            id => Some(SessionId(id)),
        }
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Check if the session is connected and not yet closed.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Get the first transport error recorded on this session.
    pub fn error(&self) -> TcpError {
        *self.error.lock()
    }

    /// Check if a transport error has been recorded.
    pub fn has_error(&self) -> bool {
        self.error().is_err()
    }

    /// Get the peer socket address once connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    /// Number of received bytes not yet consumed.
    pub fn available(&self) -> usize {
        if !self.is_active() {
            return 0;
        }
        self.received.lock().len()
    }

    /// Discard the first `size` buffered bytes.
    ///
    /// Fails without touching the buffer if fewer than `size` bytes are
    /// available.
    pub fn skip(&self, size: usize) -> bool {
        if !self.is_active() {
            return false;
        }
        if size == 0 {
            return true;
        }

        let mut received = self.received.lock();
        if received.len() < size {
            return false;
        }
        received.advance(size);
        true
    }

    /// Copy the first `dst.len()` buffered bytes into `dst` without consuming
    /// them.
    pub fn lookahead(&self, dst: &mut [u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        if dst.is_empty() {
            return true;
        }

        let received = self.received.lock();
        if received.len() < dst.len() {
            return false;
        }
        dst.copy_from_slice(&received[..dst.len()]);
        true
    }

    /// Copy the first `dst.len()` buffered bytes into `dst` and consume them.
    pub fn read(&self, dst: &mut [u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        if dst.is_empty() {
            return true;
        }

        let mut received = self.received.lock();
        if received.len() < dst.len() {
            return false;
        }
        dst.copy_from_slice(&received[..dst.len()]);
        received.advance(dst.len());
        true
    }

    /// Queue `data` for sending.
    ///
    /// Returns `false` if the session is not active. Success means the bytes
    /// were queued; transport failures surface later through
    /// [`error`](Self::error).
    pub fn send(self: &Arc<Self>, data: &[u8]) -> bool {
        if !self.is_active() {
            return false;
        }
        if data.is_empty() {
            return true;
        }

        let mut queue = self.sending.lock();
        if self.close_signal.is_fired() {
            return false;
        }
        queue.chunks.push_back(Bytes::copy_from_slice(data));

        if !queue.in_flight {
            match queue.writer.take() {
                Some(writer) => {
                    queue.in_flight = true;
                    self.handle.spawn(self.clone().write_loop(writer));
                }
                None => {
                    queue.chunks.clear();
                    return false;
                }
            }
        }
        true
    }

    /// Read a plain-old-data value from the front of the buffer without
    /// consuming it.
    pub fn lookahead_value<T: Pod>(&self) -> Option<T> {
        let mut value = T::zeroed();
        self.lookahead(bytemuck::bytes_of_mut(&mut value))
            .then_some(value)
    }

    /// Read and consume a plain-old-data value from the front of the buffer.
    pub fn read_value<T: Pod>(&self) -> Option<T> {
        let mut value = T::zeroed();
        self.read(bytemuck::bytes_of_mut(&mut value)).then_some(value)
    }

    /// Queue the bytes of a plain-old-data value for sending.
    pub fn send_value<T: Pod>(self: &Arc<Self>, value: &T) -> bool {
        self.send(bytemuck::bytes_of(value))
    }

    /// Number of chunks waiting to be written, including the one in flight.
    pub fn pending_chunks(&self) -> usize {
        self.sending.lock().chunks.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.raw_id())
            .field("state", &self.state())
            .field("error", &self.error())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    use crate::runner::{EventLoopConfig, EventLoopRunner};

    /// One end of a loopback pair registered with `handle`, plus the other end.
    fn loopback_stream(handle: &Handle) -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let local = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();

        let _guard = handle.enter();
        (TcpStream::from_std(local).unwrap(), peer)
    }

    /// A session activated on one end of a loopback pair, plus the other end.
    fn connected_session(
        runner: &mut EventLoopRunner,
        config: &TcpSocketConfig,
    ) -> (Arc<Session>, std::net::TcpStream) {
        let handle = runner.start().unwrap().clone();
        let (stream, peer) = loopback_stream(&handle);
        let session = Session::new(handle, config);
        assert!(session.init(1, stream));
        (session, peer)
    }

    fn fill(session: &Session, data: &[u8]) {
        session.received.lock().extend_from_slice(data);
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::new(7).to_string(), "session-7");
        assert_eq!(SessionId::new(7).as_u64(), 7);
    }

    #[test]
    fn test_lifecycle_moves_forward_only() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());
        assert!(session.is_active());
        assert_eq!(session.id(), Some(SessionId::new(1)));
        assert!(session.peer_addr().is_some());

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_active());
        assert!(!session.has_error());
    }

    #[test]
    fn test_closed_before_init_never_activates() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let handle = runner.start().unwrap().clone();
        let session = Session::new(handle.clone(), &TcpSocketConfig::default());
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.id(), None);

        session.close();
        let (stream, _peer) = loopback_stream(&handle);
        assert!(!session.init(1, stream));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.send(b"data"));
        assert_eq!(session.available(), 0);
    }

    #[test]
    fn test_buffer_operations() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());
        fill(&session, b"hello world");
        assert_eq!(session.available(), 11);

        let mut head = [0u8; 5];
        assert!(session.lookahead(&mut head));
        assert_eq!(&head, b"hello");
        assert_eq!(session.available(), 11);

        assert!(session.skip(6));
        assert_eq!(session.available(), 5);

        let mut rest = [0u8; 5];
        assert!(session.read(&mut rest));
        assert_eq!(&rest, b"world");
        assert_eq!(session.available(), 0);
    }

    #[test]
    fn test_oversized_requests_leave_buffer_untouched() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());
        fill(&session, b"abc");

        let mut dst = [0xAAu8; 4];
        assert!(!session.lookahead(&mut dst));
        assert!(!session.lookahead(&mut dst));
        assert!(!session.read(&mut dst));
        assert!(!session.skip(4));
        assert_eq!(dst, [0xAA; 4]);
        assert_eq!(&session.received.lock()[..], b"abc");
    }

    #[test]
    fn test_zero_length_requests() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let handle = runner.start().unwrap().clone();
        let created = Session::new(handle, &TcpSocketConfig::default());
        assert!(!created.skip(0));
        assert!(!created.read(&mut []));

        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());
        assert!(session.skip(0));
        assert!(session.lookahead(&mut []));
        assert!(session.read(&mut []));
        assert!(session.send(&[]));
        assert_eq!(session.pending_chunks(), 0);
    }

    #[test]
    fn test_typed_values() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());
        fill(&session, &0x1234_5678u32.to_ne_bytes());
        fill(&session, &[9u8]);

        assert_eq!(session.lookahead_value::<u32>(), Some(0x1234_5678));
        assert_eq!(session.read_value::<u32>(), Some(0x1234_5678));
        assert_eq!(session.read_value::<u16>(), None);
        assert_eq!(session.read_value::<u8>(), Some(9));
    }

    #[test]
    fn test_overflow_closes_session() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let config = TcpSocketConfig::new().max_buffer_size(8);
        let (session, _peer) = connected_session(&mut runner, &config);

        assert!(session.append_received(b"12345678"));
        assert_eq!(session.available(), 8);
        assert!(!session.append_received(b"9"));

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.error(), TcpError::NoBufferSpaceAvailable);
        assert_eq!(session.available(), 0);
    }

    #[test]
    fn test_first_error_wins() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());

        session.fail(TcpError::EoF);
        session.fail(TcpError::Error);
        assert_eq!(session.error(), TcpError::EoF);
    }

    #[test]
    fn test_receive_and_send_over_loopback() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, mut peer) = connected_session(&mut runner, &TcpSocketConfig::default());

        peer.write_all(b"ping").unwrap();
        assert!(wait_until(|| session.available() == 4));

        assert!(session.send(b"po"));
        assert!(session.send(b"ng"));
        let mut reply = [0u8; 4];
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
        assert!(wait_until(|| session.pending_chunks() == 0));
    }

    #[test]
    fn test_peer_close_reports_eof() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, peer) = connected_session(&mut runner, &TcpSocketConfig::default());

        drop(peer);
        assert!(wait_until(|| !session.is_active()));
        assert_eq!(session.error(), TcpError::EoF);
    }

    #[test]
    fn test_stop_with_write_in_flight_releases_tasks() {
        let mut runner = EventLoopRunner::new(EventLoopConfig::default());
        let (session, _peer) = connected_session(&mut runner, &TcpSocketConfig::default());

        // The peer never reads, so the first chunk cannot finish writing.
        let payload = vec![0xA5u8; 24 * 1024 * 1024];
        assert!(session.send(&payload));
        assert!(session.send(&payload));
        std::thread::sleep(Duration::from_millis(50));
        assert!(session.pending_chunks() > 0);
        assert!(Arc::strong_count(&session) > 1);

        runner.stop();
        assert!(!runner.is_running());
        // The worker thread was joined and its runtime dropped every task
        // that held the session.
        assert_eq!(Arc::strong_count(&session), 1);

        session.close();
        assert_eq!(session.pending_chunks(), 0);
    }
}
