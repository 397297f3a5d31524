//! Polled TCP server holding a table of accepted sessions.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytemuck::Pod;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::{TcpServerConfig, TcpSocketConfig};
use crate::error::{NetworkError, Result, TcpError};
use crate::logging::targets;
use crate::runner::EventLoopRunner;
use crate::session::{CloseSignal, Session, SessionId};
use crate::state::AcceptMode;

type SessionEntry = (SessionId, Arc<Session>);

/// One accept loop, shared between the server and its task.
struct Acceptor {
    mode: AcceptMode,
    accepting: AtomicBool,
    cancel: CloseSignal,
}

/// Everything the accept task needs to build sessions.
struct AcceptContext {
    handle: Handle,
    socket: TcpSocketConfig,
    next_id: Arc<AtomicU64>,
    inbox: mpsc::UnboundedSender<SessionEntry>,
    error: Arc<Mutex<TcpError>>,
    /// Dropped once the listener has been closed.
    released: std::sync::mpsc::Sender<()>,
}

impl AcceptContext {
    fn record_failure(&self, e: &io::Error) {
        tracing::error!(target: targets::SERVER, "Accept failed: {}", e);
        *self.error.lock() = TcpError::Error;
    }
}

/// A TCP server polled from the caller's loop.
///
/// Accepted sessions are identified by [`SessionId`]s allocated from a counter
/// owned by this server: IDs start at 1 and are never reused, even across
/// [`disconnect`](Self::disconnect).
///
/// The session table belongs to the caller. Sessions accepted on the I/O
/// thread are handed over through an inbox and moved into the table, and
/// closed sessions are pruned, at the start of every query. There is no
/// background pruning.
///
/// Buffer operations take an optional session ID. `None` targets the first
/// session in the table, which is the oldest one still open; which session
/// that is can change between calls as sessions close.
///
/// # Example
///
/// ```no_run
/// use horizon_lattice_tcp::TcpServer;
///
/// let mut server = TcpServer::new();
/// server.start_accept_multi(50000)?;
///
/// // Once per tick:
/// for id in server.session_ids() {
///     let mut buf = [0u8; 16];
///     while server.read(&mut buf, Some(id)) {
///         server.send(&buf, Some(id));
///     }
/// }
/// # Ok::<(), horizon_lattice_tcp::NetworkError>(())
/// ```
pub struct TcpServer {
    config: TcpServerConfig,
    runner: Option<EventLoopRunner>,
    acceptor: Option<Arc<Acceptor>>,
    listener_released: Option<std::sync::mpsc::Receiver<()>>,
    accept_error: Arc<Mutex<TcpError>>,
    sessions: Vec<SessionEntry>,
    inbox_tx: mpsc::UnboundedSender<SessionEntry>,
    inbox_rx: mpsc::UnboundedReceiver<SessionEntry>,
    next_id: Arc<AtomicU64>,
    local_addr: Option<SocketAddrV4>,
}

impl TcpServer {
    /// Create a server with default configuration.
    pub fn new() -> Self {
        Self::with_config(TcpServerConfig::default())
    }

    /// Create a server with the given configuration.
    pub fn with_config(config: TcpServerConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            config,
            runner: None,
            acceptor: None,
            listener_released: None,
            accept_error: Arc::new(Mutex::new(TcpError::Ok)),
            sessions: Vec::new(),
            inbox_tx,
            inbox_rx,
            next_id: Arc::new(AtomicU64::new(0)),
            local_addr: None,
        }
    }

    /// Accept exactly one connection on `port`.
    pub fn start_accept(&mut self, port: u16) -> Result<()> {
        self.start_accept_with(port, AcceptMode::Single)
    }

    /// Keep accepting connections on `port` until cancelled.
    pub fn start_accept_multi(&mut self, port: u16) -> Result<()> {
        self.start_accept_with(port, AcceptMode::Multi)
    }

    fn start_accept_with(&mut self, port: u16, mode: AcceptMode) -> Result<()> {
        self.cancel_accept();

        let runner = self
            .runner
            .get_or_insert_with(|| EventLoopRunner::new(self.config.runner.clone()));
        let handle = runner.start()?.clone();

        let addr = self.config.bind_addr(port);
        let listener = {
            let _guard = handle.enter();
            Self::bind(addr, self.config.backlog)?
        };
        let local_addr = match listener.local_addr()? {
            SocketAddr::V4(local) => local,
            SocketAddr::V6(_) => addr,
        };

        let acceptor = Arc::new(Acceptor {
            mode,
            accepting: AtomicBool::new(true),
            cancel: CloseSignal::default(),
        });
        *self.accept_error.lock() = TcpError::Ok;
        let (released_tx, released_rx) = std::sync::mpsc::channel();
        let context = self.accept_context(handle.clone(), released_tx);
        handle.spawn(Self::accept_loop(listener, acceptor.clone(), context));

        tracing::info!(
            target: targets::SERVER,
            "Accepting on {} ({})",
            local_addr,
            mode
        );

        self.acceptor = Some(acceptor);
        self.listener_released = Some(released_rx);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    fn accept_context(
        &self,
        handle: Handle,
        released: std::sync::mpsc::Sender<()>,
    ) -> AcceptContext {
        AcceptContext {
            handle,
            socket: self.config.socket.clone(),
            next_id: self.next_id.clone(),
            inbox: self.inbox_tx.clone(),
            error: self.accept_error.clone(),
            released,
        }
    }

    fn bind(addr: SocketAddrV4, backlog: u32) -> Result<TcpListener> {
        let bind_error = |source| NetworkError::Bind { addr, source };

        let socket = TcpSocket::new_v4().map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(SocketAddr::V4(addr)).map_err(bind_error)?;
        socket.listen(backlog).map_err(bind_error)
    }

    /// Runs on the event loop until cancelled, failed, or (in single mode)
    /// one session has been accepted.
    async fn accept_loop(listener: TcpListener, acceptor: Arc<Acceptor>, context: AcceptContext) {
        let mut last = None;

        loop {
            let result = tokio::select! {
                _ = acceptor.cancel.fired() => break,
                result = listener.accept() => result,
            };

            match result {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(context.socket.no_delay) {
                        tracing::warn!(
                            target: targets::SERVER,
                            "Failed to set TCP_NODELAY: {}",
                            e
                        );
                    }

                    let id = context.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let session = Session::new(context.handle.clone(), &context.socket);
                    if !session.init(id, stream) {
                        continue;
                    }
                    tracing::info!(
                        target: targets::SERVER,
                        "Session [{}] accepted from {}",
                        id,
                        peer
                    );

                    let entry = (SessionId::new(id), session);
                    match acceptor.mode {
                        AcceptMode::Multi => {
                            let _ = context.inbox.send(entry);
                        }
                        AcceptMode::Single => {
                            last = Some(entry);
                            break;
                        }
                    }
                }
                Err(e) => {
                    context.record_failure(&e);
                    break;
                }
            }
        }

        // The acceptor socket is closed before the last session is handed
        // over, so once it shows up in the table no further connection can
        // be accepted.
        drop(listener);
        acceptor.accepting.store(false, Ordering::Release);
        let _ = context.released.send(());
        if let Some(entry) = last {
            let _ = context.inbox.send(entry);
        }
    }

    /// Stop accepting. Established sessions are not affected.
    ///
    /// Returns once the listening socket has been closed, so the port can be
    /// bound again immediately.
    pub fn cancel_accept(&mut self) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        acceptor.accepting.store(false, Ordering::Release);
        acceptor.cancel.fire();

        // Either an acknowledgement or a disconnect once the task is gone.
        if let Some(released) = self.listener_released.take() {
            let _ = released.recv();
        }
        tracing::debug!(target: targets::SERVER, "Accept cancelled");
    }

    /// Check if the acceptor is still waiting for connections.
    pub fn is_accepting(&self) -> bool {
        self.acceptor
            .as_ref()
            .is_some_and(|a| a.accepting.load(Ordering::Acquire))
    }

    /// Stop accepting, close every session and stop the I/O thread.
    ///
    /// Blocks until the thread exits.
    pub fn disconnect(&mut self) {
        self.cancel_accept();

        while let Ok((_, session)) = self.inbox_rx.try_recv() {
            session.close();
        }
        for (_, session) in self.sessions.drain(..) {
            session.close();
        }

        if let Some(mut runner) = self.runner.take() {
            runner.stop();
        }
        // Sessions accepted while the runner was shutting down.
        while let Ok((_, session)) = self.inbox_rx.try_recv() {
            session.close();
        }

        self.listener_released = None;
        *self.accept_error.lock() = TcpError::Ok;
        self.local_addr = None;
    }

    /// Check if the last accept loop stopped because of an error.
    pub fn has_error(&self) -> bool {
        self.error().is_err()
    }

    /// The error that stopped the last accept loop, if any.
    ///
    /// Cleared by the next `start_accept*` and by `disconnect`.
    pub fn error(&self) -> TcpError {
        *self.accept_error.lock()
    }

    /// Move newly accepted sessions into the table and prune closed ones.
    fn update_session(&mut self) {
        while let Ok(entry) = self.inbox_rx.try_recv() {
            self.sessions.push(entry);
        }

        self.sessions.retain(|(id, session)| {
            let active = session.is_active();
            if !active {
                tracing::debug!(target: targets::SERVER, "Pruned {}", id);
            }
            active
        });
    }

    fn find(&mut self, id: Option<SessionId>) -> Option<&Arc<Session>> {
        self.update_session();
        let entry = match id {
            None => self.sessions.first(),
            Some(id) => self.sessions.iter().find(|(sid, _)| *sid == id),
        };
        entry.map(|(_, session)| session)
    }

    /// Check if any session is open.
    pub fn has_session(&mut self) -> bool {
        self.update_session();
        !self.sessions.is_empty()
    }

    /// Check if the session with `id` is open.
    pub fn has_session_id(&mut self, id: SessionId) -> bool {
        self.find(Some(id)).is_some()
    }

    /// Number of open sessions.
    pub fn num_sessions(&mut self) -> usize {
        self.update_session();
        self.sessions.len()
    }

    /// IDs of open sessions in acceptance order.
    pub fn session_ids(&mut self) -> Vec<SessionId> {
        self.update_session();
        self.sessions.iter().map(|(id, _)| *id).collect()
    }

    /// Get a shared handle to a session.
    ///
    /// The handle stays valid after the session closes and is pruned, so its
    /// [`error`](Session::error) can still be read.
    pub fn session(&mut self, id: Option<SessionId>) -> Option<Arc<Session>> {
        self.find(id).cloned()
    }

    /// Close one session. Returns `false` if no such session is open.
    pub fn disconnect_session(&mut self, id: SessionId) -> bool {
        let Some(session) = self.find(Some(id)).cloned() else {
            return false;
        };
        session.close();
        self.update_session();
        true
    }

    /// The port the acceptor is bound to, or 0 if never started.
    pub fn port(&self) -> u16 {
        self.local_addr.map_or(0, |addr| addr.port())
    }

    /// The address the acceptor is bound to.
    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.local_addr
    }

    /// Number of received bytes not yet consumed on a session.
    pub fn available(&mut self, id: Option<SessionId>) -> usize {
        self.find(id).map_or(0, |s| s.available())
    }

    /// Discard the first `size` received bytes of a session.
    pub fn skip(&mut self, size: usize, id: Option<SessionId>) -> bool {
        self.find(id).is_some_and(|s| s.skip(size))
    }

    /// Copy the first `dst.len()` received bytes of a session without
    /// consuming them.
    pub fn lookahead(&mut self, dst: &mut [u8], id: Option<SessionId>) -> bool {
        self.find(id).is_some_and(|s| s.lookahead(dst))
    }

    /// Copy and consume the first `dst.len()` received bytes of a session.
    pub fn read(&mut self, dst: &mut [u8], id: Option<SessionId>) -> bool {
        self.find(id).is_some_and(|s| s.read(dst))
    }

    /// Queue bytes for sending on a session.
    pub fn send(&mut self, data: &[u8], id: Option<SessionId>) -> bool {
        self.find(id).is_some_and(|s| s.send(data))
    }

    /// Peek a plain-old-data value from a session's receive buffer.
    pub fn lookahead_value<T: Pod>(&mut self, id: Option<SessionId>) -> Option<T> {
        self.find(id).and_then(|s| s.lookahead_value())
    }

    /// Read a plain-old-data value from a session's receive buffer.
    pub fn read_value<T: Pod>(&mut self, id: Option<SessionId>) -> Option<T> {
        self.find(id).and_then(|s| s.read_value())
    }

    /// Queue the bytes of a plain-old-data value on a session.
    pub fn send_value<T: Pod>(&mut self, value: &T, id: Option<SessionId>) -> bool {
        self.find(id).is_some_and(|s| s.send_value(value))
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("accepting", &self.is_accepting())
            .field("error", &self.error())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
