//! Polled TCP client holding at most one session.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;

use crate::config::TcpClientConfig;
use crate::error::{NetworkError, Result, TcpError};
use crate::logging::targets;
use crate::runner::EventLoopRunner;
use crate::session::Session;
use crate::state::TcpConnectionState;

/// State of one connect attempt, shared with its completion task.
///
/// A fresh request is created per attempt so a stale completion can never
/// touch a newer attempt.
#[derive(Debug, Default)]
struct ConnectRequest {
    state: TcpConnectionState,
    error: TcpError,
}

/// A connect attempt that has been set up but not yet spawned.
struct Attempt {
    handle: Handle,
    session: Arc<Session>,
    request: Arc<Mutex<ConnectRequest>>,
    /// Dropped by the attempt task once its socket is gone.
    released: std::sync::mpsc::Sender<()>,
}

/// A TCP client polled from the caller's loop.
///
/// `connect` starts an asynchronous attempt and returns immediately; its
/// outcome is observed later through [`is_connected`](Self::is_connected) and
/// [`error`](Self::error). Received bytes accumulate in the session's buffer
/// until read. Nothing here blocks except [`disconnect`](Self::disconnect),
/// which joins the I/O thread.
///
/// # Example
///
/// ```no_run
/// use std::net::Ipv4Addr;
/// use horizon_lattice_tcp::TcpClient;
///
/// let mut client = TcpClient::new();
/// client.connect(Ipv4Addr::LOCALHOST, 50000)?;
///
/// // Once per tick:
/// if client.is_connected() {
///     client.send(b"Hello, Server!");
///
///     let mut header = [0u8; 4];
///     if client.read(&mut header) {
///         // ...
///     }
/// } else if client.has_error() {
///     eprintln!("connection failed: {}", client.error());
/// }
/// # Ok::<(), horizon_lattice_tcp::NetworkError>(())
/// ```
pub struct TcpClient {
    config: TcpClientConfig,
    runner: Option<EventLoopRunner>,
    session: Option<Arc<Session>>,
    request: Arc<Mutex<ConnectRequest>>,
    attempt_released: Option<std::sync::mpsc::Receiver<()>>,
    port: u16,
}

impl TcpClient {
    /// Create a client with default configuration.
    pub fn new() -> Self {
        Self::with_config(TcpClientConfig::default())
    }

    /// Create a client with the given configuration.
    pub fn with_config(config: TcpClientConfig) -> Self {
        Self {
            config,
            runner: None,
            session: None,
            request: Arc::new(Mutex::new(ConnectRequest::default())),
            attempt_released: None,
            port: 0,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> TcpConnectionState {
        match self.request.lock().state {
            TcpConnectionState::Connected if !self.session_active() => {
                TcpConnectionState::Disconnected
            }
            state => state,
        }
    }

    /// Check if the connect attempt completed and the session is still open.
    pub fn is_connected(&self) -> bool {
        self.state() == TcpConnectionState::Connected
    }

    fn session_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    /// Start connecting to `address:port`.
    ///
    /// Returns once the attempt has been issued. Fails immediately if the
    /// client is connected or an attempt is already pending.
    pub fn connect(&mut self, address: Ipv4Addr, port: u16) -> Result<()> {
        let attempt = self.begin_attempt(port)?;
        let addr = SocketAddrV4::new(address, port);

        attempt.handle.spawn(Self::complete_connect(
            addr,
            attempt.session,
            attempt.request,
            self.config.socket.no_delay,
            attempt.released,
        ));

        tracing::debug!(target: targets::CLIENT, "Connecting to {}", addr);
        Ok(())
    }

    /// Install a fresh session and request in the `Connecting` state.
    fn begin_attempt(&mut self, port: u16) -> Result<Attempt> {
        match self.state() {
            TcpConnectionState::Connecting => return Err(NetworkError::ConnectPending),
            TcpConnectionState::Connected => return Err(NetworkError::AlreadyConnected),
            TcpConnectionState::Disconnected => {}
        }

        let runner = self
            .runner
            .get_or_insert_with(|| EventLoopRunner::new(self.config.runner.clone()));
        let handle = runner.start()?.clone();

        // A previous session that ended on its own is replaced.
        if let Some(old) = self.session.take() {
            old.close();
        }

        let session = Session::new(handle.clone(), &self.config.socket);
        let request = Arc::new(Mutex::new(ConnectRequest {
            state: TcpConnectionState::Connecting,
            error: TcpError::Ok,
        }));
        let (released, attempt_released) = std::sync::mpsc::channel();

        self.session = Some(session.clone());
        self.request = request.clone();
        self.attempt_released = Some(attempt_released);
        self.port = port;

        Ok(Attempt {
            handle,
            session,
            request,
            released,
        })
    }

    /// Runs on the event loop until the attempt completes or is cancelled.
    ///
    /// `_released` is dropped last, after the connecting socket.
    async fn complete_connect(
        addr: SocketAddrV4,
        session: Arc<Session>,
        request: Arc<Mutex<ConnectRequest>>,
        no_delay: bool,
        _released: std::sync::mpsc::Sender<()>,
    ) {
        let result = tokio::select! {
            _ = session.closed() => return,
            result = TcpStream::connect(addr) => result,
        };

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(no_delay) {
                    tracing::warn!(
                        target: targets::CLIENT,
                        "Failed to set TCP_NODELAY: {}",
                        e
                    );
                }

                let mut request = request.lock();
                if request.state != TcpConnectionState::Connecting {
                    return;
                }
                if session.init(0, stream) {
                    request.state = TcpConnectionState::Connected;
                    tracing::info!(target: targets::CLIENT, "Connected to {}", addr);
                } else {
                    request.state = TcpConnectionState::Disconnected;
                }
            }
            Err(e) => {
                let error = TcpError::from_connect_error(&e);
                tracing::error!(
                    target: targets::CLIENT,
                    "Failed to connect to {}: {}",
                    addr,
                    e
                );
                {
                    let mut request = request.lock();
                    if request.state == TcpConnectionState::Connecting {
                        request.state = TcpConnectionState::Disconnected;
                        request.error = error;
                    }
                }
                session.close();
            }
        }
    }

    /// Abandon a pending connect attempt.
    ///
    /// Returns once the half-open socket has been closed. Does nothing unless
    /// an attempt is pending.
    pub fn cancel_connect(&mut self) {
        {
            let mut request = self.request.lock();
            if request.state != TcpConnectionState::Connecting {
                return;
            }
            request.state = TcpConnectionState::Disconnected;
        }

        if let Some(session) = self.session.take() {
            session.close();
        }
        if let Some(released) = self.attempt_released.take() {
            let _ = released.recv();
        }
        tracing::warn!(target: targets::CLIENT, "Connect to port {} cancelled", self.port);
    }

    /// Close the connection and stop the I/O thread.
    ///
    /// Blocks until the thread exits. Afterwards the client is back in its
    /// initial state and the next `connect` starts a new thread.
    pub fn disconnect(&mut self) {
        self.cancel_connect();

        if let Some(session) = self.session.take() {
            session.close();
        }
        if let Some(mut runner) = self.runner.take() {
            runner.stop();
        }

        self.request = Arc::new(Mutex::new(ConnectRequest::default()));
        self.attempt_released = None;
        self.port = 0;
    }

    /// The port of the last connect target.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if a connect or transport error has been recorded.
    pub fn has_error(&self) -> bool {
        self.error().is_err()
    }

    /// The connect-time error if one occurred, else the session's error.
    pub fn error(&self) -> TcpError {
        let error = self.request.lock().error;
        if error.is_err() {
            return error;
        }
        self.session
            .as_ref()
            .map_or(TcpError::Ok, |session| session.error())
    }

    /// Number of received bytes not yet consumed.
    pub fn available(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.available())
    }

    /// Discard the first `size` received bytes.
    pub fn skip(&self, size: usize) -> bool {
        self.session.as_ref().is_some_and(|s| s.skip(size))
    }

    /// Copy the first `dst.len()` received bytes without consuming them.
    pub fn lookahead(&self, dst: &mut [u8]) -> bool {
        self.session.as_ref().is_some_and(|s| s.lookahead(dst))
    }

    /// Copy and consume the first `dst.len()` received bytes.
    pub fn read(&self, dst: &mut [u8]) -> bool {
        self.session.as_ref().is_some_and(|s| s.read(dst))
    }

    /// Queue bytes for sending.
    pub fn send(&self, data: &[u8]) -> bool {
        self.session.as_ref().is_some_and(|s| s.send(data))
    }

    /// Peek a plain-old-data value from the front of the receive buffer.
    pub fn lookahead_value<T: Pod>(&self) -> Option<T> {
        self.session.as_ref().and_then(|s| s.lookahead_value())
    }

    /// Read a plain-old-data value from the front of the receive buffer.
    pub fn read_value<T: Pod>(&self) -> Option<T> {
        self.session.as_ref().and_then(|s| s.read_value())
    }

    /// Queue the bytes of a plain-old-data value for sending.
    pub fn send_value<T: Pod>(&self, value: &T) -> bool {
        self.session.as_ref().is_some_and(|s| s.send_value(value))
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("port", &self.port)
            .field("state", &self.state())
            .field("error", &self.error())
            .finish()
    }
}
