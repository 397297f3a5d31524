//! Error types for the TCP transport.
//!
//! Two kinds of failure exist here. [`TcpError`] is the polled error state of a
//! session or client: it is recorded on the I/O thread and read back by the
//! caller, never returned from a call. [`NetworkError`] covers the synchronous
//! setup failures a facade can report directly (already connected, bind
//! failed, runtime could not be created).

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;

/// Polled error state of a TCP session or client.
#[derive(Error, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TcpError {
    /// No error has been recorded.
    #[default]
    #[error("no error")]
    Ok,
    /// The peer actively refused the connection attempt.
    #[error("connection refused")]
    ConnectionRefused,
    /// The peer closed the stream cleanly.
    #[error("end of stream")]
    EoF,
    /// Any other transport-level failure.
    #[error("transport error")]
    Error,
    /// The receive buffer exceeded its cap before the caller drained it.
    #[error("no buffer space available")]
    NoBufferSpaceAvailable,
}

impl TcpError {
    /// Returns `true` if this is [`TcpError::Ok`].
    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }

    /// Returns `true` if any error has been recorded.
    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }

    /// Classify a failed connect attempt.
    pub(crate) fn from_connect_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            _ => Self::Error,
        }
    }
}

/// Setup failures reported directly by the facades.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// `connect` was called while a session is established.
    #[error("client is already connected")]
    AlreadyConnected,
    /// `connect` was called while a previous attempt is still pending.
    #[error("a connection attempt is already pending")]
    ConnectPending,
    /// The event loop thread or its runtime could not be created.
    #[error("failed to start event loop: {0}")]
    Runtime(String),
    /// The acceptor could not be bound to the requested address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddrV4,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },
    /// Any other socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A specialized Result type for TCP facade operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
