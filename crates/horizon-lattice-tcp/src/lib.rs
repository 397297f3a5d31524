//! Polled TCP transport for Horizon Lattice.
//!
//! This crate provides a raw byte-stream TCP client and server designed to be
//! driven from a single-threaded application loop:
//!
//! - **TcpClient**: One outgoing connection
//! - **TcpServer**: Single-shot or continuous accept, many sessions keyed by
//!   [`SessionId`]
//! - **Session**: One live connection with a capped receive buffer and an
//!   ordered send queue
//!
//! Each facade owns an [`EventLoopRunner`]: a dedicated I/O thread running a
//! Tokio runtime that executes every read, write, connect and accept
//! completion. The caller polls facade and session state once per tick and is
//! never blocked by I/O. Only `disconnect` blocks, while it joins the I/O
//! thread.
//!
//! # Client Example
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use horizon_lattice_tcp::{TcpClient, TcpError};
//!
//! let mut client = TcpClient::new();
//! client.connect(Ipv4Addr::LOCALHOST, 50000)?;
//!
//! loop {
//!     if client.is_connected() {
//!         client.send(b"ping");
//!         if let Some(value) = client.read_value::<u32>() {
//!             println!("received {value}");
//!         }
//!     }
//!     if client.error() == TcpError::ConnectionRefused {
//!         break;
//!     }
//!     # break;
//! }
//!
//! client.disconnect();
//! # Ok::<(), horizon_lattice_tcp::NetworkError>(())
//! ```
//!
//! # Server Example
//!
//! ```no_run
//! use horizon_lattice_tcp::{TcpServer, TcpServerConfig};
//!
//! let config = TcpServerConfig::new().no_delay(true).backlog(64);
//! let mut server = TcpServer::with_config(config);
//! server.start_accept_multi(50000)?;
//!
//! // Once per tick:
//! println!("{} sessions", server.num_sessions());
//! let mut byte = [0u8; 1];
//! if server.read(&mut byte, None) {
//!     server.send(&byte, None);
//! }
//! # Ok::<(), horizon_lattice_tcp::NetworkError>(())
//! ```
//!
//! # Errors
//!
//! Network conditions never surface as panics or `Err` from buffer calls.
//! They are recorded as a [`TcpError`] on the session (or on the client for
//! connect failures) and read back with `has_error` / `error`. Setup problems
//! that can be detected synchronously, such as a failed bind, are returned as
//! [`NetworkError`].

mod client;
mod config;
mod error;
pub mod logging;
mod runner;
mod server;
mod session;
mod state;

pub use client::TcpClient;
pub use config::{MAX_BUFFER_SIZE, TcpClientConfig, TcpServerConfig, TcpSocketConfig};
pub use error::{NetworkError, Result, TcpError};
pub use runner::{EventLoopConfig, EventLoopRunner};
pub use server::TcpServer;
pub use session::{Session, SessionId};
pub use state::{AcceptMode, SessionState, TcpConnectionState};
