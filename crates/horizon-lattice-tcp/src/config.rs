//! Configuration types for TCP client and server.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::runner::EventLoopConfig;

/// Default cap on a session's receive buffer (32 MiB).
///
/// A session whose unread bytes would exceed this is closed with
/// [`TcpError::NoBufferSpaceAvailable`](crate::TcpError::NoBufferSpaceAvailable).
pub const MAX_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Socket-level options shared by client and server sessions.
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Size of the scratch buffer used by each read.
    pub read_buffer_size: usize,
    /// Cap on the number of unread bytes a session may hold.
    pub max_buffer_size: usize,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            no_delay: false,
            read_buffer_size: 8192,
            max_buffer_size: MAX_BUFFER_SIZE,
        }
    }
}

impl TcpSocketConfig {
    /// Create a new socket configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Set the read scratch buffer size. Clamped to at least one byte.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the receive buffer cap.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }
}

/// Configuration for a TCP client.
#[derive(Clone, Debug, Default)]
pub struct TcpClientConfig {
    /// Socket-level options.
    pub socket: TcpSocketConfig,
    /// Event loop thread options.
    pub runner: EventLoopConfig,
}

impl TcpClientConfig {
    /// Create a new client configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket options.
    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Set the receive buffer cap.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.socket.max_buffer_size = size;
        self
    }

    /// Set the event loop thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.runner.thread_name = name.into();
        self
    }
}

/// Configuration for a TCP server.
#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    /// The address to bind to.
    pub bind_address: Ipv4Addr,
    /// Socket-level options for accepted sessions.
    pub socket: TcpSocketConfig,
    /// Connection backlog size.
    pub backlog: u32,
    /// Event loop thread options.
    pub runner: EventLoopConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            socket: TcpSocketConfig::default(),
            backlog: 128,
            runner: EventLoopConfig::default(),
        }
    }
}

impl TcpServerConfig {
    /// Create a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to bind to.
    pub fn bind_address(mut self, address: Ipv4Addr) -> Self {
        self.bind_address = address;
        self
    }

    /// Set socket options for accepted sessions.
    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY for accepted sessions.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Set the receive buffer cap for accepted sessions.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.socket.max_buffer_size = size;
        self
    }

    /// Set the connection backlog size.
    pub fn backlog(mut self, size: u32) -> Self {
        self.backlog = size;
        self
    }

    /// Set the event loop thread name.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.runner.thread_name = name.into();
        self
    }

    /// The socket address the acceptor binds for `port`.
    pub fn bind_addr(&self, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, port)
    }
}
