//! State enums for sessions, clients and servers.

/// Lifecycle of a single TCP session.
///
/// Transitions only move forward: `Created -> Active -> Closed`, or
/// `Created -> Closed` when an attempt is cancelled or fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// A connect or accept attempt has been issued but not completed.
    Created,
    /// Connected; the receive path is running and sends are accepted.
    Active,
    /// Closed. Terminal.
    Closed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Active => write!(f, "Active"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Current state of a TCP client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpConnectionState {
    /// Not connected to any server.
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// The connect attempt completed.
    Connected,
}

impl Default for TcpConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for TcpConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// How a server's acceptor behaves after a successful accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptMode {
    /// Stop accepting after exactly one connection.
    Single,
    /// Re-arm after every connection until cancelled.
    Multi,
}

impl std::fmt::Display for AcceptMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "Single"),
            Self::Multi => write!(f, "Multi"),
        }
    }
}
