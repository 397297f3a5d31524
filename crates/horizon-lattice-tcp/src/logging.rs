//! Tracing targets used by the TCP transport.
//!
//! The crate never installs a subscriber. Use these with `tracing` directives
//! to filter logs by component, e.g. `horizon_lattice_tcp::session=trace`.

/// Target names for log filtering.
pub mod targets {
    /// Session lifecycle, receive and send paths.
    pub const SESSION: &str = "horizon_lattice_tcp::session";
    /// Client connect and disconnect.
    pub const CLIENT: &str = "horizon_lattice_tcp::client";
    /// Server accept loop and session table.
    pub const SERVER: &str = "horizon_lattice_tcp::server";
    /// Event loop thread start and stop.
    pub const RUNNER: &str = "horizon_lattice_tcp::runner";
}
