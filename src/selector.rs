//! Connection selectors for broadcast sends (§4.5).

use std::net::SocketAddr;

/// Picks which connections a [`crate::server::Server`] queue/ping operation
/// applies to. Resolved to a live snapshot at call time, so a connection
/// that disconnects mid-broadcast is simply absent from the next snapshot
/// rather than causing an error (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Every registered connection, regardless of handshake state.
    All,
    /// Only connections that have completed the handshake upgrade.
    AllUpgraded,
    /// One specific connection, identified by its remote address.
    Single(SocketAddr),
}
