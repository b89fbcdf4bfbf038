//! A WebSocket server engine for Tokio: RFC 6455 handshake and framing,
//! a per-connection state machine, and a hook-based server supervisor.
//!
//! Hosts implement [`handler::Handler`] and hand it to a [`server::Server`];
//! the server accepts sockets, drives each through handshake and upgrade,
//! and dispatches messages to the handler as they arrive.

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handshake;
pub mod selector;
pub mod server;
