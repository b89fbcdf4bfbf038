//! The host-supplied hook point (§6): connection lifecycle callbacks plus
//! the handshake-verification gate. Analogous to the teacher's `Event`
//! enum, but callback-shaped rather than stream-shaped, since §6 specifies
//! hooks, not an event stream, as the external interface.

use crate::connection::ConnectionHandle;
use crate::error::ErrorKind;
use crate::server::DisconnectReason;
use std::collections::HashMap;

/// Connection lifecycle hooks. All methods have a no-op default so a host
/// only implements the ones it cares about.
///
/// Hooks run on the owning connection's reader activity (§5): a hook that
/// blocks stalls that connection's reads until it returns.
pub trait Handler: Send + Sync + 'static {
    fn on_connected(&self, _conn: &ConnectionHandle) {}

    fn on_upgraded(&self, _conn: &ConnectionHandle) {}

    fn on_message(&self, _conn: &ConnectionHandle, _text: String) {}

    fn on_data(&self, _conn: &ConnectionHandle, _data: Vec<u8>) {}

    fn on_disconnected(
        &self,
        _conn: &ConnectionHandle,
        _reason: DisconnectReason,
        _error: Option<ErrorKind>,
    ) {
    }

    /// Consulted after the request parses as a well-formed `GET` upgrade
    /// but before the 101 response is written (§4.2). Defaults to accept.
    fn verify_handshake(&self, _headers: &HashMap<String, String>, _request: &str) -> bool {
        true
    }
}

/// A [`Handler`] that accepts every handshake and otherwise does nothing,
/// useful for demos and tests that only care about the wire protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}
