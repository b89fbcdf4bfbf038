use std::string::FromUtf8Error;
use thiserror::Error;

/// Reasons a connection is closed through the `Error` disconnect path.
///
/// Used only to pick a close code (§4.1) and as the payload handed to
/// [`crate::handler::Handler::on_disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HandlingException,
    MessageUnfinished,
    MessageTooLarge,
    MissingMask,
    StreamDisposed,
    UpgradeFail,
    WriteError,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("{source}")]
    Utf8 {
        #[from]
        source: FromUtf8Error,
    },

    #[error("RSV bits must be zero")]
    RsvNotZero,

    #[error("control frames must not be fragmented")]
    ControlFrameFragmented,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFramePayloadSize,

    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    #[error("encoding a frame marked as masked is a programmer error")]
    InvalidState,

    #[error("handshake request did not begin with GET")]
    NotAGetRequest,

    #[error("Sec-WebSocket-Key header missing from handshake request")]
    NoSecWebSocketKey,

    #[error("handshake rejected by verify_handshake hook")]
    HandshakeRejected,

    #[error("incomplete HTTP handshake request")]
    IncompleteHandshakeRequest,

    #[error("protocol violation: {0:?}")]
    Protocol(ErrorKind),

    // Precondition errors, per §7/§9 — programmer-misuse failures, modeled
    // as plain variants rather than exceptions. They never appear in a
    // close-code mapping.
    #[error("connection is already being driven by a handle() call")]
    AlreadyConnected,

    #[error("connection is not upgraded, cannot send or ping")]
    NotConnected,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("connection is not registered with this server")]
    NotInServer,
}

pub type Result<T> = std::result::Result<T, Error>;
