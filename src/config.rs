//! Server configuration (§3). A plain record the host constructs once and
//! hands to [`crate::server::Server`] — per §9's note on builder chains, the
//! fluent-setter/`readOnly*` pattern in the source collapses to ordinary
//! `pub` fields plus a `Default` impl.

use std::time::Duration;

/// Top-level server options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: String,
    pub bind_port: u16,
    /// A text payload whose receipt from a client triggers a clean close.
    pub disconnect_phrase: String,
    pub auto_ping: AutoPingOptions,
    pub messaging: MessagingOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            disconnect_phrase: "disconnect".to_string(),
            auto_ping: AutoPingOptions::default(),
            messaging: MessagingOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AutoPingOptions {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for AutoPingOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MessagingOptions {
    pub max_message_receive_bytes: usize,
    pub max_message_send_bytes: usize,
    pub max_frame_send_bytes: usize,
}

impl Default for MessagingOptions {
    fn default() -> Self {
        Self {
            max_message_receive_bytes: 32_768,
            max_message_send_bytes: 65_535,
            max_frame_send_bytes: 16_384,
        }
    }
}
