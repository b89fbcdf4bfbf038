//! The server supervisor (§4.4): owns the listening socket, the registry of
//! live connections, and cooperative shutdown.

use crate::config::ServerOptions;
use crate::connection::{self, ConnectionHandle, ConnectionState};
use crate::error::{Error, ErrorKind, Result};
use crate::handler::Handler;
use crate::selector::Selector;
use log::{error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Why a connection closed (§3), carried through to
/// [`crate::handler::Handler::on_disconnected`] and used to pick a close
/// code (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    None,
    Requested,
    ServerShutdown,
    Timeout,
    Error(Option<ErrorKind>),
}

type Registry = Arc<Mutex<HashMap<SocketAddr, Arc<ConnectionHandle>>>>;

/// The server supervisor. Generic over the host's [`Handler`] so hook calls
/// dispatch statically rather than through a trait object per connection.
pub struct Server<H: Handler> {
    options: ServerOptions,
    handler: Arc<H>,
    running: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Registry,
}

impl<H: Handler> Server<H> {
    pub fn new(options: ServerOptions, handler: H) -> Self {
        Self {
            options,
            handler: Arc::new(handler),
            running: AtomicBool::new(false),
            accept_task: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binds the configured address and spawns the accept loop. Fails with
    /// `AlreadyRunning` if already started (§4.4).
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let bind_addr = format!("{}:{}", self.options.bind_address, self.options.bind_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("listening on {}", listener.local_addr()?);

        let options = self.options.clone();
        let handler: Arc<dyn Handler> = self.handler.clone();
        let connections = self.connections.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        let conn = match connection::spawn(
                            remote_addr,
                            stream,
                            handler.clone(),
                            options.clone(),
                        ) {
                            Ok(conn) => conn,
                            Err(err) => {
                                warn!("{remote_addr}: failed to spawn connection: {err}");
                                continue;
                            }
                        };

                        info!("{remote_addr}: accepted");
                        connections.lock().await.insert(remote_addr, conn.clone());

                        let watch_connections = connections.clone();
                        let watch_conn = conn;
                        tokio::spawn(async move {
                            watch_conn.closed().await;
                            watch_connections.lock().await.remove(&remote_addr);
                        });
                    }
                    Err(err) => {
                        error!("accept failed: {err}");
                    }
                }
            }
        });

        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Cooperative shutdown (§4.4, §8 shutdown liveness): stops accepting
    /// new connections and disconnects every live peer with
    /// `ServerShutdown`, waiting for each to finish closing.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }
        info!("stopping");

        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }

        let registered: Vec<Arc<ConnectionHandle>> = {
            let mut guard = self.connections.lock().await;
            guard.drain().map(|(_, conn)| conn).collect()
        };

        for conn in registered {
            conn.disconnect(DisconnectReason::ServerShutdown, None)
                .await;
        }

        info!("stopped");
        Ok(())
    }

    /// Snapshot of every currently-registered connection (§4.5 `All`).
    pub async fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.lock().await.values().cloned().collect()
    }

    /// Snapshot of connections that have completed the handshake upgrade
    /// (§4.5 `AllUpgraded`).
    pub async fn upgraded_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .lock()
            .await
            .values()
            .filter(|conn| matches!(conn.state(), ConnectionState::Upgraded))
            .cloned()
            .collect()
    }

    /// Enqueues `text` for every connection the selector resolves to (§4.5).
    pub async fn queue_text(&self, selector: Selector, text: impl Into<String> + Clone) -> Result<()> {
        for conn in self.resolve(selector).await {
            let _ = conn.queue_text(text.clone());
        }
        Ok(())
    }

    /// Enqueues `data` for every connection the selector resolves to (§4.5).
    pub async fn queue_binary(&self, selector: Selector, data: impl Into<Vec<u8>> + Clone) -> Result<()> {
        for conn in self.resolve(selector).await {
            let _ = conn.queue_binary(data.clone());
        }
        Ok(())
    }

    /// Disconnects a specific connection with the given reason; fails with
    /// `NotInServer` if it's not (or no longer) registered (§4.4, §6).
    pub async fn disconnect_client(
        &self,
        remote_addr: SocketAddr,
        reason: DisconnectReason,
        reason_text: Option<String>,
    ) -> Result<()> {
        let conn = self.connections.lock().await.get(&remote_addr).cloned();
        match conn {
            Some(conn) => {
                conn.disconnect(reason, reason_text).await;
                Ok(())
            }
            None => Err(Error::NotInServer),
        }
    }

    /// Pings a specific connection and returns the measured round trip in
    /// milliseconds, or `-1` on timeout (§4.4).
    pub async fn ping_client(
        &self,
        remote_addr: SocketAddr,
        timeout: std::time::Duration,
    ) -> Result<i64> {
        let conn = self.connections.lock().await.get(&remote_addr).cloned();
        match conn {
            Some(conn) => Ok(conn.ping(timeout).await),
            None => Err(Error::NotInServer),
        }
    }

    async fn resolve(&self, selector: Selector) -> Vec<Arc<ConnectionHandle>> {
        match selector {
            Selector::All => self.connections().await,
            Selector::AllUpgraded => self.upgraded_connections().await,
            Selector::Single(addr) => self
                .connections
                .lock()
                .await
                .get(&addr)
                .cloned()
                .into_iter()
                .collect(),
        }
    }
}
