//! The connection engine (§4.3): a state machine plus three cooperating
//! activities (reader, writer, pinger) driving one accepted socket from
//! handshake through to close.

use crate::config::ServerOptions;
use crate::error::{Error, ErrorKind, Result};
use crate::frame::{self, OpCode};
use crate::handler::Handler;
use crate::handshake;
use crate::server::DisconnectReason;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

/// Bound on how much unparsed handshake text the reader will buffer before
/// giving up (§4.2 doesn't name a limit; borrowed from the source's header
/// read buffer sizing).
const HANDSHAKE_BUFFER_CAP: usize = 16 * 1024;

/// Lifecycle states, §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Accepted = 0,
    Upgraded = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(byte: u8) -> Self {
        match byte {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Upgraded,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

struct PendingMessage {
    opcode: OpCode,
    payload: Vec<u8>,
}

/// A handle to one connection, handed to [`Handler`] hooks and held by the
/// server's registry. Identity is the peer's socket address (§3).
pub struct ConnectionHandle {
    remote_addr: SocketAddr,
    state: AtomicU8,
    disconnecting: AtomicBool,
    handle_started: AtomicBool,
    ping_ms: AtomicI64,
    ponged: AtomicBool,
    pong_notify: Notify,
    /// Fires when any activity initiates a disconnect, so the other two
    /// activities — which may be blocked waiting on I/O or a timer rather
    /// than polling state — wake up and observe it promptly (§3's "all
    /// three terminate together" invariant).
    shutdown_notify: Notify,
    closed: AtomicBool,
    closed_notify: Notify,
    close_reason: StdMutex<Option<DisconnectReason>>,
    sender: StdMutex<Option<mpsc::UnboundedSender<PendingMessage>>>,
    writer: Arc<AsyncMutex<WriteHalf<TcpStream>>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    writer_task: StdMutex<Option<JoinHandle<()>>>,
    pinger_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Last measured round trip in milliseconds, or `-1` if no ping has
    /// completed yet (§3).
    pub fn current_ping(&self) -> i64 {
        self.ping_ms.load(Ordering::SeqCst)
    }

    fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Enqueues a text message for the writer activity (§4.3).
    pub fn queue_text(&self, text: impl Into<String>) -> Result<()> {
        self.enqueue(OpCode::Text, text.into().into_bytes())
    }

    /// Enqueues a binary message for the writer activity (§4.3).
    pub fn queue_binary(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.enqueue(OpCode::Binary, data.into())
    }

    fn enqueue(&self, opcode: OpCode, payload: Vec<u8>) -> Result<()> {
        if !matches!(self.state(), ConnectionState::Upgraded) {
            return Err(Error::NotConnected);
        }
        let guard = self.sender.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(PendingMessage { opcode, payload })
                .map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    fn mark_ponged(&self) {
        self.ponged.store(true, Ordering::SeqCst);
        self.pong_notify.notify_waiters();
    }

    /// Sends a ping and waits (up to `timeout`) for the matching pong,
    /// returning the measured round trip in milliseconds or `-1` on timeout
    /// or if the connection starts closing first (§4.3 pinger activity).
    pub async fn ping(&self, timeout: std::time::Duration) -> i64 {
        if !matches!(self.state(), ConnectionState::Upgraded) {
            return -1;
        }
        self.ponged.store(false, Ordering::SeqCst);
        let start = Instant::now();
        if self.enqueue(OpCode::Ping, Vec::new()).is_err() {
            return -1;
        }

        let wait = async {
            loop {
                if self.ponged.load(Ordering::SeqCst) {
                    return true;
                }
                if !matches!(self.state(), ConnectionState::Upgraded) {
                    return false;
                }
                let notified = self.pong_notify.notified();
                if self.ponged.load(Ordering::SeqCst) {
                    return true;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => start.elapsed().as_millis() as i64,
            _ => -1,
        }
    }

    /// Begins a clean shutdown: marks the connection closing, stashes the
    /// reason for the hook callback, and hands the writer activity a close
    /// frame to send once its current queue drains. Idempotent — a second
    /// call while one is already in flight is a no-op.
    fn begin_disconnect(&self, reason: DisconnectReason, reason_text: Option<String>) {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state
            .store(ConnectionState::Closing as u8, Ordering::SeqCst);
        self.pong_notify.notify_waiters();
        self.shutdown_notify.notify_waiters();
        *self.close_reason.lock().unwrap() = Some(reason);

        let payload = frame::encode_close_payload(&reason, reason_text.as_deref());
        let mut guard = self.sender.lock().unwrap();
        if let Some(tx) = guard.take() {
            let _ = tx.send(PendingMessage {
                opcode: OpCode::Close,
                payload,
            });
        }
    }

    /// Public disconnect operation (§4.3): initiates the close and waits
    /// for it to complete.
    pub async fn disconnect(&self, reason: DisconnectReason, reason_text: Option<String>) {
        self.begin_disconnect(reason, reason_text);
        self.wait_until_closed().await;
    }

    async fn wait_until_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the connection has fully closed *and* its reader,
    /// writer, and pinger activities have all actually finished running.
    /// Used by the server supervisor to know when it's safe to drop a
    /// connection from its registry (§3: the registry slot is cleared only
    /// after all three activities have observed `Closed`).
    pub async fn closed(&self) {
        self.wait_until_closed().await;
        let reader = self.reader_task.lock().unwrap().take();
        let writer = self.writer_task.lock().unwrap().take();
        let pinger = self.pinger_task.lock().unwrap().take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        if let Some(handle) = pinger {
            let _ = handle.await;
        }
    }

    async fn finish_close(&self, handler: &dyn Handler) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        let reason = self
            .close_reason
            .lock()
            .unwrap()
            .take()
            .unwrap_or(DisconnectReason::Error(None));
        let error_kind = match reason {
            DisconnectReason::Error(kind) => kind,
            _ => None,
        };
        info!("{}: closed, reason={:?}", self.remote_addr(), reason);
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        handler.on_disconnected(self, reason, error_kind);
    }
}

/// Builds a [`ConnectionHandle`] for a freshly accepted socket and spawns
/// its reader, writer, and pinger activities (§4.3). Returns the handle
/// immediately — the activities run to completion in the background, and
/// callers await [`ConnectionHandle::closed`] to learn when that happens.
///
/// Guarded by `handle_started` so a given handle's activities can only ever
/// be spawned once; in practice every handle is fresh, so this never
/// actually trips, but it keeps the `AlreadyConnected` precondition (§7)
/// meaningful rather than unreachable.
pub fn spawn(
    remote_addr: SocketAddr,
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
) -> Result<Arc<ConnectionHandle>> {
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let conn = Arc::new(ConnectionHandle {
        remote_addr,
        state: AtomicU8::new(ConnectionState::Accepted as u8),
        disconnecting: AtomicBool::new(false),
        handle_started: AtomicBool::new(false),
        ping_ms: AtomicI64::new(-1),
        ponged: AtomicBool::new(false),
        pong_notify: Notify::new(),
        shutdown_notify: Notify::new(),
        closed: AtomicBool::new(false),
        closed_notify: Notify::new(),
        close_reason: StdMutex::new(None),
        sender: StdMutex::new(Some(tx)),
        writer: Arc::new(AsyncMutex::new(write_half)),
        reader_task: StdMutex::new(None),
        writer_task: StdMutex::new(None),
        pinger_task: StdMutex::new(None),
    });

    if conn.handle_started.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyConnected);
    }

    handler.on_connected(&conn);

    let reader_conn = conn.clone();
    let reader_handler = handler.clone();
    let reader_options = options.clone();
    let reader_handle = tokio::spawn(async move {
        run_reader(reader_conn, read_half, reader_handler, reader_options).await;
    });
    *conn.reader_task.lock().unwrap() = Some(reader_handle);

    let writer_conn = conn.clone();
    let writer_handler = handler.clone();
    let writer_messaging = options.messaging;
    let writer_handle = tokio::spawn(async move {
        run_writer(writer_conn, rx, writer_handler, writer_messaging).await;
    });
    *conn.writer_task.lock().unwrap() = Some(writer_handle);

    let pinger_conn = conn.clone();
    let pinger_options = options.auto_ping;
    let pinger_handle = tokio::spawn(async move {
        run_pinger(pinger_conn, pinger_options).await;
    });
    *conn.pinger_task.lock().unwrap() = Some(pinger_handle);

    Ok(conn)
}

async fn read_handshake_request(
    reader: &mut BufReader<ReadHalf<TcpStream>>,
    conn: &ConnectionHandle,
) -> Result<String> {
    let mut buf = String::new();
    loop {
        if buf.len() > HANDSHAKE_BUFFER_CAP {
            return Err(Error::IncompleteHandshakeRequest);
        }
        let n = tokio::select! {
            n = tokio::io::AsyncBufReadExt::read_line(reader, &mut buf) => n?,
            _ = conn.shutdown_notify.notified() => return Err(Error::IncompleteHandshakeRequest),
        };
        if n == 0 {
            return Err(Error::IncompleteHandshakeRequest);
        }
        if buf.ends_with("\r\n\r\n") {
            return Ok(buf);
        }
    }
}

async fn run_reader(
    conn: Arc<ConnectionHandle>,
    read_half: ReadHalf<TcpStream>,
    handler: Arc<dyn Handler>,
    options: ServerOptions,
) {
    let mut reader = BufReader::new(read_half);

    let request = match read_handshake_request(&mut reader, &conn).await {
        Ok(request) => request,
        Err(_) => {
            conn.disconnect(
                DisconnectReason::Error(Some(ErrorKind::UpgradeFail)),
                None,
            )
            .await;
            return;
        }
    };

    let (headers, accept) = match handshake::process_handshake_request(&request) {
        Ok(pair) => pair,
        Err(err) => {
            debug!("{}: handshake rejected: {err}", conn.remote_addr());
            conn.disconnect(
                DisconnectReason::Error(Some(ErrorKind::UpgradeFail)),
                None,
            )
            .await;
            return;
        }
    };

    if !handler.verify_handshake(&headers, &request) {
        conn.disconnect(
            DisconnectReason::Error(Some(ErrorKind::UpgradeFail)),
            None,
        )
        .await;
        return;
    }

    let response = handshake::build_switching_protocols_response(&accept);
    let write_result = {
        let mut w = conn.writer.lock().await;
        w.write_all(response.as_bytes()).await
    };
    if write_result.is_err() {
        conn.disconnect(
            DisconnectReason::Error(Some(ErrorKind::UpgradeFail)),
            None,
        )
        .await;
        return;
    }

    conn.state
        .store(ConnectionState::Upgraded as u8, Ordering::SeqCst);
    handler.on_upgraded(&conn);
    debug!("{}: upgraded", conn.remote_addr());

    let max_receive = options.messaging.max_message_receive_bytes;
    let mut buf = BytesMut::new();
    let mut tmp = [0u8; 8192];

    loop {
        if conn.is_disconnecting() {
            return;
        }

        if buf.len() > max_receive {
            warn!("{}: message exceeds receive limit", conn.remote_addr());
            conn.disconnect(
                DisconnectReason::Error(Some(ErrorKind::MessageTooLarge)),
                None,
            )
            .await;
            return;
        }

        match frame::decode_frame(&buf) {
            Ok(Some((decoded, consumed))) => {
                let _ = buf.split_to(consumed);

                if !decoded.finished {
                    warn!("{}: unfinished frame", conn.remote_addr());
                    conn.disconnect(
                        DisconnectReason::Error(Some(ErrorKind::MessageUnfinished)),
                        None,
                    )
                    .await;
                    return;
                }
                if !decoded.masked {
                    warn!("{}: unmasked client frame", conn.remote_addr());
                    conn.disconnect(
                        DisconnectReason::Error(Some(ErrorKind::MissingMask)),
                        None,
                    )
                    .await;
                    return;
                }

                match decoded.opcode {
                    OpCode::Text => match String::from_utf8(decoded.payload) {
                        Ok(text) if text == options.disconnect_phrase => {
                            conn.disconnect(DisconnectReason::Requested, None).await;
                            return;
                        }
                        Ok(text) => dispatch_on_message(&conn, &handler, text).await,
                        Err(_) => {
                            warn!("{}: text frame was not valid UTF-8", conn.remote_addr());
                            conn.disconnect(
                                DisconnectReason::Error(Some(ErrorKind::HandlingException)),
                                None,
                            )
                            .await;
                            return;
                        }
                    },
                    OpCode::Binary => {
                        dispatch_on_data(&conn, &handler, decoded.payload).await
                    }
                    OpCode::Close => {
                        conn.disconnect(DisconnectReason::Requested, None).await;
                        return;
                    }
                    // No automatic Pong reply to an inbound Ping (§4.3, §9).
                    OpCode::Ping => {}
                    OpCode::Pong => conn.mark_ponged(),
                    OpCode::Continuation | OpCode::Reserved(_) => {}
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("{}: frame decode error: {err}", conn.remote_addr());
                conn.disconnect(
                    DisconnectReason::Error(Some(ErrorKind::MessageUnfinished)),
                    None,
                )
                .await;
                return;
            }
        }

        let read_result = tokio::select! {
            result = reader.read(&mut tmp) => result,
            _ = conn.shutdown_notify.notified() => {
                return;
            }
        };

        match read_result {
            Ok(0) => {
                error!("{}: peer closed the stream", conn.remote_addr());
                conn.disconnect(
                    DisconnectReason::Error(Some(ErrorKind::StreamDisposed)),
                    None,
                )
                .await;
                return;
            }
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(err) => {
                error!("{}: read error: {err}", conn.remote_addr());
                conn.disconnect(
                    DisconnectReason::Error(Some(ErrorKind::StreamDisposed)),
                    None,
                )
                .await;
                return;
            }
        }
    }
}

/// Runs a hook inside `catch_unwind` (§7/§9): a panicking hook still tears
/// the connection down cleanly with `HandlingException` before the panic
/// continues to unwind.
async fn dispatch_on_message(conn: &Arc<ConnectionHandle>, handler: &Arc<dyn Handler>, text: String) {
    let hook_handler = handler.clone();
    let hook_conn = conn.clone();
    let result = panic::catch_unwind(AssertUnwindSafe(move || {
        hook_handler.on_message(&hook_conn, text)
    }));
    if let Err(payload) = result {
        error!("{}: on_message hook panicked", conn.remote_addr());
        conn.disconnect(
            DisconnectReason::Error(Some(ErrorKind::HandlingException)),
            None,
        )
        .await;
        panic::resume_unwind(payload);
    }
}

async fn dispatch_on_data(conn: &Arc<ConnectionHandle>, handler: &Arc<dyn Handler>, data: Vec<u8>) {
    let hook_handler = handler.clone();
    let hook_conn = conn.clone();
    let result = panic::catch_unwind(AssertUnwindSafe(move || hook_handler.on_data(&hook_conn, data)));
    if let Err(payload) = result {
        error!("{}: on_data hook panicked", conn.remote_addr());
        conn.disconnect(
            DisconnectReason::Error(Some(ErrorKind::HandlingException)),
            None,
        )
        .await;
        panic::resume_unwind(payload);
    }
}

async fn run_writer(
    conn: Arc<ConnectionHandle>,
    mut rx: mpsc::UnboundedReceiver<PendingMessage>,
    handler: Arc<dyn Handler>,
    messaging: crate::config::MessagingOptions,
) {
    while let Some(msg) = rx.recv().await {
        if msg.opcode == OpCode::Close {
            let wire = frame::encode_frame(OpCode::Close, &msg.payload, true);
            let write_result = {
                let mut w = conn.writer.lock().await;
                w.write_all(&wire).await
            };
            if write_result.is_err() {
                warn!("{}: failed writing close frame", conn.remote_addr());
            }
            conn.finish_close(&*handler).await;
            return;
        }

        if msg.payload.len() > messaging.max_message_send_bytes {
            conn.begin_disconnect(
                DisconnectReason::Error(Some(ErrorKind::MessageTooLarge)),
                None,
            );
            continue;
        }

        let frames = frame::encode_message(msg.opcode, &msg.payload, messaging.max_frame_send_bytes);
        let mut failed = false;
        for wire in frames {
            let write_result = {
                let mut w = conn.writer.lock().await;
                w.write_all(&wire).await
            };
            if write_result.is_err() {
                failed = true;
                break;
            }
        }
        if failed {
            conn.begin_disconnect(DisconnectReason::Error(Some(ErrorKind::WriteError)), None);
        }
    }

    if !matches!(conn.state(), ConnectionState::Closed) {
        conn.finish_close(&*handler).await;
    }
}

async fn run_pinger(conn: Arc<ConnectionHandle>, options: crate::config::AutoPingOptions) {
    if !options.enabled {
        return;
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = conn.shutdown_notify.notified() => return,
        }
        if !matches!(conn.state(), ConnectionState::Upgraded) {
            return;
        }
        let measured = conn.ping(options.timeout).await;
        if measured < 0 {
            if matches!(conn.state(), ConnectionState::Upgraded) {
                warn!("{}: ping timed out", conn.remote_addr());
                conn.disconnect(DisconnectReason::Timeout, None).await;
            }
            return;
        }
        debug!("{}: ping round trip {measured}ms", conn.remote_addr());
        conn.ping_ms.store(measured, Ordering::SeqCst);
    }
}
