//! Connection variants over the physical transport.
//!
//! Every connection exposes the same narrow contract: one inbound message
//! callback, one disconnect callback, raw string sends, and an async
//! disconnect. Four variants implement it:
//!
//! - [`HostConnection`] - messages handed off to/from an embedding host,
//!   including chunked-message reassembly
//! - [`WebSocketConnection`] - socket transport with outbound queuing while
//!   the socket is still opening
//! - [`StubConnection`] - auto-fails every request, for offline mode
//! - [`ParallelConnection`] - tags outbound traffic with a fixed session id
//!   to open a second logical channel on an existing connection
//!
//! A connection reports a disconnect exactly once; both callbacks are cleared
//! afterwards so no further delivery reaches a torn-down owner.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use inspector_protocol::{CONNECTION_LOST_ERROR_CODE, Message};

/// Callback invoked once per inbound message.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked once when the connection goes away, with a reason.
pub type DisconnectCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Boxed future returned by [`Connection::disconnect`].
pub type DisconnectFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Abstraction over the physical transport.
pub trait Connection: Send + Sync {
    /// Installs the inbound message handler.
    fn set_on_message(&self, callback: MessageCallback);

    /// Installs or clears the disconnect handler.
    fn set_on_disconnect(&self, callback: Option<DisconnectCallback>);

    /// Sends a raw protocol message. Never blocks; failures surface later
    /// through the disconnect handler.
    fn send_raw_message(&self, message: &str);

    /// Closes the connection. Idempotent.
    fn disconnect(&self) -> DisconnectFuture<'_>;
}

/// Shared callback pair with fire-once disconnect semantics.
#[derive(Default)]
struct Callbacks {
    on_message: Mutex<Option<MessageCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl Callbacks {
    fn message(&self, raw: &str) {
        let callback = self.on_message.lock().clone();
        match callback {
            Some(callback) => callback(raw),
            None => tracing::debug!("dropping inbound message: no handler installed"),
        }
    }

    /// Fires the disconnect handler once and clears both callbacks.
    fn disconnect(&self, reason: &str) {
        let callback = self.on_disconnect.lock().take();
        *self.on_message.lock() = None;
        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

/// Channel into the embedding host: accepts outbound raw messages.
///
/// The embedder feeds inbound traffic back through
/// [`HostConnection::dispatch_message`] and
/// [`HostConnection::dispatch_message_chunk`].
pub trait HostChannel: Send + Sync {
    fn post_message(&self, message: &str);

    fn close(&self) {}
}

#[derive(Default)]
struct ChunkBuffer {
    buffer: String,
    total: usize,
}

/// Connection over a host-provided channel, with chunked-message reassembly.
///
/// Only one message may be in flight for reassembly at a time: a new total
/// size announcement discards any partially accumulated buffer.
pub struct HostConnection {
    channel: Arc<dyn HostChannel>,
    callbacks: Callbacks,
    chunks: Mutex<ChunkBuffer>,
}

impl HostConnection {
    pub fn new(channel: Arc<dyn HostChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            callbacks: Callbacks::default(),
            chunks: Mutex::new(ChunkBuffer::default()),
        })
    }

    /// Delivers a whole inbound message from the host.
    pub fn dispatch_message(&self, message: &str) {
        self.callbacks.message(message);
    }

    /// Delivers one chunk of an inbound message. A `Some(total)` size starts
    /// a new message; the reassembled string is delivered once the buffer
    /// length reaches exactly that total.
    pub fn dispatch_message_chunk(&self, chunk: &str, message_size: Option<usize>) {
        let complete = {
            let mut state = self.chunks.lock();
            if let Some(total) = message_size {
                if !state.buffer.is_empty() {
                    tracing::warn!(
                        discarded = state.buffer.len(),
                        "new chunked message started before previous one completed"
                    );
                }
                state.buffer = String::with_capacity(total);
                state.total = total;
            }
            state.buffer.push_str(chunk);
            if state.total != 0 && state.buffer.len() > state.total {
                tracing::warn!(
                    declared = state.total,
                    received = state.buffer.len(),
                    "chunked message overran its declared size, dropping"
                );
                *state = ChunkBuffer::default();
                None
            } else if state.total != 0 && state.buffer.len() == state.total {
                let message = std::mem::take(&mut state.buffer);
                state.total = 0;
                Some(message)
            } else {
                None
            }
        };
        if let Some(message) = complete {
            self.callbacks.message(&message);
        }
    }

    /// Reports that the host side went away.
    pub fn host_disconnected(&self, reason: &str) {
        self.callbacks.disconnect(reason);
    }
}

impl Connection for HostConnection {
    fn set_on_message(&self, callback: MessageCallback) {
        *self.callbacks.on_message.lock() = Some(callback);
    }

    fn set_on_disconnect(&self, callback: Option<DisconnectCallback>) {
        *self.callbacks.on_disconnect.lock() = callback;
    }

    fn send_raw_message(&self, message: &str) {
        self.channel.post_message(message);
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(async move {
            self.channel.close();
            self.callbacks.disconnect("host connection closed");
        })
    }
}

enum SocketCommand {
    Send(String),
    Close,
}

/// WebSocket transport connection.
///
/// Messages sent before the socket finishes opening are queued and flushed in
/// FIFO order on open. Connect-time errors and post-connect closures both
/// surface as a single disconnect with a reason string.
pub struct WebSocketConnection {
    callbacks: Callbacks,
    command_tx: mpsc::UnboundedSender<SocketCommand>,
    closed: AtomicBool,
}

impl WebSocketConnection {
    /// Starts connecting to `url` in the background. The returned connection
    /// accepts sends immediately; they are queued until the socket opens.
    pub fn new(url: &str) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            callbacks: Callbacks::default(),
            command_tx,
            closed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&connection);
        let url = url.to_string();
        tokio::spawn(Self::run(weak, url, command_rx));
        connection
    }

    async fn run(
        connection: std::sync::Weak<Self>,
        url: String,
        mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    ) {
        let report = |reason: String| {
            if let Some(connection) = connection.upgrade() {
                connection.report_disconnect(&reason);
            }
        };

        let stream = match connect_async(&url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                report(format!("failed to connect to {url}: {e}"));
                return;
            }
        };
        tracing::debug!(%url, "websocket open");
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SocketCommand::Send(text)) => {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            report(format!("websocket send failed: {e}"));
                            break;
                        }
                    }
                    Some(SocketCommand::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        report("websocket closed".to_string());
                        break;
                    }
                },
                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        match connection.upgrade() {
                            Some(connection) => connection.callbacks.message(&text),
                            None => break,
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        report("websocket closed by remote".to_string());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        report(format!("websocket error: {e}"));
                        break;
                    }
                },
            }
        }
    }

    fn report_disconnect(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(reason, "websocket disconnected");
        self.callbacks.disconnect(reason);
    }
}

impl Connection for WebSocketConnection {
    fn set_on_message(&self, callback: MessageCallback) {
        *self.callbacks.on_message.lock() = Some(callback);
    }

    fn set_on_disconnect(&self, callback: Option<DisconnectCallback>) {
        *self.callbacks.on_disconnect.lock() = callback;
    }

    fn send_raw_message(&self, message: &str) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("dropping message on closed websocket");
            return;
        }
        if self.command_tx.send(SocketCommand::Send(message.to_string())).is_err() {
            tracing::debug!("dropping message: websocket task gone");
        }
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let _ = self.command_tx.send(SocketCommand::Close);
        })
    }
}

/// Connection for a backend that is known to be unreachable.
///
/// Every request is answered asynchronously with a synthetic error response
/// carrying [`CONNECTION_LOST_ERROR_CODE`] and the echoed request id, so
/// callers written against the normal request/response contract need no
/// separate offline code path.
pub struct StubConnection {
    callbacks: Callbacks,
}

impl StubConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: Callbacks::default(),
        })
    }
}

impl Connection for StubConnection {
    fn set_on_message(&self, callback: MessageCallback) {
        *self.callbacks.on_message.lock() = Some(callback);
    }

    fn set_on_disconnect(&self, callback: Option<DisconnectCallback>) {
        *self.callbacks.on_disconnect.lock() = callback;
    }

    fn send_raw_message(&self, message: &str) {
        let id = match serde_json::from_str::<Message>(message) {
            Ok(request) => request.id,
            Err(_) => None,
        };
        let Some(id) = id else {
            tracing::debug!("stub connection dropping message without id");
            return;
        };
        let response = Message::error_response(
            id,
            CONNECTION_LOST_ERROR_CODE,
            "Connection is closed, can't dispatch pending call",
        );
        let Ok(raw) = serde_json::to_string(&response) else {
            return;
        };
        let callback = self.callbacks.on_message.lock().clone();
        let Some(callback) = callback else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { callback(&raw) });
            }
            Err(_) => callback(&raw),
        }
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(async move {
            self.callbacks.disconnect("force disconnect");
        })
    }
}

/// Second logical channel to a target, layered on an existing connection.
///
/// Outbound messages that lack a session id get this connection's fixed
/// session id injected; messages already addressed to a nested session pass
/// through untouched. Inbound delivery happens through the session router,
/// which forwards traffic for this session id wholesale via [`Self::deliver`].
///
/// Disconnecting never closes the wrapped connection: the transport belongs
/// to whoever created it.
pub struct ParallelConnection {
    connection: Arc<dyn Connection>,
    session_id: String,
    callbacks: Callbacks,
}

impl ParallelConnection {
    pub fn new(connection: Arc<dyn Connection>, session_id: String) -> Arc<Self> {
        Arc::new(Self {
            connection,
            session_id,
            callbacks: Callbacks::default(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Called by the session router with raw traffic addressed to this
    /// connection's session.
    pub(crate) fn deliver(&self, raw: &str) {
        self.callbacks.message(raw);
    }

    /// Called by the session router when the parent connection goes away.
    pub(crate) fn parent_disconnected(&self, reason: &str) {
        self.callbacks.disconnect(reason);
    }
}

impl Connection for ParallelConnection {
    fn set_on_message(&self, callback: MessageCallback) {
        *self.callbacks.on_message.lock() = Some(callback);
    }

    fn set_on_disconnect(&self, callback: Option<DisconnectCallback>) {
        *self.callbacks.on_disconnect.lock() = callback;
    }

    fn send_raw_message(&self, message: &str) {
        match serde_json::from_str::<Value>(message) {
            Ok(Value::Object(mut envelope)) => {
                envelope
                    .entry("sessionId")
                    .or_insert_with(|| Value::String(self.session_id.clone()));
                match serde_json::to_string(&envelope) {
                    Ok(raw) => self.connection.send_raw_message(&raw),
                    Err(e) => tracing::warn!(error = %e, "failed to re-serialize outbound message"),
                }
            }
            _ => tracing::warn!("parallel connection dropping unparseable outbound message"),
        }
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(async move {
            self.callbacks.disconnect("parallel connection closed");
        })
    }
}
