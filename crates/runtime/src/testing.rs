//! Shared test doubles for runtime tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::connection::{
    Connection, DisconnectCallback, DisconnectFuture, MessageCallback,
};
use inspector_protocol::Message;

/// In-memory connection that records outbound traffic and lets tests inject
/// inbound messages. With auto-respond enabled, every request is answered
/// synchronously with a canned (or empty) result, which keeps single-threaded
/// test bodies free of reply plumbing.
pub(crate) struct FakeConnection {
    sent: Mutex<Vec<String>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    disconnected: AtomicBool,
    auto_respond: AtomicBool,
    canned_results: Mutex<HashMap<String, Value>>,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            on_message: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            auto_respond: AtomicBool::new(false),
            canned_results: Mutex::new(HashMap::new()),
        })
    }

    pub fn auto_responding() -> Arc<Self> {
        let connection = Self::new();
        connection.auto_respond.store(true, Ordering::SeqCst);
        connection
    }

    /// Sets the result auto-respond returns for the given method.
    pub fn set_result(&self, method: &str, result: Value) {
        self.canned_results.lock().insert(method.to_string(), result);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Parsed view of everything sent so far.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent()
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("sent message parses"))
            .collect()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent_messages()
            .into_iter()
            .filter_map(|m| m.method)
            .collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Injects an inbound raw message, as the transport would.
    pub fn emit_message(&self, raw: &str) {
        let callback = self.on_message.lock().clone();
        if let Some(callback) = callback {
            callback(raw);
        }
    }

    pub fn emit_disconnect(&self, reason: &str) {
        self.disconnected.store(true, Ordering::SeqCst);
        let callback = self.on_disconnect.lock().take();
        *self.on_message.lock() = None;
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    fn maybe_respond(&self, raw: &str) {
        if !self.auto_respond.load(Ordering::SeqCst) {
            return;
        }
        let Ok(request) = serde_json::from_str::<Message>(raw) else {
            return;
        };
        let (Some(id), Some(method)) = (request.id, request.method.as_deref()) else {
            return;
        };
        let result = self
            .canned_results
            .lock()
            .get(method)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let response = Message {
            id: Some(id),
            session_id: request.session_id,
            result: Some(result),
            ..Message::default()
        };
        let raw = serde_json::to_string(&response).expect("response serializes");
        self.emit_message(&raw);
    }
}

impl Connection for FakeConnection {
    fn set_on_message(&self, callback: MessageCallback) {
        *self.on_message.lock() = Some(callback);
    }

    fn set_on_disconnect(&self, callback: Option<DisconnectCallback>) {
        *self.on_disconnect.lock() = callback;
    }

    fn send_raw_message(&self, message: &str) {
        self.sent.lock().push(message.to_string());
        self.maybe_respond(message);
    }

    fn disconnect(&self) -> DisconnectFuture<'_> {
        Box::pin(async move {
            self.emit_disconnect("test disconnect");
        })
    }
}
