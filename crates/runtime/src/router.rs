//! Session routing and request/response correlation on one connection.
//!
//! A [`SessionRouter`] owns one physical connection and multiplexes the
//! flattened sessions layered on it. Outbound requests get connection-unique
//! ids; inbound traffic is routed by session id to the owning target's
//! dispatch table, to a parallel connection proxy, or to the pending-request
//! callback for a response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::{Connection, ParallelConnection};
use crate::error::{Error, Result};
use inspector_protocol::Message;

/// Per-session inbound event sink; implemented by [`crate::Target`].
pub trait SessionHandler: Send + Sync {
    fn dispatch_event(&self, method: &str, params: Value);
}

struct Session {
    handler: Option<Weak<dyn SessionHandler>>,
    proxy: Option<Arc<ParallelConnection>>,
}

/// Routes messages between one connection and the sessions multiplexed on it.
pub struct SessionRouter {
    connection: Arc<dyn Connection>,
    next_message_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRouter {
    /// Creates a router over `connection` and installs itself as the
    /// connection's message and disconnect handler.
    pub fn new(connection: Arc<dyn Connection>) -> Arc<Self> {
        let router = Arc::new(Self {
            connection: Arc::clone(&connection),
            next_message_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&router);
        connection.set_on_message(Arc::new(move |raw| {
            if let Some(router) = weak.upgrade() {
                router.dispatch(raw);
            }
        }));
        let weak = Arc::downgrade(&router);
        connection.set_on_disconnect(Some(Arc::new(move |reason| {
            if let Some(router) = weak.upgrade() {
                router.connection_lost(reason);
            }
        })));
        router
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }

    /// Registers a session handler. The root session uses the empty string.
    /// Session ids are unique per connection; re-registration replaces the
    /// previous entry with a warning.
    pub fn register_session(&self, session_id: &str, handler: Weak<dyn SessionHandler>) {
        let previous = self.sessions.lock().insert(
            session_id.to_string(),
            Session {
                handler: Some(handler),
                proxy: None,
            },
        );
        if previous.is_some() {
            tracing::warn!(session = session_id, "session registered twice");
        }
    }

    /// Registers a parallel connection as the sink for a session's traffic.
    pub fn register_proxy_session(&self, session_id: &str, proxy: Arc<ParallelConnection>) {
        self.sessions.lock().insert(
            session_id.to_string(),
            Session {
                handler: None,
                proxy: Some(proxy),
            },
        );
    }

    /// Removes a session. Unknown ids are a no-op.
    pub fn unregister_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    /// Sends a request on the given session and awaits its response.
    pub async fn send_message(&self, session_id: &str, method: &str, params: Value) -> Result<Value> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.callbacks.lock().insert(id, tx);

        let message = Message::request(id, method, params, session_id);
        let raw = match serde_json::to_string(&message) {
            Ok(raw) => raw,
            Err(e) => {
                self.callbacks.lock().remove(&id);
                return Err(e.into());
            }
        };
        tracing::debug!(id, method, session = session_id, "sending message");
        self.connection.send_raw_message(&raw);

        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    fn dispatch(&self, raw: &str) {
        let message: Message = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable inbound message");
                return;
            }
        };
        let session_id = message.session_id.clone().unwrap_or_default();

        let (handler, proxy) = {
            let sessions = self.sessions.lock();
            match sessions.get(&session_id) {
                Some(session) => (session.handler.clone(), session.proxy.clone()),
                None if session_id.is_empty() => (None, None),
                None => {
                    tracing::warn!(
                        session = %session_id,
                        "dropping message for unregistered session"
                    );
                    return;
                }
            }
        };

        // Traffic for a proxied session is forwarded wholesale, responses
        // included: the parallel connection owns its own correlation.
        if let Some(proxy) = proxy {
            proxy.deliver(raw);
            return;
        }

        if message.is_response() {
            self.complete_request(&message);
            return;
        }

        let Some(method) = message.method.as_deref() else {
            tracing::warn!("dropping malformed message with neither method nor id");
            return;
        };
        match handler.as_ref().and_then(Weak::upgrade) {
            Some(handler) => handler.dispatch_event(method, message.params),
            None => tracing::debug!(
                method,
                session = %session_id,
                "dropping event: session has no live handler"
            ),
        }
    }

    fn complete_request(&self, message: &Message) {
        let id = message.id.unwrap_or_default();
        let Some(callback) = self.callbacks.lock().remove(&id) else {
            tracing::warn!(id, "dropping response for unknown request id");
            return;
        };
        let result = match &message.error {
            Some(error) => Err(Error::Remote {
                code: error.code,
                message: error.message.clone(),
            }),
            None => Ok(message.result.clone().unwrap_or(Value::Null)),
        };
        let _ = callback.send(result);
    }

    /// Fails every pending request and notifies parallel connections that
    /// their transport is gone.
    fn connection_lost(&self, reason: &str) {
        tracing::debug!(reason, "connection lost, failing pending requests");
        let callbacks: Vec<_> = {
            let mut pending = self.callbacks.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for callback in callbacks {
            let _ = callback.send(Err(Error::ConnectionLost(reason.to_string())));
        }
        let proxies: Vec<_> = {
            let sessions = self.sessions.lock();
            sessions.values().filter_map(|s| s.proxy.clone()).collect()
        };
        for proxy in proxies {
            proxy.parent_disconnected(reason);
        }
    }
}
