//! Targets and the per-capability models attached to them.
//!
//! A [`Target`] represents one debuggable endpoint (a page, a worker, a
//! service worker). It owns the live set of instantiated [`SdkModel`]s for
//! its capabilities and the protocol dispatch table that routes inbound
//! events for its session to the model that registered for the domain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use downcast_rs::{DowncastSync, impl_downcast};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Result;
use crate::router::{SessionHandler, SessionRouter};
use crate::target_manager::TargetManager;
use inspector_protocol::TargetInfo;

/// Capability bits a target type grants to model creation.
///
/// A model registration names the capabilities it needs; targets lacking any
/// of them silently skip the model.
pub mod capability {
    pub const NONE: u32 = 0;
    pub const BROWSER: u32 = 1 << 0;
    pub const DOM: u32 = 1 << 1;
    pub const JS: u32 = 1 << 2;
    pub const LOG: u32 = 1 << 3;
    pub const NETWORK: u32 = 1 << 4;
    pub const TARGET: u32 = 1 << 5;
    pub const SCREEN_CAPTURE: u32 = 1 << 6;
    pub const TRACING: u32 = 1 << 7;
    pub const EMULATION: u32 = 1 << 8;
    pub const SECURITY: u32 = 1 << 9;
    pub const INPUT: u32 = 1 << 10;
    pub const IO: u32 = 1 << 11;
    pub const STORAGE: u32 = 1 << 12;
    pub const SERVICE_WORKER: u32 = 1 << 13;
}

/// Kind of debuggable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetType {
    Frame,
    Worker,
    SharedWorker,
    ServiceWorker,
    Node,
    Browser,
    AuctionWorklet,
}

impl TargetType {
    /// Capability mask granted to targets of this type.
    pub fn capabilities(self) -> u32 {
        use capability::*;
        match self {
            TargetType::Frame => {
                DOM | JS | LOG | NETWORK | TARGET | SCREEN_CAPTURE | TRACING | EMULATION
                    | SECURITY | INPUT | IO | STORAGE
            }
            TargetType::Worker => JS | LOG | NETWORK | TARGET | IO,
            TargetType::SharedWorker => JS | LOG | NETWORK | TARGET | IO,
            TargetType::ServiceWorker => JS | LOG | NETWORK | TARGET | IO | SERVICE_WORKER,
            TargetType::Node => JS | NETWORK,
            TargetType::Browser => BROWSER | NETWORK | TARGET | IO,
            TargetType::AuctionWorklet => JS | LOG,
        }
    }
}

/// Tag identifying a model class in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelKind(pub &'static str);

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Tag identifying one event category a model emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelEventKind(pub &'static str);

/// Handle for removing a listener from a [`ModelEvents`] dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener invoked with the event's opaque JSON payload.
pub type ModelEventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Per-model event dispatcher.
///
/// Dispatch iterates over a snapshot of the listener list, so removing a
/// listener from inside a callback is safe.
#[derive(Default)]
pub struct ModelEvents {
    next_listener_id: AtomicU64,
    listeners: Mutex<HashMap<ModelEventKind, Vec<(ListenerId, ModelEventListener)>>>,
}

impl ModelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, event: ModelEventKind, listener: ModelEventListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .entry(event)
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, event: ModelEventKind, id: ListenerId) {
        if let Some(listeners) = self.listeners.lock().get_mut(&event) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    pub fn emit(&self, event: ModelEventKind, data: &Value) {
        let snapshot: Vec<ModelEventListener> = self
            .listeners
            .lock()
            .get(&event)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in snapshot {
            listener(data);
        }
    }
}

/// One per-capability model attached to a target.
///
/// Models are opaque to the routing layer beyond this contract: suspend and
/// resume hooks awaited during global state transitions, a dispose hook, and
/// an event dispatcher for model-level listeners.
#[async_trait]
pub trait SdkModel: DowncastSync {
    fn kind(&self) -> ModelKind;

    fn events(&self) -> &ModelEvents;

    async fn suspend_model(&self, _reason: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn resume_model(&self) -> Result<()> {
        Ok(())
    }

    fn dispose_model(&self) {}
}
impl_downcast!(sync SdkModel);

/// Inbound protocol event sink for one domain on one target.
pub trait ProtocolDispatcher: Send + Sync {
    fn dispatch(self: Arc<Self>, method: &str, params: Value);
}

/// One debuggable endpoint.
///
/// Created only through [`TargetManager::create_target`]; `parent` and
/// `session_id` never change after creation, only the [`TargetInfo`]
/// metadata may be updated in place.
pub struct Target {
    id: String,
    name: Mutex<String>,
    kind: TargetType,
    parent: Option<Weak<Target>>,
    session_id: String,
    capabilities: u32,
    router: Arc<SessionRouter>,
    manager: Weak<TargetManager>,
    info: Mutex<Option<TargetInfo>>,
    models: Mutex<Vec<(ModelKind, Arc<dyn SdkModel>)>>,
    dispatchers: Mutex<HashMap<String, Arc<dyn ProtocolDispatcher>>>,
    suspended: AtomicBool,
    disposed: AtomicBool,
}

impl Target {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: &str,
        name: &str,
        kind: TargetType,
        parent: Option<&Arc<Target>>,
        session_id: &str,
        router: Arc<SessionRouter>,
        manager: Weak<TargetManager>,
        suspended: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            name: Mutex::new(name.to_string()),
            kind,
            parent: parent.map(Arc::downgrade),
            session_id: session_id.to_string(),
            capabilities: kind.capabilities(),
            router,
            manager,
            info: Mutex::new(None),
            models: Mutex::new(Vec::new()),
            dispatchers: Mutex::new(HashMap::new()),
            suspended: AtomicBool::new(suspended),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn kind(&self) -> TargetType {
        self.kind
    }

    pub fn parent_target(&self) -> Option<Arc<Target>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target_manager(&self) -> Option<Arc<TargetManager>> {
        self.manager.upgrade()
    }

    pub(crate) fn router(&self) -> Arc<SessionRouter> {
        Arc::clone(&self.router)
    }

    /// True if this target grants every capability in `mask`.
    pub fn has_capabilities(&self, mask: u32) -> bool {
        self.capabilities & mask == mask
    }

    /// Last known backend metadata for this target, if any.
    pub fn target_info(&self) -> Option<TargetInfo> {
        self.info.lock().clone()
    }

    /// Updates title/url metadata in place. Identity never changes.
    pub(crate) fn update_target_info(&self, info: &TargetInfo) {
        if !info.title.is_empty() {
            *self.name.lock() = info.title.clone();
        }
        *self.info.lock() = Some(info.clone());
    }

    /// Sends a request on this target's session and awaits the response.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.router.send_message(&self.session_id, method, params).await
    }

    /// Registers the inbound event sink for one protocol domain.
    pub fn register_dispatcher(&self, domain: &str, dispatcher: Arc<dyn ProtocolDispatcher>) {
        self.dispatchers.lock().insert(domain.to_string(), dispatcher);
    }

    pub fn model(&self, kind: ModelKind) -> Option<Arc<dyn SdkModel>> {
        self.models
            .lock()
            .iter()
            .find(|(model_kind, _)| *model_kind == kind)
            .map(|(_, model)| Arc::clone(model))
    }

    /// All models in creation order.
    pub fn models(&self) -> Vec<(ModelKind, Arc<dyn SdkModel>)> {
        self.models.lock().clone()
    }

    /// Instantiates one model per registration whose required capabilities
    /// this target grants. A registration asking for a capability the target
    /// lacks is silently skipped.
    pub(crate) fn create_models(
        self: &Arc<Self>,
        registrations: &[crate::target_manager::ModelRegistration],
    ) {
        for registration in registrations {
            if !self.has_capabilities(registration.capabilities) {
                continue;
            }
            if self.model(registration.kind).is_some() {
                continue;
            }
            let model = (registration.factory)(self);
            self.models.lock().push((registration.kind, model));
        }
    }

    pub(crate) fn clear_models(&self) {
        self.models.lock().clear();
        self.dispatchers.lock().clear();
    }

    pub fn suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Suspends every model in parallel; resolves once all have. Already
    /// suspended targets are a no-op.
    pub async fn suspend(&self, reason: Option<&str>) -> Result<()> {
        if self.suspended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let models = self.models();
        let results = join_all(models.iter().map(|(_, model)| model.suspend_model(reason))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Mirror of [`Self::suspend`].
    pub async fn resume(&self) -> Result<()> {
        if !self.suspended.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let models = self.models();
        let results = join_all(models.iter().map(|(_, model)| model.resume_model())).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Releases models and detaches from the registry. Idempotent: disposing
    /// an already-disposed target is a no-op, which makes late, racy calls
    /// harmless.
    pub fn dispose(self: &Arc<Self>, reason: &str) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target = %self.id, reason, "disposing target");
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_target(self);
        }
        self.router.unregister_session(&self.session_id);
    }
}

impl SessionHandler for Target {
    fn dispatch_event(&self, method: &str, params: Value) {
        let domain = method.split('.').next().unwrap_or(method);
        let dispatcher = self.dispatchers.lock().get(domain).cloned();
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(method, params),
            None => tracing::trace!(method, target = %self.id, "no dispatcher for domain"),
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("session_id", &self.session_id)
            .field("suspended", &self.suspended())
            .finish()
    }
}
