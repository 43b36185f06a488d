//! Auto-attach to child targets spawned by an owning target.
//!
//! One [`ChildTargetManager`] is instantiated as a model on every target that
//! grants the TARGET capability. It enables the backend's auto-attach
//! protocol, creates a [`Target`] for every child the backend attaches
//! (nested frames, workers, worklets), and tears the child down again on
//! detach. It also hands out parallel connections: second, independent
//! logical pipes to the owning target's real backend id.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::connection::{Connection, MessageCallback, ParallelConnection};
use crate::error::{Error, Result};
use crate::target::{
    ModelEventKind, ModelEvents, ModelKind, ProtocolDispatcher, SdkModel, Target, TargetType,
    capability,
};
use crate::target_manager::{ModelRegistration, TargetManager};
use inspector_protocol::{
    AttachToTargetParams, AttachToTargetResponse, AttachedToTargetParams,
    DetachedFromTargetParams, GetTargetInfoResponse, SetAutoAttachParams, TargetCreatedParams,
    TargetDestroyedParams, TargetInfo, TargetInfoChangedParams,
};

pub const CHILD_TARGET_MANAGER: ModelKind = ModelKind("ChildTargetManager");

pub const TARGET_CREATED: ModelEventKind = ModelEventKind("TargetCreated");
pub const TARGET_DESTROYED: ModelEventKind = ModelEventKind("TargetDestroyed");
pub const TARGET_INFO_CHANGED: ModelEventKind = ModelEventKind("TargetInfoChanged");

/// The owning target's id as the backend knows it.
///
/// The primary target's nominal id may be a stable local alias, so the real
/// id is resolved once on first use and cached.
enum BackendTargetId {
    Unresolved,
    Resolved(String),
}

/// Per-target model implementing the auto-attach protocol.
pub struct ChildTargetManager {
    target: Weak<Target>,
    events: ModelEvents,
    children_by_session: Mutex<HashMap<String, Arc<Target>>>,
    children_by_target_id: Mutex<HashMap<String, Arc<Target>>>,
    /// Session ids belonging to parallel connections this model created;
    /// their detach only removes bookkeeping, never a child target.
    parallel_sessions: Mutex<HashSet<String>>,
    target_infos: Mutex<HashMap<String, TargetInfo>>,
    backend_target_id: Mutex<BackendTargetId>,
    next_anonymous_index: AtomicU64,
}

/// Fire-and-forget request helper. Outside a runtime (plain unit tests) the
/// request is dropped with a log line instead of panicking.
fn spawn_fire_and_forget(future: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::debug!("no async runtime, dropping background request"),
    }
}

impl ChildTargetManager {
    /// Registers this model class with the manager. Instantiated for every
    /// target granting the TARGET capability.
    pub fn register(manager: &Arc<TargetManager>) {
        manager.register_model(ModelRegistration {
            kind: CHILD_TARGET_MANAGER,
            capabilities: capability::TARGET,
            factory: Arc::new(|target| ChildTargetManager::new(target) as Arc<dyn SdkModel>),
        });
    }

    fn new(target: &Arc<Target>) -> Arc<Self> {
        let model = Arc::new(Self {
            target: Arc::downgrade(target),
            events: ModelEvents::new(),
            children_by_session: Mutex::new(HashMap::new()),
            children_by_target_id: Mutex::new(HashMap::new()),
            parallel_sessions: Mutex::new(HashSet::new()),
            target_infos: Mutex::new(HashMap::new()),
            backend_target_id: Mutex::new(BackendTargetId::Unresolved),
            next_anonymous_index: AtomicU64::new(0),
        });
        target.register_dispatcher("Target", model.clone());
        // Wait-on-start avoids racing child execution against instrumentation
        // setup, unless a global suspend is already in effect.
        let wait_on_start = !target.suspended();
        let this = Arc::clone(&model);
        spawn_fire_and_forget(async move {
            if let Err(e) = this.set_auto_attach(wait_on_start).await {
                tracing::warn!(error = %e, "enabling auto-attach failed");
            }
        });
        model
    }

    /// Live child targets, in no particular order.
    pub fn child_targets(&self) -> Vec<Arc<Target>> {
        self.children_by_session.lock().values().cloned().collect()
    }

    /// Last known backend metadata for discovered targets.
    pub fn target_infos(&self) -> Vec<TargetInfo> {
        self.target_infos.lock().values().cloned().collect()
    }

    async fn set_auto_attach(&self, wait_for_debugger_on_start: bool) -> Result<()> {
        let Some(target) = self.target.upgrade() else {
            return Ok(());
        };
        let params = serde_json::to_value(SetAutoAttachParams {
            auto_attach: true,
            wait_for_debugger_on_start,
            flatten: true,
        })?;
        target.send("Target.setAutoAttach", params).await?;
        Ok(())
    }

    pub(crate) async fn attached_to_target(self: Arc<Self>, params: AttachedToTargetParams) {
        let Some(parent) = self.target.upgrade() else {
            return;
        };
        let Some(manager) = parent.target_manager() else {
            return;
        };
        let info = params.target_info;
        if info.target_id == parent.id() {
            // The backend re-announces the session of the target we are
            // already attached to; never create a self-loop.
            tracing::debug!(target = %info.target_id, "ignoring attach to own target");
            return;
        }
        if self.children_by_session.lock().contains_key(&params.session_id) {
            tracing::warn!(
                session = %params.session_id,
                "duplicate attach for live session, ignoring"
            );
            return;
        }

        let kind = Self::target_type_for(&info.kind);
        let name = self.display_name(&info);
        let child = match manager.create_target(
            &info.target_id,
            &name,
            kind,
            Some(&parent),
            &params.session_id,
            None,
        ) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create child target");
                return;
            }
        };
        child.update_target_info(&info);
        self.children_by_session
            .lock()
            .insert(params.session_id.clone(), Arc::clone(&child));
        self.children_by_target_id
            .lock()
            .insert(info.target_id.clone(), Arc::clone(&child));
        self.target_infos
            .lock()
            .insert(info.target_id.clone(), info.clone());
        if let Ok(data) = serde_json::to_value(&info) {
            self.events.emit(TARGET_CREATED, &data);
        }

        // The embedder decides whether the child may run; only then is a
        // waiting child told to continue.
        if let Some(callback) = manager.attach_callback() {
            callback
                .attached_to_target(&child, params.waiting_for_debugger)
                .await;
        }
        if params.waiting_for_debugger && !child.disposed() {
            if let Err(e) = child
                .send("Runtime.runIfWaitingForDebugger", serde_json::json!({}))
                .await
            {
                tracing::debug!(error = %e, "runIfWaitingForDebugger failed");
            }
        }
    }

    pub(crate) fn detached_from_target(&self, session_id: &str) {
        if self.parallel_sessions.lock().remove(session_id) {
            return;
        }
        let child = self.children_by_session.lock().remove(session_id);
        match child {
            Some(child) => {
                self.children_by_target_id.lock().remove(child.id());
                child.dispose("target detached");
            }
            None => {
                tracing::debug!(session = session_id, "detach for unknown session, ignoring")
            }
        }
    }

    pub(crate) fn target_created(&self, info: TargetInfo) {
        self.target_infos
            .lock()
            .insert(info.target_id.clone(), info.clone());
        if let Ok(data) = serde_json::to_value(&info) {
            self.events.emit(TARGET_CREATED, &data);
        }
    }

    pub(crate) fn target_destroyed(&self, target_id: &str) {
        self.target_infos.lock().remove(target_id);
        self.events
            .emit(TARGET_DESTROYED, &serde_json::json!({ "targetId": target_id }));
    }

    pub(crate) fn target_info_changed(&self, info: TargetInfo) {
        self.target_infos
            .lock()
            .insert(info.target_id.clone(), info.clone());
        let child = self.children_by_target_id.lock().get(&info.target_id).cloned();
        if let Some(child) = child {
            child.update_target_info(&info);
            if let Some(manager) = child.target_manager() {
                manager.notify_target_info_changed(&child);
            }
        }
        if let Ok(data) = serde_json::to_value(&info) {
            self.events.emit(TARGET_INFO_CHANGED, &data);
        }
    }

    /// Opens a second, independent logical channel to the owning target
    /// without reattaching via a child relationship: attaches a new
    /// flattened session to the target's real backend id and wraps it in a
    /// [`ParallelConnection`] registered with the session router.
    pub async fn create_parallel_connection(
        self: &Arc<Self>,
        on_message: MessageCallback,
    ) -> Result<Arc<ParallelConnection>> {
        let target = self
            .target
            .upgrade()
            .ok_or_else(|| Error::TargetDisposed("owning target gone".to_string()))?;
        let target_id = self.resolve_backend_target_id(&target).await?;
        let params = serde_json::to_value(AttachToTargetParams {
            target_id,
            flatten: true,
        })?;
        let response = target.send("Target.attachToTarget", params).await?;
        let response: AttachToTargetResponse = serde_json::from_value(response)?;
        let session_id = response.session_id;

        let router = target.router();
        let connection = ParallelConnection::new(router.connection(), session_id.clone());
        connection.set_on_message(on_message);
        router.register_proxy_session(&session_id, Arc::clone(&connection));
        self.parallel_sessions.lock().insert(session_id.clone());

        let weak_router = Arc::downgrade(&router);
        let weak_target = self.target.clone();
        let weak_self = Arc::downgrade(self);
        let detach_session = session_id.clone();
        connection.set_on_disconnect(Some(Arc::new(move |_reason: &str| {
            if let Some(router) = weak_router.upgrade() {
                router.unregister_session(&detach_session);
            }
            if let Some(model) = weak_self.upgrade() {
                model.parallel_sessions.lock().remove(&detach_session);
            }
            if let Some(target) = weak_target.upgrade() {
                let params = serde_json::json!({ "sessionId": detach_session });
                spawn_fire_and_forget(async move {
                    if let Err(e) = target.send("Target.detachFromTarget", params).await {
                        tracing::debug!(error = %e, "detachFromTarget failed");
                    }
                });
            }
        })));
        Ok(connection)
    }

    async fn resolve_backend_target_id(&self, target: &Arc<Target>) -> Result<String> {
        if let BackendTargetId::Resolved(id) = &*self.backend_target_id.lock() {
            return Ok(id.clone());
        }
        let response = target
            .send("Target.getTargetInfo", serde_json::json!({}))
            .await?;
        let response: GetTargetInfoResponse = serde_json::from_value(response)?;
        let id = response.target_info.target_id;
        *self.backend_target_id.lock() = BackendTargetId::Resolved(id.clone());
        Ok(id)
    }

    /// Human-readable name: title, else last URL path component, else a
    /// synthetic `#N` for anonymous targets.
    fn display_name(&self, info: &TargetInfo) -> String {
        if !info.title.is_empty() {
            return info.title.clone();
        }
        if let Ok(parsed) = Url::parse(&info.url) {
            let component = parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last());
            if let Some(component) = component {
                return component.to_string();
            }
        }
        format!("#{}", self.next_anonymous_index.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn target_type_for(kind: &str) -> TargetType {
        match kind {
            "page" | "iframe" | "webview" => TargetType::Frame,
            "worker" => TargetType::Worker,
            "shared_worker" => TargetType::SharedWorker,
            "service_worker" => TargetType::ServiceWorker,
            "node" => TargetType::Node,
            "browser" => TargetType::Browser,
            "auction_worklet" => TargetType::AuctionWorklet,
            other => {
                tracing::debug!(kind = other, "unknown target type, treating as frame");
                TargetType::Frame
            }
        }
    }
}

impl ProtocolDispatcher for ChildTargetManager {
    fn dispatch(self: Arc<Self>, method: &str, params: Value) {
        match method {
            "Target.attachedToTarget" => {
                match serde_json::from_value::<AttachedToTargetParams>(params) {
                    Ok(params) => spawn_fire_and_forget(self.attached_to_target(params)),
                    Err(e) => tracing::warn!(error = %e, "malformed attachedToTarget"),
                }
            }
            "Target.detachedFromTarget" => {
                match serde_json::from_value::<DetachedFromTargetParams>(params) {
                    Ok(params) => self.detached_from_target(&params.session_id),
                    Err(e) => tracing::warn!(error = %e, "malformed detachedFromTarget"),
                }
            }
            "Target.targetCreated" => {
                match serde_json::from_value::<TargetCreatedParams>(params) {
                    Ok(params) => self.target_created(params.target_info),
                    Err(e) => tracing::warn!(error = %e, "malformed targetCreated"),
                }
            }
            "Target.targetDestroyed" => {
                match serde_json::from_value::<TargetDestroyedParams>(params) {
                    Ok(params) => self.target_destroyed(&params.target_id),
                    Err(e) => tracing::warn!(error = %e, "malformed targetDestroyed"),
                }
            }
            "Target.targetInfoChanged" => {
                match serde_json::from_value::<TargetInfoChangedParams>(params) {
                    Ok(params) => self.target_info_changed(params.target_info),
                    Err(e) => tracing::warn!(error = %e, "malformed targetInfoChanged"),
                }
            }
            other => tracing::debug!(method = other, "unhandled Target event"),
        }
    }
}

#[async_trait]
impl SdkModel for ChildTargetManager {
    fn kind(&self) -> ModelKind {
        CHILD_TARGET_MANAGER
    }

    fn events(&self) -> &ModelEvents {
        &self.events
    }

    /// Suspending only stops waiting on new children at startup; existing
    /// child targets stay attached.
    async fn suspend_model(&self, _reason: Option<&str>) -> Result<()> {
        self.set_auto_attach(false).await
    }

    async fn resume_model(&self) -> Result<()> {
        self.set_auto_attach(true).await
    }

    fn dispose_model(&self) {
        let children: Vec<_> = {
            let mut by_session = self.children_by_session.lock();
            by_session.drain().map(|(_, child)| child).collect()
        };
        self.children_by_target_id.lock().clear();
        for child in children {
            child.dispose("parent target disposed");
        }
    }
}
