//! Process-wide registry of live targets and their models.
//!
//! The manager is the single writer of target/model existence: everything
//! else either reads it or calls its mutating methods. It fans out typed
//! add/remove notifications to registered observers and coordinates global
//! suspend/resume across every live target.
//!
//! Construct one explicitly and pass it around; isolated instances keep tests
//! independent instead of sharing a global singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::router::{SessionHandler, SessionRouter};
use crate::target::{
    ListenerId, ModelEventKind, ModelEventListener, ModelKind, SdkModel, Target, TargetType,
};

/// Factory producing a model instance for a freshly created target.
pub type ModelFactory = Arc<dyn Fn(&Arc<Target>) -> Arc<dyn SdkModel> + Send + Sync>;

/// Startup-time registration of one model class.
#[derive(Clone)]
pub struct ModelRegistration {
    pub kind: ModelKind,
    /// Capabilities a target must grant for this model to be instantiated.
    pub capabilities: u32,
    pub factory: ModelFactory,
}

/// Observer of target add/remove lifecycle.
pub trait TargetObserver: Send + Sync {
    fn target_added(&self, target: &Arc<Target>);
    fn target_removed(&self, target: &Arc<Target>);
    fn target_info_changed(&self, _target: &Arc<Target>) {}
}

/// Observer of model add/remove lifecycle for one model class.
pub trait ModelObserver: Send + Sync {
    fn model_added(&self, target: &Arc<Target>, model: &Arc<dyn SdkModel>);
    fn model_removed(&self, target: &Arc<Target>, model: &Arc<dyn SdkModel>);
}

/// Observer of the global suspend flag.
pub trait SuspendStateObserver: Send + Sync {
    fn suspend_state_changed(&self, suspended: bool);
}

/// Async attach-policy hook supplied by the embedder, invoked once per newly
/// attached child target before the child is told to continue.
#[async_trait]
pub trait AttachCallback: Send + Sync {
    async fn attached_to_target(&self, target: &Arc<Target>, waiting_for_debugger: bool);
}

/// Handle for removing a listener installed via
/// [`TargetManager::add_model_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelListenerHandle(u64);

struct ModelListenerRegistration {
    id: u64,
    kind: ModelKind,
    event: ModelEventKind,
    listener: ModelEventListener,
    /// (target id, listener id) per model this listener is attached to.
    attached: Vec<(String, ListenerId)>,
}

#[derive(Default)]
struct SuspendState {
    suspended: bool,
    reason: Option<String>,
}

/// Registry of all live targets.
pub struct TargetManager {
    targets: Mutex<Vec<Arc<Target>>>,
    factories: Mutex<Vec<ModelRegistration>>,
    target_observers: Mutex<Vec<Arc<dyn TargetObserver>>>,
    model_observers: Mutex<HashMap<ModelKind, Vec<Arc<dyn ModelObserver>>>>,
    suspend_observers: Mutex<Vec<Arc<dyn SuspendStateObserver>>>,
    model_listeners: Mutex<Vec<ModelListenerRegistration>>,
    next_listener_id: AtomicU64,
    suspend_state: Mutex<SuspendState>,
    attach_callback: Mutex<Option<Arc<dyn AttachCallback>>>,
}

impl TargetManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(Vec::new()),
            factories: Mutex::new(Vec::new()),
            target_observers: Mutex::new(Vec::new()),
            model_observers: Mutex::new(HashMap::new()),
            suspend_observers: Mutex::new(Vec::new()),
            model_listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            suspend_state: Mutex::new(SuspendState::default()),
            attach_callback: Mutex::new(None),
        })
    }

    /// Registers a model class. Intended for startup; targets created before
    /// the registration do not grow the model retroactively.
    pub fn register_model(&self, registration: ModelRegistration) {
        self.factories.lock().push(registration);
    }

    /// Installs the embedder's attach-policy hook.
    pub fn set_attach_callback(&self, callback: Option<Arc<dyn AttachCallback>>) {
        *self.attach_callback.lock() = callback;
    }

    pub(crate) fn attach_callback(&self) -> Option<Arc<dyn AttachCallback>> {
        self.attach_callback.lock().clone()
    }

    /// Creates a target and runs the full add sequence: construct, create
    /// models, insert into the registry, notify target observers, notify
    /// model observers, attach pending model-level listeners.
    ///
    /// A root target (no parent) needs a connection to run its session
    /// router on; child targets share their parent's router.
    pub fn create_target(
        self: &Arc<Self>,
        id: &str,
        name: &str,
        kind: TargetType,
        parent: Option<&Arc<Target>>,
        session_id: &str,
        connection: Option<Arc<dyn Connection>>,
    ) -> Result<Arc<Target>> {
        let router = match parent {
            Some(parent) => parent.router(),
            None => SessionRouter::new(connection.ok_or(Error::NoConnection)?),
        };
        // Targets created while a global suspend is in effect start out
        // suspended, so the transition never races target creation.
        let suspended = self.suspend_state.lock().suspended;
        let target = Target::new(
            id,
            name,
            kind,
            parent,
            session_id,
            router.clone(),
            Arc::downgrade(self),
            suspended,
        );
        router.register_session(
            session_id,
            Arc::downgrade(&target) as Weak<dyn SessionHandler>,
        );

        let registrations = self.factories.lock().clone();
        target.create_models(&registrations);

        self.targets.lock().push(Arc::clone(&target));
        tracing::debug!(target = id, ?kind, session = session_id, "target created");

        for observer in self.target_observers_snapshot() {
            observer.target_added(&target);
        }
        for (model_kind, model) in target.models() {
            for observer in self.model_observers_snapshot(model_kind) {
                observer.model_added(&target, &model);
            }
        }
        self.attach_model_listeners(&target);

        Ok(target)
    }

    /// Removes a target from the registry, running the exact inverse of the
    /// add sequence: model-removal notifications first (while the models are
    /// still valid), then target-removal, then listener stripping. A target
    /// not present in the registry is a silent no-op, since double-removal
    /// can legitimately race with detach notifications.
    pub fn remove_target(&self, target: &Arc<Target>) {
        let found = {
            let mut targets = self.targets.lock();
            match targets.iter().position(|t| Arc::ptr_eq(t, target)) {
                Some(index) => {
                    targets.remove(index);
                    true
                }
                None => false,
            }
        };
        if !found {
            return;
        }
        tracing::debug!(target = target.id(), "target removed");

        let models = target.models();
        for (model_kind, model) in &models {
            for observer in self.model_observers_snapshot(*model_kind) {
                observer.model_removed(target, model);
            }
        }
        for observer in self.target_observers_snapshot() {
            observer.target_removed(target);
        }
        self.detach_model_listeners(target);
        for (_, model) in &models {
            model.dispose_model();
        }
        target.clear_models();
    }

    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.targets.lock().clone()
    }

    pub fn target_by_id(&self, id: &str) -> Option<Arc<Target>> {
        self.targets.lock().iter().find(|t| t.id() == id).cloned()
    }

    /// The first target ever registered, by convention the root.
    pub fn main_target(&self) -> Option<Arc<Target>> {
        self.targets.lock().first().cloned()
    }

    /// All live models of the given class, in target-creation order.
    pub fn models(&self, kind: ModelKind) -> Vec<Arc<dyn SdkModel>> {
        self.targets
            .lock()
            .iter()
            .filter_map(|target| target.model(kind))
            .collect()
    }

    /// Registers a model observer and immediately backfills `model_added`
    /// for every matching model that already exists, so an observer never
    /// misses pre-existing state. Registration happens before the backfill.
    pub fn observe_models(&self, kind: ModelKind, observer: Arc<dyn ModelObserver>) {
        self.model_observers
            .lock()
            .entry(kind)
            .or_default()
            .push(Arc::clone(&observer));
        for target in self.targets() {
            if let Some(model) = target.model(kind) {
                observer.model_added(&target, &model);
            }
        }
    }

    /// Cancels future notifications. Already-delivered events stay delivered;
    /// safe to call from within an observer callback.
    pub fn unobserve_models(&self, kind: ModelKind, observer: &Arc<dyn ModelObserver>) {
        if let Some(observers) = self.model_observers.lock().get_mut(&kind) {
            observers.retain(|o| !Arc::ptr_eq(o, observer));
        }
    }

    /// Registers a target observer, backfilling `target_added` for every
    /// live target.
    pub fn observe_targets(&self, observer: Arc<dyn TargetObserver>) {
        self.target_observers.lock().push(Arc::clone(&observer));
        for target in self.targets() {
            observer.target_added(&target);
        }
    }

    pub fn unobserve_targets(&self, observer: &Arc<dyn TargetObserver>) {
        self.target_observers
            .lock()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub fn observe_suspend_state(&self, observer: Arc<dyn SuspendStateObserver>) {
        self.suspend_observers.lock().push(observer);
    }

    pub fn unobserve_suspend_state(&self, observer: &Arc<dyn SuspendStateObserver>) {
        self.suspend_observers
            .lock()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub(crate) fn notify_target_info_changed(&self, target: &Arc<Target>) {
        for observer in self.target_observers_snapshot() {
            observer.target_info_changed(target);
        }
    }

    /// Attaches an event listener to every current and future model of the
    /// given class. Stripped automatically when a target is removed.
    pub fn add_model_listener(
        &self,
        kind: ModelKind,
        event: ModelEventKind,
        listener: ModelEventListener,
    ) -> ModelListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let mut attached = Vec::new();
        for target in self.targets() {
            if let Some(model) = target.model(kind) {
                let listener_id = model.events().add_listener(event, Arc::clone(&listener));
                attached.push((target.id().to_string(), listener_id));
            }
        }
        self.model_listeners.lock().push(ModelListenerRegistration {
            id,
            kind,
            event,
            listener,
            attached,
        });
        ModelListenerHandle(id)
    }

    pub fn remove_model_listener(&self, handle: ModelListenerHandle) {
        let registration = {
            let mut registrations = self.model_listeners.lock();
            match registrations.iter().position(|r| r.id == handle.0) {
                Some(index) => registrations.remove(index),
                None => return,
            }
        };
        for (target_id, listener_id) in registration.attached {
            if let Some(target) = self.target_by_id(&target_id) {
                if let Some(model) = target.model(registration.kind) {
                    model.events().remove_listener(registration.event, listener_id);
                }
            }
        }
    }

    fn attach_model_listeners(&self, target: &Arc<Target>) {
        let mut registrations = self.model_listeners.lock();
        for registration in registrations.iter_mut() {
            if let Some(model) = target.model(registration.kind) {
                let listener_id = model
                    .events()
                    .add_listener(registration.event, Arc::clone(&registration.listener));
                registration
                    .attached
                    .push((target.id().to_string(), listener_id));
            }
        }
    }

    fn detach_model_listeners(&self, target: &Arc<Target>) {
        let mut registrations = self.model_listeners.lock();
        for registration in registrations.iter_mut() {
            registration.attached.retain(|(target_id, listener_id)| {
                if target_id == target.id() {
                    if let Some(model) = target.model(registration.kind) {
                        model
                            .events()
                            .remove_listener(registration.event, *listener_id);
                    }
                    false
                } else {
                    true
                }
            });
        }
    }

    pub fn all_targets_suspended(&self) -> bool {
        self.suspend_state.lock().suspended
    }

    /// Suspends every live target. Idempotent: a second call while already
    /// suspended is a no-op. The flag flip and the single state-changed
    /// notification happen before the per-target fan-out is awaited, so
    /// late-arriving target creation observes the new state immediately.
    pub async fn suspend_all_targets(&self, reason: Option<&str>) {
        {
            let mut state = self.suspend_state.lock();
            if state.suspended {
                return;
            }
            state.suspended = true;
            state.reason = reason.map(str::to_string);
        }
        for observer in self.suspend_observers_snapshot() {
            observer.suspend_state_changed(true);
        }
        let targets = self.targets();
        let results = join_all(targets.iter().map(|target| target.suspend(reason))).await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!(error = %e, "target suspend failed");
            }
        }
    }

    /// Mirror of [`Self::suspend_all_targets`].
    pub async fn resume_all_targets(&self) {
        {
            let mut state = self.suspend_state.lock();
            if !state.suspended {
                return;
            }
            state.suspended = false;
            state.reason = None;
        }
        for observer in self.suspend_observers_snapshot() {
            observer.suspend_state_changed(false);
        }
        let targets = self.targets();
        let results = join_all(targets.iter().map(|target| target.resume())).await;
        for result in results {
            if let Err(e) = result {
                tracing::warn!(error = %e, "target resume failed");
            }
        }
    }

    fn target_observers_snapshot(&self) -> Vec<Arc<dyn TargetObserver>> {
        self.target_observers.lock().clone()
    }

    fn model_observers_snapshot(&self, kind: ModelKind) -> Vec<Arc<dyn ModelObserver>> {
        self.model_observers
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    fn suspend_observers_snapshot(&self) -> Vec<Arc<dyn SuspendStateObserver>> {
        self.suspend_observers.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ModelEvents, capability};
    use crate::testing::FakeConnection;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    const ECHO: ModelKind = ModelKind("Echo");
    const ECHO_EVENT: ModelEventKind = ModelEventKind("EchoEvent");

    struct EchoModel {
        events: ModelEvents,
        suspends: AtomicUsize,
        resumes: AtomicUsize,
    }

    #[async_trait]
    impl SdkModel for EchoModel {
        fn kind(&self) -> ModelKind {
            ECHO
        }

        fn events(&self) -> &ModelEvents {
            &self.events
        }

        async fn suspend_model(&self, _reason: Option<&str>) -> Result<()> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resume_model(&self) -> Result<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn register_echo(manager: &Arc<TargetManager>) {
        manager.register_model(ModelRegistration {
            kind: ECHO,
            capabilities: capability::JS,
            factory: Arc::new(|_target| {
                Arc::new(EchoModel {
                    events: ModelEvents::new(),
                    suspends: AtomicUsize::new(0),
                    resumes: AtomicUsize::new(0),
                }) as Arc<dyn SdkModel>
            }),
        });
    }

    struct Recorder {
        calls: StdMutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl TargetObserver for Recorder {
        fn target_added(&self, target: &Arc<Target>) {
            self.push(format!("target_added {}", target.id()));
        }

        fn target_removed(&self, target: &Arc<Target>) {
            self.push(format!("target_removed {}", target.id()));
        }
    }

    impl ModelObserver for Recorder {
        fn model_added(&self, target: &Arc<Target>, model: &Arc<dyn SdkModel>) {
            self.push(format!("model_added {} {}", model.kind(), target.id()));
        }

        fn model_removed(&self, target: &Arc<Target>, model: &Arc<dyn SdkModel>) {
            self.push(format!("model_removed {} {}", model.kind(), target.id()));
        }
    }

    impl SuspendStateObserver for Recorder {
        fn suspend_state_changed(&self, suspended: bool) {
            self.push(format!("suspend_state_changed {suspended}"));
        }
    }

    fn frame_target(manager: &Arc<TargetManager>, id: &str) -> Arc<Target> {
        manager
            .create_target(
                id,
                id,
                TargetType::Frame,
                None,
                "",
                Some(FakeConnection::new() as Arc<dyn Connection>),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn observe_models_backfills_existing_models_synchronously() {
        let manager = TargetManager::new();
        register_echo(&manager);
        frame_target(&manager, "t1");
        frame_target(&manager, "t2");

        let recorder = Recorder::new();
        manager.observe_models(ECHO, recorder.clone() as Arc<dyn ModelObserver>);

        assert_eq!(
            recorder.calls(),
            vec![
                "model_added Echo t1".to_string(),
                "model_added Echo t2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn create_remove_runs_symmetric_observer_sequence() {
        let manager = TargetManager::new();
        register_echo(&manager);
        let recorder = Recorder::new();
        manager.observe_targets(recorder.clone() as Arc<dyn TargetObserver>);
        manager.observe_models(ECHO, recorder.clone() as Arc<dyn ModelObserver>);

        let target = frame_target(&manager, "t1");
        manager.remove_target(&target);

        assert_eq!(
            recorder.calls(),
            vec![
                "target_added t1".to_string(),
                "model_added Echo t1".to_string(),
                "model_removed Echo t1".to_string(),
                "target_removed t1".to_string()
            ]
        );
        assert!(manager.targets().is_empty());
        assert!(manager.models(ECHO).is_empty());
    }

    #[tokio::test]
    async fn dispose_twice_notifies_once() {
        let manager = TargetManager::new();
        register_echo(&manager);
        let recorder = Recorder::new();
        manager.observe_targets(recorder.clone() as Arc<dyn TargetObserver>);

        let target = frame_target(&manager, "t1");
        target.dispose("first");
        target.dispose("second");

        assert_eq!(
            recorder.calls(),
            vec!["target_added t1".to_string(), "target_removed t1".to_string()]
        );
    }

    #[tokio::test]
    async fn models_requiring_missing_capabilities_are_skipped() {
        let manager = TargetManager::new();
        register_echo(&manager);

        // Browser targets grant no JS capability, so no Echo model.
        let browser = manager
            .create_target(
                "b1",
                "browser",
                TargetType::Browser,
                None,
                "",
                Some(FakeConnection::new() as Arc<dyn Connection>),
            )
            .unwrap();

        assert!(browser.model(ECHO).is_none());
        assert!(manager.models(ECHO).is_empty());
    }

    #[tokio::test]
    async fn suspend_all_is_idempotent_and_notifies_once() {
        let manager = TargetManager::new();
        register_echo(&manager);
        let recorder = Recorder::new();
        manager.observe_suspend_state(recorder.clone() as Arc<dyn SuspendStateObserver>);
        let target = frame_target(&manager, "t1");
        let model = target
            .model(ECHO)
            .unwrap()
            .downcast_arc::<EchoModel>()
            .map_err(|_| ())
            .unwrap();

        manager.suspend_all_targets(Some("test")).await;
        manager.suspend_all_targets(Some("test")).await;

        assert_eq!(recorder.calls(), vec!["suspend_state_changed true".to_string()]);
        assert_eq!(model.suspends.load(Ordering::SeqCst), 1);
        assert!(manager.all_targets_suspended());

        manager.resume_all_targets().await;
        assert_eq!(model.resumes.load(Ordering::SeqCst), 1);
        assert!(!manager.all_targets_suspended());
    }

    #[tokio::test]
    async fn targets_created_during_suspend_start_suspended() {
        let manager = TargetManager::new();
        register_echo(&manager);
        manager.suspend_all_targets(None).await;

        let target = frame_target(&manager, "late");

        assert!(target.suspended());
    }

    #[tokio::test]
    async fn model_listeners_attach_to_current_and_future_models() {
        let manager = TargetManager::new();
        register_echo(&manager);
        let existing = frame_target(&manager, "t1");

        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let handle = manager.add_model_listener(
            ECHO,
            ECHO_EVENT,
            Arc::new(move |data: &Value| {
                sink.lock().unwrap().push(data.clone());
            }),
        );

        let future = frame_target(&manager, "t2");
        existing
            .model(ECHO)
            .unwrap()
            .events()
            .emit(ECHO_EVENT, &serde_json::json!(1));
        future
            .model(ECHO)
            .unwrap()
            .events()
            .emit(ECHO_EVENT, &serde_json::json!(2));
        assert_eq!(fired.lock().unwrap().len(), 2);

        manager.remove_model_listener(handle);
        existing
            .model(ECHO)
            .unwrap()
            .events()
            .emit(ECHO_EVENT, &serde_json::json!(3));
        assert_eq!(fired.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unobserve_from_within_callback_is_safe() {
        let manager = TargetManager::new();
        register_echo(&manager);

        struct SelfRemoving {
            manager: Weak<TargetManager>,
            slot: StdMutex<Option<Arc<dyn ModelObserver>>>,
            seen: AtomicUsize,
        }

        impl ModelObserver for SelfRemoving {
            fn model_added(&self, _target: &Arc<Target>, _model: &Arc<dyn SdkModel>) {
                self.seen.fetch_add(1, Ordering::SeqCst);
                if let (Some(manager), Some(observer)) =
                    (self.manager.upgrade(), self.slot.lock().unwrap().take())
                {
                    manager.unobserve_models(ECHO, &observer);
                }
            }

            fn model_removed(&self, _target: &Arc<Target>, _model: &Arc<dyn SdkModel>) {}
        }

        let observer = Arc::new(SelfRemoving {
            manager: Arc::downgrade(&manager),
            slot: StdMutex::new(None),
            seen: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn ModelObserver> = observer.clone();
        *observer.slot.lock().unwrap() = Some(as_dyn.clone());
        manager.observe_models(ECHO, as_dyn);

        frame_target(&manager, "t1");
        frame_target(&manager, "t2");

        assert_eq!(observer.seen.load(Ordering::SeqCst), 1);
    }
}
