//! Session transport and target lifecycle for remote debugging.
//!
//! The layering, bottom up:
//!
//! - [`connection`] - physical transport variants behind one narrow trait
//! - [`router`] - request/response correlation and per-session routing on
//!   one connection
//! - [`target`] - one debuggable endpoint plus the models attached to it
//! - [`target_manager`] - registry of live targets, typed lifecycle
//!   observers, global suspend/resume
//! - [`child_target_manager`] - auto-attach to child targets and parallel
//!   connections
//!
//! A minimal session:
//!
//! ```no_run
//! use std::sync::Arc;
//! use inspector_runtime::{
//!     ChildTargetManager, TargetManager, TargetType, WebSocketConnection,
//! };
//!
//! # async fn run() -> inspector_runtime::Result<()> {
//! let manager = TargetManager::new();
//! ChildTargetManager::register(&manager);
//! let connection = WebSocketConnection::new("ws://127.0.0.1:9229/session");
//! let root = manager.create_target(
//!     "main",
//!     "Main",
//!     TargetType::Frame,
//!     None,
//!     "",
//!     Some(connection),
//! )?;
//! let version = root.send("Browser.getVersion", serde_json::json!({})).await?;
//! # let _ = version;
//! # Ok(())
//! # }
//! ```

pub mod child_target_manager;
pub mod connection;
pub mod error;
pub mod router;
pub mod target;
pub mod target_manager;

#[cfg(test)]
pub(crate) mod testing;

pub use child_target_manager::ChildTargetManager;
pub use connection::{
    Connection, DisconnectCallback, DisconnectFuture, HostChannel, HostConnection,
    MessageCallback, ParallelConnection, StubConnection, WebSocketConnection,
};
pub use error::{Error, Result};
pub use router::{SessionHandler, SessionRouter};
pub use target::{
    ListenerId, ModelEventKind, ModelEventListener, ModelEvents, ModelKind, ProtocolDispatcher,
    SdkModel, Target, TargetType, capability,
};
pub use target_manager::{
    AttachCallback, ModelFactory, ModelListenerHandle, ModelObserver, ModelRegistration,
    SuspendStateObserver, TargetManager, TargetObserver,
};
