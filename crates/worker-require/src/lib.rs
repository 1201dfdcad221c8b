//! Worker Require
//!
//! Run a module on its own thread and call it as if it were local.
//!
//! Requiring a module resolves it to a file and returns a [`ModuleProxy`].
//! Calls on the proxy are sent to a worker thread that loaded the module;
//! arguments and results cross the boundary through a
//! [`HandlerRegistry`], which decides per value whether it is copied,
//! snapshotted through its cloneable marker, or kept where it is and
//! reached through a live [`Remote`].
//!
//! # Architecture
//!
//! - Each worker is a dedicated OS thread with a current-thread runtime
//! - Workers are cached per resolved path and shared unless caching is off
//! - Callbacks, promises and modules passed as arguments stay on their
//!   side and are called back over a dedicated channel
//! - Setting `WORKER_REQUIRE=false` loads modules in-process instead
//!
//! ```ignore
//! let loader = NativeLoader::new();
//! loader.register("math", math::exports);
//! WorkerRequire::new(loader).install().ok();
//!
//! let math = worker_require::require("./math", RequireOptions::default())?;
//! let sum = math.call("add", vec![1.into(), 2.into()]).await?;
//! math.destroy().await;
//! ```

mod cache;
mod channel;
mod cloneable;
mod command;
mod config;
mod error;
mod handle;
mod handlers;
mod loader;
mod proxy;
mod remote;
mod require;
mod rpc;
mod value;
mod worker;

pub use cache::HandleCache;
pub use channel::{Inbox, Port, message_channel};
pub use cloneable::{TO_CLONEABLE, is_cloneable};
pub use config::{ENV_SWITCH, RequireOptions, Settings};
pub use error::{CallError, RequireError, TransferError};
pub use handle::WorkerHandle;
pub use handlers::{
    CloneableHandler, ErrorHandler, HandlerRegistry, MAX_SCAN_DEPTH, Payload, ProxyHandler,
    TransferHandler, WireValue, has_functions,
};
pub use loader::{LoadError, ModuleLoader, ModuleManifest, NativeLoader, resolve};
pub use proxy::{DESTROY, Destroy, Member, ModuleProxy, Property, ProxyFactory};
pub use remote::Remote;
pub use require::{WorkerRequire, WorkerRequireBuilder};
pub use rpc::expose;
pub use value::{CallResult, Cloneable, ErrorValue, Function, Instance, Promise, RegExp, Value};
pub use worker::{WorkerThread, spawn_worker};

/// Require a module relative to the calling source file, using the
/// installed context.
#[track_caller]
pub fn require(id: &str, options: RequireOptions) -> Result<ModuleProxy, RequireError> {
    WorkerRequire::global()?.require(id, options)
}

/// Factory variant of [`require`], using the installed context.
#[track_caller]
pub fn create_require(id: &str, options: RequireOptions) -> Result<ProxyFactory, RequireError> {
    WorkerRequire::global()?.create_require(id, options)
}
