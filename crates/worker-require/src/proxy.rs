//! Client-side module proxies.
//!
//! A [`ModuleProxy`] stands in for a module whose shape is unknown until it
//! is called. Property access builds a call path ([`Member`]); invoking a
//! member sends the path and arguments to the worker that owns the module.
//!
//! ```ignore
//! let math = require.require("./math", RequireOptions::default())?;
//! let sum = math.member("add").invoke(vec![1.into(), 2.into()]).await?;
//! let deep = math.member("nested").call("answer", vec![]).await?;
//! math.destroy().await;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::cache::HandleCache;
use crate::cloneable::TO_CLONEABLE;
use crate::config::RequireOptions;
use crate::error::{CallError, RequireError};
use crate::handle::WorkerHandle;
use crate::loader::ModuleLoader;
use crate::require::WorkerRequire;
use crate::rpc;
use crate::value::{CallResult, ErrorValue, Function, Instance, Value};

/// Name of the teardown property.
pub const DESTROY: &str = "destroy";

/// Property that must never look like a call-path step, so an un-invoked
/// member is not mistaken for a pending result.
const THEN: &str = "then";

/// Exports of modules loaded in-process, by path.
pub(crate) type ModuleMap = DashMap<PathBuf, CallResult>;

enum Backend {
    Worker {
        cache: Arc<HandleCache>,
        current: Mutex<Option<Arc<WorkerHandle>>>,
    },
    InProcess {
        loader: Arc<dyn ModuleLoader>,
        modules: Arc<ModuleMap>,
    },
}

struct ProxyInner {
    path: PathBuf,
    options: RequireOptions,
    backend: Backend,
}

/// Proxy for a required module.
#[derive(Clone)]
pub struct ModuleProxy {
    inner: Arc<ProxyInner>,
}

/// What a property name on a [`ModuleProxy`] refers to.
#[derive(Debug, Clone)]
pub enum Property {
    Destroy(Destroy),
    Member(Member),
}

impl ModuleProxy {
    /// Proxy backed by a worker; the handle is acquired right away.
    pub(crate) fn with_worker(
        path: PathBuf,
        options: RequireOptions,
        cache: Arc<HandleCache>,
    ) -> Result<Self, RequireError> {
        let handle = cache.acquire(&path, &options)?;
        tracing::debug!("[ModuleProxy::with_worker:{}] handle {}", path.display(), handle.id());
        Ok(Self {
            inner: Arc::new(ProxyInner {
                path,
                options,
                backend: Backend::Worker {
                    cache,
                    current: Mutex::new(Some(handle)),
                },
            }),
        })
    }

    /// Proxy that calls the module on the caller's thread.
    pub(crate) fn in_process(
        path: PathBuf,
        options: RequireOptions,
        loader: Arc<dyn ModuleLoader>,
        modules: Arc<ModuleMap>,
    ) -> Self {
        tracing::debug!("[ModuleProxy::in_process:{}]", path.display());
        Self {
            inner: Arc::new(ProxyInner {
                path,
                options,
                backend: Backend::InProcess { loader, modules },
            }),
        }
    }

    /// Resolved module path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn options(&self) -> RequireOptions {
        self.inner.options
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self.inner.backend, Backend::InProcess { .. })
    }

    /// The worker handle currently in use, if any.
    pub fn handle(&self) -> Option<Arc<WorkerHandle>> {
        match &self.inner.backend {
            Backend::Worker { current, .. } => current.lock().clone(),
            Backend::InProcess { .. } => None,
        }
    }

    /// Look up a property.
    pub fn get(&self, name: &str) -> Property {
        if name == DESTROY {
            Property::Destroy(Destroy(self.clone()))
        } else {
            Property::Member(self.member(name))
        }
    }

    /// Start a call path.
    pub fn member(&self, name: &str) -> Member {
        Member {
            proxy: self.clone(),
            path: vec![name.to_string()],
        }
    }

    /// Call the export `name`. Calling `destroy` tears the proxy down.
    pub fn call(&self, name: &str, args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        match self.get(name) {
            Property::Destroy(destroy) => async move {
                destroy.call().await;
                Ok(Value::Undefined)
            }
            .boxed(),
            Property::Member(member) => member.invoke(args),
        }
    }

    /// Release the worker behind this proxy.
    ///
    /// Safe to call repeatedly and before any call was made. A later call
    /// through the proxy acquires a new worker.
    pub async fn destroy(&self) {
        let Backend::Worker { cache, current } = &self.inner.backend else {
            return;
        };
        let handle = current.lock().take();
        if let Some(handle) = handle {
            tracing::debug!("[destroy:{}] handle {}", self.inner.path.display(), handle.id());
            cache.release(&self.inner.path, &handle).await;
        }
    }

    fn current_handle(
        &self,
        cache: &HandleCache,
        current: &Mutex<Option<Arc<WorkerHandle>>>,
    ) -> Result<Arc<WorkerHandle>, RequireError> {
        let mut current = current.lock();
        if let Some(handle) = current.as_ref().filter(|h| !h.is_terminated()) {
            return Ok(Arc::clone(handle));
        }
        let handle = cache.acquire(&self.inner.path, &self.inner.options)?;
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn dispatch(&self, path: &[String], args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        match &self.inner.backend {
            Backend::Worker { cache, current } => {
                let handle = match self.current_handle(cache, current) {
                    Ok(handle) => handle,
                    Err(e) => return future::ready(Err(e.into())).boxed(),
                };
                let call = match path.split_last() {
                    Some((method, parents)) => parents
                        .iter()
                        .fold(handle.remote().clone(), |remote, step| remote.member(step))
                        .call(method, args),
                    None => handle.remote().apply(args),
                };
                async move {
                    let result = call.await;
                    if matches!(result, Err(CallError::Terminated)) {
                        handle.mark_stale();
                    }
                    result
                }
                .boxed()
            }

            Backend::InProcess { loader, modules } => {
                let exports = self.exports(loader.as_ref(), modules);
                let call = match exports {
                    Ok(exports) => rpc::dispatch(&exports, path, args),
                    Err(error) => future::ready(Err(error)).boxed(),
                };
                async move { rpc::flatten(call.await).await.map_err(CallError::from) }.boxed()
            }
        }
    }

    /// Exports of an in-process module, loaded on first use.
    fn exports(&self, loader: &dyn ModuleLoader, modules: &ModuleMap) -> CallResult {
        if let Some(exports) = modules.get(&self.inner.path) {
            return exports.value().clone();
        }
        // Load without holding the shard lock; a module may require others.
        let loaded = loader.load(&self.inner.path).map_err(|e| {
            tracing::warn!("[exports:{}] Load failed: {}", self.inner.path.display(), e);
            ErrorValue::from(e)
        });
        modules
            .entry(self.inner.path.clone())
            .or_insert(loaded)
            .value()
            .clone()
    }
}

impl fmt::Debug for ModuleProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleProxy")
            .field("path", &self.inner.path)
            .field("options", &self.inner.options)
            .field("in_process", &self.is_in_process())
            .field("handle", &self.handle().map(|h| h.id()))
            .finish()
    }
}

/// Passing a module to another module hands over a live reference to it.
#[async_trait]
impl Instance for ModuleProxy {
    fn class_name(&self) -> &str {
        "ModuleProxy"
    }

    fn get(&self, name: &str) -> Option<Value> {
        if name == THEN || name == TO_CLONEABLE {
            return None;
        }
        Some(match ModuleProxy::get(self, name) {
            Property::Destroy(destroy) => destroy.into(),
            Property::Member(member) => member.into(),
        })
    }

    fn is_proxy(&self) -> bool {
        true
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        Ok(ModuleProxy::call(self, method, args).await?)
    }
}

impl From<ModuleProxy> for Value {
    fn from(proxy: ModuleProxy) -> Self {
        Value::Instance(Arc::new(proxy))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Members
// ─────────────────────────────────────────────────────────────────────────────

/// A call path on a module: `module.a.b.c`.
#[derive(Clone)]
pub struct Member {
    proxy: ModuleProxy,
    path: Vec<String>,
}

impl Member {
    /// Extend the path. `then` and the cloneable marker are never steps.
    pub fn get(&self, name: &str) -> Option<Member> {
        if name == THEN || name == TO_CLONEABLE {
            return None;
        }
        let mut path = self.path.clone();
        path.push(name.to_string());
        Some(Member {
            proxy: self.proxy.clone(),
            path,
        })
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn module(&self) -> &ModuleProxy {
        &self.proxy
    }

    /// Invoke the last step as a method on the value the other steps lead
    /// to. The request is sent before this returns.
    pub fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        self.proxy.dispatch(&self.path, args)
    }

    /// Shorthand for `get(name)` followed by `invoke(args)`.
    pub fn call(&self, name: &str, args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        match self.get(name) {
            Some(member) => member.invoke(args),
            None => future::ready(Err(CallError::Remote(ErrorValue::type_error(format!(
                "{}.{} is not a function",
                self.path.join("."),
                name
            )))))
            .boxed(),
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("module", &self.proxy.path())
            .field("path", &self.path)
            .finish()
    }
}

impl From<Member> for Value {
    fn from(member: Member) -> Self {
        Function::new(move |args| member.invoke(args).map(|r| r.map_err(ErrorValue::from))).into()
    }
}

/// The `destroy` property of a module proxy.
#[derive(Debug, Clone)]
pub struct Destroy(ModuleProxy);

impl Destroy {
    pub async fn call(&self) {
        self.0.destroy().await
    }
}

impl From<Destroy> for Value {
    fn from(destroy: Destroy) -> Self {
        Function::new(move |_| {
            let proxy = destroy.0.clone();
            async move {
                proxy.destroy().await;
                Ok(Value::Undefined)
            }
        })
        .into()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deferred construction
// ─────────────────────────────────────────────────────────────────────────────

/// Makes a fresh proxy for one resolved module on every `create`.
///
/// With caching off each proxy gets its own worker, which is how one
/// module is run in parallel.
#[derive(Debug, Clone)]
pub struct ProxyFactory {
    require: WorkerRequire,
    path: PathBuf,
    options: RequireOptions,
}

impl ProxyFactory {
    pub(crate) fn new(require: WorkerRequire, path: PathBuf, options: RequireOptions) -> Self {
        Self {
            require,
            path,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self) -> Result<ModuleProxy, RequireError> {
        self.require.open(self.path.clone(), self.options)
    }
}
