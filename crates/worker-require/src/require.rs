//! The worker-require context.

use std::fmt;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::cache::HandleCache;
use crate::config::{RequireOptions, Settings};
use crate::error::RequireError;
use crate::handlers::HandlerRegistry;
use crate::loader::{ModuleLoader, NativeLoader, resolve};
use crate::proxy::{ModuleMap, ModuleProxy, ProxyFactory};

static GLOBAL: OnceLock<WorkerRequire> = OnceLock::new();

/// Resolves modules and hands out proxies for them.
///
/// Cloning is cheap; clones share the worker cache.
#[derive(Clone)]
pub struct WorkerRequire {
    settings: Arc<Settings>,
    loader: Arc<dyn ModuleLoader>,
    registry: Arc<HandlerRegistry>,
    cache: Arc<HandleCache>,
    modules: Arc<ModuleMap>,
}

impl WorkerRequire {
    /// A context with settings from the environment and the standard
    /// transfer handlers.
    pub fn new(loader: impl ModuleLoader) -> Self {
        Self::builder().loader(loader).build()
    }

    pub fn builder() -> WorkerRequireBuilder {
        WorkerRequireBuilder::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &HandleCache {
        &self.cache
    }

    /// Require a module relative to the calling source file.
    #[track_caller]
    pub fn require(&self, id: &str, options: RequireOptions) -> Result<ModuleProxy, RequireError> {
        let base = caller_dir(Location::caller());
        self.require_from(base, id, options)
    }

    /// Require a module relative to `base_dir`.
    ///
    /// Resolution happens here; a missing module is an error before any
    /// worker is started.
    pub fn require_from(
        &self,
        base_dir: impl AsRef<Path>,
        id: &str,
        options: RequireOptions,
    ) -> Result<ModuleProxy, RequireError> {
        let path = resolve(base_dir.as_ref(), id, &self.settings.extensions)?;
        self.open(path, options)
    }

    /// Like [`require`](Self::require), but returns a factory that makes a
    /// new proxy each time.
    #[track_caller]
    pub fn create_require(
        &self,
        id: &str,
        options: RequireOptions,
    ) -> Result<ProxyFactory, RequireError> {
        let base = caller_dir(Location::caller());
        self.create_require_from(base, id, options)
    }

    pub fn create_require_from(
        &self,
        base_dir: impl AsRef<Path>,
        id: &str,
        options: RequireOptions,
    ) -> Result<ProxyFactory, RequireError> {
        let path = resolve(base_dir.as_ref(), id, &self.settings.extensions)?;
        Ok(ProxyFactory::new(self.clone(), path, options))
    }

    /// Proxy for an already resolved path.
    pub(crate) fn open(
        &self,
        path: PathBuf,
        options: RequireOptions,
    ) -> Result<ModuleProxy, RequireError> {
        if self.settings.enabled {
            ModuleProxy::with_worker(path, options, Arc::clone(&self.cache))
        } else {
            Ok(ModuleProxy::in_process(
                path,
                options,
                Arc::clone(&self.loader),
                Arc::clone(&self.modules),
            ))
        }
    }

    /// Stop every worker and forget in-process modules.
    pub async fn shutdown(&self) {
        tracing::debug!("[shutdown] {} workers", self.cache.len());
        self.cache.release_all().await;
        self.modules.clear();
    }

    /// Make this the process-wide context used by [`crate::require`].
    /// Fails, handing the context back, when one is already installed.
    pub fn install(self) -> Result<(), WorkerRequire> {
        GLOBAL.set(self)
    }

    /// The process-wide context.
    pub fn global() -> Result<&'static WorkerRequire, RequireError> {
        GLOBAL.get().ok_or(RequireError::NotInstalled)
    }
}

impl fmt::Debug for WorkerRequire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRequire")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Builder for [`WorkerRequire`].
#[derive(Default)]
pub struct WorkerRequireBuilder {
    loader: Option<Arc<dyn ModuleLoader>>,
    registry: Option<HandlerRegistry>,
    settings: Option<Settings>,
}

impl WorkerRequireBuilder {
    pub fn loader(mut self, loader: impl ModuleLoader) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Transfer handlers used on both ends of every channel.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to [`Settings::from_env`].
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> WorkerRequire {
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(NativeLoader::new()));
        let registry = Arc::new(self.registry.unwrap_or_default());
        let settings = self.settings.unwrap_or_else(Settings::from_env);

        WorkerRequire {
            settings: Arc::new(settings),
            cache: Arc::new(HandleCache::new(Arc::clone(&loader), Arc::clone(&registry))),
            loader,
            registry,
            modules: Arc::new(ModuleMap::new()),
        }
    }
}

/// Directory of the source file at `location`.
fn caller_dir(location: &Location<'_>) -> PathBuf {
    source_dir(Path::new(location.file()))
}

/// Source paths are recorded relative to the workspace root, so they are
/// looked up against the working directory and its ancestors. When the file
/// cannot be found, the working directory is used.
fn source_dir(file: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_default();

    let source = if file.is_absolute() {
        Some(file.to_path_buf())
    } else {
        cwd.ancestors()
            .map(|dir| dir.join(file))
            .find(|candidate| candidate.is_file())
    };

    match source.as_deref().and_then(Path::parent) {
        Some(dir) => dir.to_path_buf(),
        None => {
            tracing::warn!(
                "[caller_dir] Source {} not found, resolving against {}",
                file.display(),
                cwd.display()
            );
            cwd
        }
    }
}
