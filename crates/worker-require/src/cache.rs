//! Per-path registry of live worker handles.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::RequireOptions;
use crate::error::RequireError;
use crate::handle::WorkerHandle;
use crate::handlers::HandlerRegistry;
use crate::loader::ModuleLoader;

/// Cache of worker handles keyed by resolved module path.
///
/// With caching on, every proxy for a path shares the first live handle.
/// Uncached handles are tracked too, so they can be found and released.
pub struct HandleCache {
    loader: Arc<dyn ModuleLoader>,
    registry: Arc<HandlerRegistry>,
    handles: Mutex<HashMap<PathBuf, Vec<Arc<WorkerHandle>>>>,
}

impl HandleCache {
    pub fn new(loader: Arc<dyn ModuleLoader>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            loader,
            registry,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get a handle for `path`, spawning a worker when there is no live
    /// cached one (or when caching is off).
    ///
    /// Stale handles found on the way are evicted, then destroyed on the
    /// current runtime once the map is unlocked.
    pub fn acquire(
        &self,
        path: &Path,
        options: &RequireOptions,
    ) -> Result<Arc<WorkerHandle>, RequireError> {
        let mut evicted = Vec::new();
        let acquired = self.acquire_locked(path, options, &mut evicted);
        reap(path, evicted);
        acquired
    }

    fn acquire_locked(
        &self,
        path: &Path,
        options: &RequireOptions,
        evicted: &mut Vec<Arc<WorkerHandle>>,
    ) -> Result<Arc<WorkerHandle>, RequireError> {
        let mut handles = self.handles.lock();
        let entry = handles.entry(path.to_path_buf()).or_default();

        entry.retain(|handle| {
            if !handle.is_terminated() {
                return true;
            }
            tracing::warn!("[acquire:{}] Evicting stale handle {}", path.display(), handle.id());
            handle.mark_stale();
            evicted.push(Arc::clone(handle));
            false
        });

        if options.cache {
            if let Some(handle) = entry.first() {
                return Ok(Arc::clone(handle));
            }
        }

        let handle = match WorkerHandle::spawn(path, Arc::clone(&self.loader), Arc::clone(&self.registry)) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                if entry.is_empty() {
                    handles.remove(path);
                }
                return Err(e);
            }
        };
        entry.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// Remove `handle` without stopping it. Returns whether it was present.
    pub fn detach(&self, path: &Path, handle: &Arc<WorkerHandle>) -> bool {
        let mut handles = self.handles.lock();
        let Some(entry) = handles.get_mut(path) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|h| !Arc::ptr_eq(h, handle));
        let removed = entry.len() != before;
        if entry.is_empty() {
            handles.remove(path);
        }
        removed
    }

    /// Detach and destroy `handle`. Does nothing for a handle that is not
    /// in the cache.
    pub async fn release(&self, path: &Path, handle: &Arc<WorkerHandle>) {
        if self.detach(path, handle) {
            handle.destroy().await;
        }
    }

    /// Destroy every handle.
    pub async fn release_all(&self) {
        let drained: Vec<_> = self.handles.lock().drain().flat_map(|(_, v)| v).collect();
        tracing::debug!("[release_all] Releasing {} handles", drained.len());
        futures::future::join_all(drained.iter().map(|handle| handle.destroy())).await;
    }

    /// Handles currently cached for `path`.
    pub fn handles(&self, path: &Path) -> Vec<Arc<WorkerHandle>> {
        self.handles.lock().get(path).cloned().unwrap_or_default()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.handles.lock().contains_key(path)
    }

    /// Total number of handles.
    pub fn len(&self) -> usize {
        self.handles.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destroy evicted handles in the background. Outside a runtime their
/// threads are left detached; they exit on the shutdown signal.
fn reap(path: &Path, evicted: Vec<Arc<WorkerHandle>>) {
    if evicted.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            for handle in evicted {
                runtime.spawn(async move { handle.destroy().await });
            }
        }
        Err(_) => {
            tracing::debug!(
                "[reap:{}] No runtime, detaching {} stale threads",
                path.display(),
                evicted.len()
            );
        }
    }
}

impl fmt::Debug for HandleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCache")
            .field("paths", &self.handles.lock().len())
            .field("handles", &self.len())
            .finish()
    }
}
