//! A running worker and the remote reference to its module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::RequireError;
use crate::handlers::HandlerRegistry;
use crate::loader::ModuleLoader;
use crate::remote::Remote;
use crate::worker::{WorkerThread, spawn_worker};

/// One worker serving one module.
#[derive(Debug)]
pub struct WorkerHandle {
    id: Uuid,
    path: PathBuf,
    remote: Remote,
    worker: WorkerThread,
}

impl WorkerHandle {
    /// Spawn a worker for the module at `path`.
    pub fn spawn(
        path: &Path,
        loader: Arc<dyn ModuleLoader>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, RequireError> {
        let (port, worker) = spawn_worker(path, loader, Arc::clone(&registry))?;
        let handle = Self {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            remote: Remote::wrap(port, registry),
            worker,
        };
        tracing::debug!("[WorkerHandle::spawn:{}] {}", handle.id, path.display());
        Ok(handle)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reference to the module's exports.
    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Whether the worker is gone (terminated, crashed or released).
    pub fn is_terminated(&self) -> bool {
        self.worker.is_terminated() || self.remote.is_closed() || self.remote.is_released()
    }

    /// Whether the worker thread has been joined.
    pub fn is_joined(&self) -> bool {
        self.worker.is_joined()
    }

    /// Mark the worker as unusable; it is stopped and the cache will not
    /// hand it out again.
    pub fn mark_stale(&self) {
        if !self.worker.is_terminated() {
            tracing::warn!("[mark_stale:{}] {}", self.id, self.path.display());
        }
        self.worker.terminate();
    }

    /// Release the module, stop the worker and wait for its thread.
    pub async fn destroy(&self) {
        if let Err(e) = self.remote.release().await {
            tracing::debug!("[destroy:{}] Release skipped: {}", self.id, e);
        }
        self.worker.terminate();
        self.worker.join().await;
        tracing::debug!("[destroy:{}] Worker stopped", self.id);
    }
}
