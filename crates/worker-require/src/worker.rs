//! Worker thread bootstrap.
//!
//! Each worker is a dedicated OS thread running a current-thread tokio
//! runtime. The thread loads one module and serves its exports over the
//! inbox of a message channel until the channel closes or shutdown is
//! signalled.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::channel::{Inbox, Port, message_channel};
use crate::error::RequireError;
use crate::handlers::HandlerRegistry;
use crate::loader::ModuleLoader;
use crate::rpc::serve;
use crate::value::ErrorValue;

/// Start a worker for the module at `path`.
///
/// Returns the port the module's exports are served on. Loading happens on
/// the worker thread; a module that fails to load still gets a worker,
/// which rejects every request with the load error.
pub fn spawn_worker(
    path: &Path,
    loader: Arc<dyn ModuleLoader>,
    registry: Arc<HandlerRegistry>,
) -> Result<(Port, WorkerThread), RequireError> {
    let name = thread_name(path);
    tracing::debug!("[spawn_worker] Starting {} for {}", name, path.display());

    let terminated = Arc::new(AtomicBool::new(false));
    let terminated_clone = terminated.clone();

    let (port, inbox) = message_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let path = path.to_path_buf();
    let thread_handle = thread::Builder::new().name(name).spawn(move || {
        // Set on every exit path, unwinding included.
        let _exit = ExitGuard(terminated_clone);

        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("[spawn_worker:{}] Failed to build runtime: {}", path.display(), e);
                return;
            }
        };

        rt.block_on(run_worker(&path, loader, registry, inbox, shutdown_rx));

        rt.shutdown_background();
        tracing::debug!("[spawn_worker:{}] Thread exiting", path.display());
    })?;

    Ok((
        port,
        WorkerThread {
            shutdown_tx,
            terminated,
            joined: AtomicBool::new(false),
            thread_handle: Mutex::new(Some(thread_handle)),
        },
    ))
}

/// The main loop that runs inside the spawned thread.
pub(crate) async fn run_worker(
    path: &Path,
    loader: Arc<dyn ModuleLoader>,
    registry: Arc<HandlerRegistry>,
    inbox: Inbox,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let exports = loader.load(path).map_err(|e| {
        tracing::warn!("[run_worker:{}] Load failed: {}", path.display(), e);
        ErrorValue::from(e)
    });
    if exports.is_ok() {
        tracing::debug!("[run_worker:{}] Module loaded", path.display());
    }

    tokio::select! {
        biased;
        _ = shutdown_rx.changed() => {
            tracing::debug!("[run_worker:{}] Shutdown signal received", path.display());
        }
        _ = serve(exports, inbox, registry) => {
            tracing::debug!("[run_worker:{}] Channel closed", path.display());
        }
    }
}

struct ExitGuard(Arc<AtomicBool>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn thread_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module");
    format!("worker-require:{stem}")
}

/// Control side of a worker thread.
pub struct WorkerThread {
    shutdown_tx: watch::Sender<bool>,
    terminated: Arc<AtomicBool>,
    joined: AtomicBool,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerThread {
    /// Signal the worker to stop. Calls in flight are abandoned and their
    /// callers see [`CallError::Terminated`](crate::CallError::Terminated).
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return; // Already terminated
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the worker has been told to stop or has exited on its own.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Wait for the thread to exit without blocking the async executor.
    pub async fn join(&self) {
        let Some(handle) = self.thread_handle.lock().take() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || handle.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            tracing::warn!("[join] Worker thread panicked");
        }
        self.joined.store(true, Ordering::SeqCst);
    }

    /// Whether a [`join`](Self::join) has finished.
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        // Detaches the thread; it exits once it observes the signal.
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("terminated", &self.is_terminated())
            .field("joined", &self.is_joined())
            .finish()
    }
}
