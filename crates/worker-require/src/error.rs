//! Error types for worker-require.

use std::path::PathBuf;
use std::sync::Arc;

use crate::value::ErrorValue;

/// Errors raised synchronously while constructing a module proxy.
#[derive(Debug, thiserror::Error)]
pub enum RequireError {
    #[error("Cannot find module '{id}' from '{}'", base.display())]
    NotFound { id: String, base: PathBuf },

    #[error("Failed to resolve module '{id}': {source}")]
    Resolve {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("No default worker-require context installed")]
    NotInstalled,
}

/// Errors delivered asynchronously by a remote call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The remote function threw.
    #[error(transparent)]
    Remote(#[from] ErrorValue),

    #[error("Failed to transfer value: {0}")]
    Transfer(#[from] TransferError),

    #[error("Worker has terminated")]
    Terminated,

    #[error("Proxy has been released")]
    Released,

    #[error("Failed to acquire worker: {0}")]
    Acquire(Arc<RequireError>),
}

impl From<RequireError> for CallError {
    fn from(err: RequireError) -> Self {
        CallError::Acquire(Arc::new(err))
    }
}

/// Errors raised while moving a value across the thread boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("{0} could not be cloned")]
    NotCloneable(&'static str),

    #[error("No async runtime available to expose a proxied value")]
    NoRuntime,

    #[error("Unknown transfer handler: {0}")]
    UnknownHandler(String),

    #[error("Transfer handler '{handler}' received an unexpected payload")]
    UnexpectedPayload { handler: String },

    #[error("toCloneable failed: {0}")]
    Snapshot(ErrorValue),
}

impl From<CallError> for ErrorValue {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Remote(error) => error,
            CallError::Transfer(error) => error.into(),
            other => ErrorValue::new(other.to_string()),
        }
    }
}

impl From<TransferError> for ErrorValue {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::NotCloneable(_) => {
                ErrorValue::with_name("DataCloneError", err.to_string())
            }
            TransferError::Snapshot(error) => error,
            other => ErrorValue::new(other.to_string()),
        }
    }
}
