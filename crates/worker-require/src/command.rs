//! Requests carried over a message channel.
//!
//! Each request brings its own oneshot reply sender, so replies never need
//! to be matched up by id.

use tokio::sync::oneshot;

use crate::handlers::WireValue;

/// Reply to a request. The `Err` side carries a thrown error.
pub(crate) type Reply = Result<WireValue, WireValue>;

/// Requests understood by [`crate::rpc::serve`].
pub(crate) enum Request {
    /// Read the value at `path`.
    Get {
        path: Vec<String>,
        reply: oneshot::Sender<Reply>,
    },

    /// Invoke the value at `path` with `args`.
    Apply {
        path: Vec<String>,
        args: Vec<WireValue>,
        reply: oneshot::Sender<Reply>,
    },

    /// Stop serving this endpoint.
    Release { reply: oneshot::Sender<Reply> },
}

impl Request {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::Apply { .. } => "apply",
            Request::Release { .. } => "release",
        }
    }
}
