//! Live references to values exposed on the other end of a channel.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::channel::Port;
use crate::command::{Reply, Request};
use crate::error::CallError;
use crate::handlers::{HandlerRegistry, WireValue};
use crate::value::{ErrorValue, Value};

struct RemoteInner {
    port: Port,
    registry: Arc<HandlerRegistry>,
    released: AtomicBool,
}

/// A remote reference.
///
/// Property indexing ([`Remote::member`]) only extends the local path;
/// nothing is sent until the reference is read or invoked. Requests go out
/// when the call is made, so calls on one reference are delivered in the
/// order they were issued regardless of when their futures are polled.
///
/// Dropping every clone closes the channel, which stops the serving side.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<RemoteInner>,
    path: Vec<String>,
}

impl Remote {
    /// Wrap the sending end of a channel.
    pub fn wrap(port: Port, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                port,
                registry,
                released: AtomicBool::new(false),
            }),
            path: Vec::new(),
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Index a property.
    pub fn member(&self, name: &str) -> Remote {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Self {
            inner: Arc::clone(&self.inner),
            path,
        }
    }

    /// Read the value at this path.
    pub fn get(&self) -> BoxFuture<'static, Result<Value, CallError>> {
        let path = self.path.clone();
        self.request(|reply| Request::Get { path, reply })
    }

    /// Invoke the value at this path.
    pub fn apply(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        let args = match args
            .into_iter()
            .map(|arg| self.inner.registry.to_wire(arg))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(args) => args,
            Err(err) => return future::ready(Err(err.into())).boxed(),
        };
        let path = self.path.clone();
        self.request(|reply| Request::Apply { path, args, reply })
    }

    /// Invoke `method` on the value at this path.
    pub fn call(&self, method: &str, args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        self.member(method).apply(args)
    }

    /// Tell the serving side to stop. Later calls through any clone fail
    /// with [`CallError::Released`]; releasing twice is a no-op.
    pub fn release(&self) -> BoxFuture<'static, Result<(), CallError>> {
        let sent = self.send(|reply| Request::Release { reply });
        self.inner.released.store(true, Ordering::SeqCst);
        async move {
            match sent {
                Ok(reply) => reply.await.map(|_| ()).map_err(|_| CallError::Terminated),
                Err(CallError::Released) => Ok(()),
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Whether the serving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.inner.port.is_closed()
    }

    /// Whether both references talk to the same endpoint.
    pub fn same_endpoint(&self, other: &Remote) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.port.same_channel(&other.inner.port)
    }

    fn send<F>(&self, make: F) -> Result<oneshot::Receiver<Reply>, CallError>
    where
        F: FnOnce(oneshot::Sender<Reply>) -> Request,
    {
        if self.is_released() {
            return Err(CallError::Released);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .port
            .send(make(reply_tx))
            .map_err(|_| CallError::Terminated)?;
        Ok(reply_rx)
    }

    fn request<F>(&self, make: F) -> BoxFuture<'static, Result<Value, CallError>>
    where
        F: FnOnce(oneshot::Sender<Reply>) -> Request,
    {
        let sent = self.send(make);
        let registry = Arc::clone(&self.inner.registry);
        async move {
            let reply = sent?.await.map_err(|_| CallError::Terminated)?;
            decode(reply, &registry)
        }
        .boxed()
    }
}

fn decode(reply: Reply, registry: &Arc<HandlerRegistry>) -> Result<Value, CallError> {
    match reply {
        Ok(wire) => Ok(registry.from_wire(wire)?),
        Err(wire) => Err(CallError::Remote(thrown(wire, registry))),
    }
}

fn thrown(wire: WireValue, registry: &Arc<HandlerRegistry>) -> ErrorValue {
    match registry.from_wire(wire) {
        Ok(Value::Error(error)) => error,
        Ok(other) => ErrorValue::new(format!("Uncaught {}", other.kind())),
        Err(err) => err.into(),
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .field("closed", &self.is_closed())
            .finish()
    }
}
