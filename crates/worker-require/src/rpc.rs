//! Serving side of a channel: answers requests against an exposed value.

use std::sync::Arc;
use std::task::Poll;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::channel::Inbox;
use crate::command::{Reply, Request};
use crate::error::TransferError;
use crate::handlers::{HandlerRegistry, WireValue};
use crate::value::{CallResult, ErrorValue, Value};

/// Serve `value` over `inbox` on the current tokio runtime.
pub fn expose(
    value: Value,
    inbox: Inbox,
    registry: Arc<HandlerRegistry>,
) -> Result<(), TransferError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransferError::NoRuntime)?;
    runtime.spawn(serve(Ok(value), inbox, registry));
    Ok(())
}

/// Answer requests until the channel closes or a release arrives.
///
/// When `target` is an error every request is answered with it.
///
/// Each invocation is started inline, in arrival order, and polled once
/// before the loop moves on; only calls that are still pending afterwards
/// finish on their own task.
pub(crate) async fn serve(target: CallResult, mut inbox: Inbox, registry: Arc<HandlerRegistry>) {
    while let Some(request) = inbox.recv().await {
        tracing::trace!("[serve] {} request", request.kind());
        match request {
            Request::Get { path, reply } => {
                let call: BoxFuture<'static, CallResult> = match &target {
                    Ok(value) => future::ready(Ok(walk(value, &path))).boxed(),
                    Err(error) => future::ready(Err(error.clone())).boxed(),
                };
                settle(call, reply, &registry).await;
            }

            Request::Apply { path, args, reply } => {
                let call: BoxFuture<'static, CallResult> = match decode_args(args, &registry) {
                    Ok(args) => match &target {
                        Ok(value) => dispatch(value, &path, args),
                        Err(error) => future::ready(Err(error.clone())).boxed(),
                    },
                    Err(err) => future::ready(Err(ErrorValue::from(err))).boxed(),
                };
                settle(call, reply, &registry).await;
            }

            Request::Release { reply } => {
                let _ = reply.send(Ok(WireValue::Raw(Value::Undefined)));
                break;
            }
        }
    }
    tracing::trace!("[serve] endpoint closed");
}

/// Follow `path` by plain property indexing.
pub(crate) fn walk(target: &Value, path: &[String]) -> Value {
    path.iter().fold(target.clone(), |value, name| value.get(name))
}

/// Invoke the value at `path`: every step but the last is a property read,
/// the last one is a method call on the value before it.
pub(crate) fn dispatch(
    target: &Value,
    path: &[String],
    args: Vec<Value>,
) -> BoxFuture<'static, CallResult> {
    match path.split_last() {
        None => target.invoke(args),
        Some((method, parents)) => walk(target, parents).call_method(method, args),
    }
}

fn decode_args(
    args: Vec<WireValue>,
    registry: &Arc<HandlerRegistry>,
) -> Result<Vec<Value>, TransferError> {
    args.into_iter().map(|arg| registry.from_wire(arg)).collect()
}

/// Poll `call` once; reply right away if it is done, otherwise hand it to
/// its own task.
async fn settle(
    mut call: BoxFuture<'static, CallResult>,
    reply: oneshot::Sender<Reply>,
    registry: &Arc<HandlerRegistry>,
) {
    match futures::poll!(&mut call) {
        Poll::Ready(result) if !matches!(result, Ok(Value::Promise(_))) => {
            let _ = reply.send(encode(result, registry));
        }
        Poll::Ready(result) => {
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                let result = flatten(result).await;
                let _ = reply.send(encode(result, &registry));
            });
        }
        Poll::Pending => {
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                let result = flatten(call.await).await;
                let _ = reply.send(encode(result, &registry));
            });
        }
    }
}

/// A call that returns a promise resolves to the promise's outcome.
pub(crate) async fn flatten(mut result: CallResult) -> CallResult {
    while let Ok(Value::Promise(promise)) = result {
        result = promise.settle().await;
    }
    result
}

fn encode(result: CallResult, registry: &Arc<HandlerRegistry>) -> Reply {
    match result {
        Ok(value) => registry
            .to_wire(value)
            .map_err(|err| encode_thrown(err.into(), registry)),
        Err(error) => Err(encode_thrown(error, registry)),
    }
}

fn encode_thrown(error: ErrorValue, registry: &Arc<HandlerRegistry>) -> WireValue {
    registry
        .to_wire(Value::Error(error.clone()))
        .unwrap_or(WireValue::Raw(Value::Error(error)))
}
