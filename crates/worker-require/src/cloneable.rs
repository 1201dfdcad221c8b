//! The cloneable marker.
//!
//! A type opts into copy-by-snapshot by implementing [`Cloneable`] and
//! returning itself from [`Instance::as_cloneable`](crate::Instance::as_cloneable):
//!
//! ```ignore
//! impl Cloneable for Foo {
//!     fn to_cloneable(&self) -> CallResult {
//!         Ok(Value::object([("a", self.a)]))
//!     }
//! }
//!
//! impl Instance for Foo {
//!     fn as_cloneable(&self) -> Option<&dyn Cloneable> {
//!         Some(self)
//!     }
//! }
//! ```
//!
//! Plain objects and instances can also expose the marker as a function
//! under the [`TO_CLONEABLE`] key. That function must return without
//! suspending.

use futures::FutureExt;

use crate::value::{CallResult, Cloneable, ErrorValue, Function, Value};

/// Well-known key of the cloneable marker.
///
/// Module proxies never treat this name as a call-path step, so probing an
/// un-invoked proxy for the marker finds nothing.
pub const TO_CLONEABLE: &str = "@@worker-require/toCloneable";

enum Marker<'a> {
    Native(&'a dyn Cloneable),
    Method(Function),
}

fn marker(value: &Value) -> Option<Marker<'_>> {
    match value {
        Value::Instance(instance) => match instance.as_cloneable() {
            Some(native) => Some(Marker::Native(native)),
            None => method(instance.get(TO_CLONEABLE)),
        },
        Value::Object(fields) => method(fields.get(TO_CLONEABLE).cloned()),
        _ => None,
    }
}

fn method<'a>(value: Option<Value>) -> Option<Marker<'a>> {
    match value {
        Some(Value::Function(f)) => Some(Marker::Method(f)),
        _ => None,
    }
}

/// Whether `value` exposes the cloneable marker. Does not invoke it.
pub fn is_cloneable(value: &Value) -> bool {
    marker(value).is_some()
}

/// Invoke the marker of `value`, if it has one.
pub fn snapshot(value: &Value) -> Option<CallResult> {
    Some(match marker(value)? {
        Marker::Native(native) => native.to_cloneable(),
        Marker::Method(f) => match f.call(Vec::new()).now_or_never() {
            Some(Ok(Value::Promise(_))) | None => Err(ErrorValue::type_error(format!(
                "{TO_CLONEABLE} must return a value, not a pending result"
            ))),
            Some(result) => result,
        },
    })
}
