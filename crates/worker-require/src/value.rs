//! Dynamic value type that flows between the caller and its workers.
//!
//! Data variants (primitives, dates, buffers, arrays, plain objects) copy by
//! value. Behavior variants (functions, promises, instances, remotes) are
//! marshaled by the transfer handlers in [`crate::handlers`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::remote::Remote;

/// Outcome of invoking a function: `Err` is a thrown error.
pub type CallResult = Result<Value, ErrorValue>;

// ─────────────────────────────────────────────────────────────────────────────
// Error descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// A thrown error, reduced to what survives a thread hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct ErrorValue {
    /// Error type, e.g. `TypeError`
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorValue {
    /// A plain `Error`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_name("Error", message)
    }

    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::with_name("TypeError", message)
    }
}

/// A regular expression literal, carried as source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegExp {
    pub source: String,
    #[serde(default)]
    pub flags: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Behavior types
// ─────────────────────────────────────────────────────────────────────────────

type FunctionBody = dyn Fn(Vec<Value>) -> BoxFuture<'static, CallResult> + Send + Sync;

/// A callable value.
///
/// Invoking a function starts it immediately: the synchronous part of the
/// body runs inside [`Function::call`], only the remainder is deferred to
/// the returned future.
#[derive(Clone)]
pub struct Function(Arc<FunctionBody>);

impl Function {
    /// Wrap an asynchronous function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self(Arc::new(move |args| f(args).boxed()))
    }

    /// Wrap a synchronous function. The body runs when the function is called.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> CallResult + Send + Sync + 'static,
    {
        Self(Arc::new(move |args| future::ready(f(args)).boxed()))
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A pending result that may be awaited from several places.
#[derive(Clone)]
pub struct Promise(Shared<BoxFuture<'static, CallResult>>);

impl Promise {
    pub fn new<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self(fut.boxed().shared())
    }

    pub fn resolved(value: Value) -> Self {
        Self::new(future::ready(Ok(value)))
    }

    pub fn rejected(error: ErrorValue) -> Self {
        Self::new(future::ready(Err(error)))
    }

    /// Wait for the promise to settle.
    pub async fn settle(self) -> CallResult {
        self.0.await
    }
}

/// Self-conversion to a plain-data snapshot, consulted instead of proxying.
///
/// `to_cloneable` is called once per transfer; its result is copied.
pub trait Cloneable: Send + Sync {
    fn to_cloneable(&self) -> CallResult;
}

/// A non-plain object: something with behavior beyond its data fields.
#[async_trait]
pub trait Instance: Send + Sync + 'static {
    /// Name used in error messages.
    fn class_name(&self) -> &str {
        "Object"
    }

    /// Read a property (data field or method).
    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Own data fields, copied when the instance is transferred by value.
    fn fields(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// The cloneable marker.
    fn as_cloneable(&self) -> Option<&dyn Cloneable> {
        None
    }

    /// Opt in to crossing the boundary as a live remote reference.
    fn is_proxy(&self) -> bool {
        false
    }

    /// Invoke a method.
    async fn call(&self, method: &str, args: Vec<Value>) -> CallResult {
        match self.get(method) {
            Some(value) if value.is_callable() => value.invoke(args).await,
            _ => Err(ErrorValue::type_error(format!(
                "{}.{} is not a function",
                self.class_name(),
                method
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Universal Value Type
// ─────────────────────────────────────────────────────────────────────────────

/// Any value that can be passed to, or returned from, a worker module.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    RegExp(RegExp),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Plain key/value mapping
    Object(BTreeMap<String, Value>),
    Error(ErrorValue),
    Function(Function),
    Promise(Promise),
    Instance(Arc<dyn Instance>),
    Remote(Remote),
}

impl Value {
    /// Short type label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::RegExp(_) => "regexp",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Error(_) => "error",
            Value::Function(_) => "function",
            Value::Promise(_) => "promise",
            Value::Instance(_) => "instance",
            Value::Remote(_) => "remote",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Remote(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as i64 if the number has no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Remote> {
        match self {
            Value::Remote(r) => Some(r),
            _ => None,
        }
    }

    /// Create an object from key-value pairs
    pub fn object<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn instance(instance: impl Instance) -> Self {
        Value::Instance(Arc::new(instance))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Property access and invocation
// ─────────────────────────────────────────────────────────────────────────────

impl Value {
    /// Plain property indexing. Missing properties read as `Undefined`;
    /// indexing a remote extends its path without a round trip.
    pub fn get(&self, name: &str) -> Value {
        match self {
            Value::Object(fields) => fields.get(name).cloned().unwrap_or_default(),
            Value::Array(items) => match name {
                "length" => Value::Number(items.len() as f64),
                _ => name
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index).cloned())
                    .unwrap_or_default(),
            },
            Value::String(s) if name == "length" => Value::Number(s.chars().count() as f64),
            Value::Bytes(b) if name == "length" => Value::Number(b.len() as f64),
            Value::Error(e) => match name {
                "name" => Value::String(e.name.clone()),
                "message" => Value::String(e.message.clone()),
                "stack" => e.stack.clone().map(Value::String).unwrap_or_default(),
                _ => Value::Undefined,
            },
            Value::Instance(instance) => instance.get(name).unwrap_or_default(),
            Value::Remote(remote) => Value::Remote(remote.member(name)),
            _ => Value::Undefined,
        }
    }

    /// Call this value as a function.
    pub fn invoke(&self, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        match self {
            Value::Function(f) => f.call(args),
            Value::Remote(remote) => {
                let call = remote.apply(args);
                async move { call.await.map_err(ErrorValue::from) }.boxed()
            }
            other => future::ready(Err(ErrorValue::type_error(format!(
                "{} is not a function",
                other.kind()
            ))))
            .boxed(),
        }
    }

    /// Call the method `name` with this value as receiver.
    pub fn call_method(&self, name: &str, args: Vec<Value>) -> BoxFuture<'static, CallResult> {
        match self {
            Value::Instance(instance) => {
                let instance = Arc::clone(instance);
                let name = name.to_owned();
                async move { instance.call(&name, args).await }.boxed()
            }
            Value::Remote(remote) => {
                let call = remote.call(name, args);
                async move { call.await.map_err(ErrorValue::from) }.boxed()
            }
            receiver => {
                let method = receiver.get(name);
                if method.is_callable() {
                    method.invoke(args)
                } else {
                    future::ready(Err(ErrorValue::type_error(format!(
                        "{}.{} is not a function",
                        receiver.kind(),
                        name
                    ))))
                    .boxed()
                }
            }
        }
    }

    /// Deep copy for the default transfer path.
    ///
    /// Instances without a cloneable marker copy their own data fields.
    /// Functions, promises and remotes cannot be copied.
    pub fn structured_clone(&self) -> Result<Value, TransferError> {
        Ok(match self {
            Value::Undefined => Value::Undefined,
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Number(*n),
            Value::String(s) => Value::String(s.clone()),
            Value::Date(d) => Value::Date(*d),
            Value::RegExp(r) => Value::RegExp(r.clone()),
            Value::Bytes(b) => Value::Bytes(b.clone()),
            Value::Error(e) => Value::Error(e.clone()),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(Value::structured_clone)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => Value::Object(clone_fields(fields)?),
            Value::Instance(instance) => Value::Object(clone_fields(&instance.fields())?),
            Value::Function(_) => return Err(TransferError::NotCloneable("function")),
            Value::Promise(_) => return Err(TransferError::NotCloneable("promise")),
            Value::Remote(_) => return Err(TransferError::NotCloneable("remote")),
        })
    }
}

fn clone_fields(fields: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, TransferError> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.structured_clone()?)))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Equality and formatting
// ─────────────────────────────────────────────────────────────────────────────

/// Data variants compare structurally (`NaN != NaN`); behavior variants
/// compare by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Remote(a), Value::Remote(b)) => a.same_endpoint(b) && a.path() == b.path(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Value::String(s) => f.debug_tuple("String").field(s).finish(),
            Value::Date(d) => f.debug_tuple("Date").field(d).finish(),
            Value::RegExp(r) => f.debug_tuple("RegExp").field(r).finish(),
            Value::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Object(fields) => f.debug_tuple("Object").field(fields).finish(),
            Value::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Value::Function(_) => f.write_str("Function(..)"),
            Value::Promise(_) => f.write_str("Promise(..)"),
            Value::Instance(i) => write!(f, "Instance({})", i.class_name()),
            Value::Remote(r) => f.debug_tuple("Remote").field(r).finish(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// From Implementations
// ─────────────────────────────────────────────────────────────────────────────

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Undefined
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Number(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<ErrorValue> for Value {
    fn from(v: ErrorValue) -> Self {
        Value::Error(v)
    }
}

impl From<Function> for Value {
    fn from(v: Function) -> Self {
        Value::Function(v)
    }
}

impl From<Promise> for Value {
    fn from(v: Promise) -> Self {
        Value::Promise(v)
    }
}

impl From<Remote> for Value {
    fn from(v: Remote) -> Self {
        Value::Remote(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => {
                Value::Object(fields.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl Value {
    /// Convert plain data to JSON. Behavior variants and non-finite numbers
    /// have no JSON form.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(serde_json::Number::from_f64(*n)?),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(d.to_rfc3339()),
            Value::RegExp(r) => serde_json::to_value(r).ok()?,
            Value::Bytes(b) => serde_json::Value::Array(b.iter().map(|&x| x.into()).collect()),
            Value::Error(e) => serde_json::to_value(e).ok()?,
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect::<Option<_>>()?)
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| Some((k.clone(), v.to_json()?)))
                    .collect::<Option<_>>()?,
            ),
            Value::Function(_) | Value::Promise(_) | Value::Instance(_) | Value::Remote(_) => {
                return None;
            }
        })
    }
}
