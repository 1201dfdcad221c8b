//! Transfer handler registry.
//!
//! Every value that crosses a channel is classified here. Handlers are
//! consulted in registration order and the first one that claims a value
//! serializes it; unclaimed values are structurally copied. The standard
//! order is `throw` > `cloneable` > `proxy` > default copy, and each
//! handler's predicate also excludes what the higher-priority handlers
//! claim, so exactly one strategy applies to any value.

use std::fmt;
use std::sync::Arc;

use crate::channel::{Port, message_channel};
use crate::cloneable::{is_cloneable, snapshot};
use crate::error::TransferError;
use crate::remote::Remote;
use crate::rpc;
use crate::value::{ErrorValue, Value};

/// Name of the error handler.
pub const THROW: &str = "throw";
/// Name of the cloneable handler.
pub const CLONEABLE: &str = "cloneable";
/// Name of the proxy handler.
pub const PROXY: &str = "proxy";

/// How deep [`has_functions`] descends into nested plain objects.
pub const MAX_SCAN_DEPTH: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Wire representation
// ─────────────────────────────────────────────────────────────────────────────

/// What a handler produces.
pub enum Payload {
    /// A plain copy; no live reference crosses.
    Clone(Value),
    /// A transferred channel endpoint.
    Port(Port),
}

/// A value as it travels inside a request or reply.
pub enum WireValue {
    /// Default structured copy.
    Raw(Value),
    /// Serialized by the named handler.
    Handler { name: String, payload: Payload },
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Clone(value) => f.debug_tuple("Clone").field(value).finish(),
            Payload::Port(port) => f.debug_tuple("Port").field(port).finish(),
        }
    }
}

impl fmt::Debug for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::Raw(value) => f.debug_tuple("Raw").field(value).finish(),
            WireValue::Handler { name, payload } => f
                .debug_struct("Handler")
                .field("name", name)
                .field("payload", payload)
                .finish(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler trait and registry
// ─────────────────────────────────────────────────────────────────────────────

/// A named marshaling rule.
pub trait TransferHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn can_handle(&self, value: &Value) -> bool;

    fn serialize(
        &self,
        value: Value,
        registry: &Arc<HandlerRegistry>,
    ) -> Result<Payload, TransferError>;

    fn deserialize(
        &self,
        payload: Payload,
        registry: &Arc<HandlerRegistry>,
    ) -> Result<Value, TransferError>;
}

/// Ordered set of transfer handlers. Both ends of a channel must use the
/// same set so that every handler name on the wire can be decoded.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn TransferHandler>>,
}

impl HandlerRegistry {
    /// A registry with no handlers: everything is copied.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// The standard `throw`, `cloneable`, `proxy` registry.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.set(ErrorHandler);
        registry.set(CloneableHandler);
        registry.set(ProxyHandler);
        registry
    }

    /// Register a handler. A handler with the same name is replaced in
    /// place and keeps its priority; a new name is consulted last.
    pub fn set(&mut self, handler: impl TransferHandler) -> &mut Self {
        let handler: Arc<dyn TransferHandler> = Arc::new(handler);
        match self.handlers.iter().position(|h| h.name() == handler.name()) {
            Some(index) => self.handlers[index] = handler,
            None => self.handlers.push(handler),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TransferHandler>> {
        self.handlers.iter().find(|h| h.name() == name)
    }

    /// Handler names in priority order.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// The handler that would claim `value`; `None` means default copy.
    pub fn classify(&self, value: &Value) -> Option<&str> {
        self.handlers
            .iter()
            .find(|h| h.can_handle(value))
            .map(|h| h.name())
    }

    /// Encode a value for sending.
    pub fn to_wire(self: &Arc<Self>, value: Value) -> Result<WireValue, TransferError> {
        if let Some(handler) = self.handlers.iter().find(|h| h.can_handle(&value)) {
            let payload = handler.serialize(value, self)?;
            return Ok(WireValue::Handler {
                name: handler.name().to_string(),
                payload,
            });
        }
        Ok(WireValue::Raw(value.structured_clone()?))
    }

    /// Decode a received value.
    pub fn from_wire(self: &Arc<Self>, wire: WireValue) -> Result<Value, TransferError> {
        match wire {
            WireValue::Raw(value) => Ok(value),
            WireValue::Handler { name, payload } => {
                let handler = self
                    .get(&name)
                    .ok_or_else(|| TransferError::UnknownHandler(name.clone()))?;
                handler.deserialize(payload, self)
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error handler
// ─────────────────────────────────────────────────────────────────────────────

/// Carries errors as `{ name, message, stack }` descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandler;

impl TransferHandler for ErrorHandler {
    fn name(&self) -> &str {
        THROW
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Error(_))
    }

    fn serialize(&self, value: Value, _: &Arc<HandlerRegistry>) -> Result<Payload, TransferError> {
        let Value::Error(error) = value else {
            return Err(TransferError::UnexpectedPayload {
                handler: THROW.to_string(),
            });
        };
        let mut descriptor = vec![
            ("name", Value::String(error.name)),
            ("message", Value::String(error.message)),
        ];
        if let Some(stack) = error.stack {
            descriptor.push(("stack", Value::String(stack)));
        }
        Ok(Payload::Clone(Value::object(descriptor)))
    }

    fn deserialize(&self, payload: Payload, _: &Arc<HandlerRegistry>) -> Result<Value, TransferError> {
        let unexpected = || TransferError::UnexpectedPayload {
            handler: THROW.to_string(),
        };
        let Payload::Clone(Value::Object(fields)) = payload else {
            return Err(unexpected());
        };
        let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(Value::Error(ErrorValue {
            name: text("name").unwrap_or_else(|| "Error".to_string()),
            message: text("message").ok_or_else(unexpected)?,
            stack: text("stack"),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cloneable handler
// ─────────────────────────────────────────────────────────────────────────────

/// Copies the snapshot returned by a value's cloneable marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneableHandler;

impl TransferHandler for CloneableHandler {
    fn name(&self) -> &str {
        CLONEABLE
    }

    fn can_handle(&self, value: &Value) -> bool {
        !ErrorHandler.can_handle(value) && is_cloneable(value)
    }

    fn serialize(&self, value: Value, _: &Arc<HandlerRegistry>) -> Result<Payload, TransferError> {
        match snapshot(&value) {
            Some(Ok(data)) => Ok(Payload::Clone(data.structured_clone()?)),
            Some(Err(error)) => Err(TransferError::Snapshot(error)),
            None => Err(TransferError::UnexpectedPayload {
                handler: CLONEABLE.to_string(),
            }),
        }
    }

    fn deserialize(&self, payload: Payload, _: &Arc<HandlerRegistry>) -> Result<Value, TransferError> {
        match payload {
            Payload::Clone(value) => Ok(value),
            Payload::Port(_) => Err(TransferError::UnexpectedPayload {
                handler: CLONEABLE.to_string(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy handler
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps behavior on its side of the boundary and hands the other side a
/// dedicated channel to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyHandler;

impl TransferHandler for ProxyHandler {
    fn name(&self) -> &str {
        PROXY
    }

    fn can_handle(&self, value: &Value) -> bool {
        if ErrorHandler.can_handle(value) || CloneableHandler.can_handle(value) {
            return false;
        }
        match value {
            Value::Function(_) | Value::Promise(_) | Value::Remote(_) => true,
            Value::Instance(instance) => instance.is_proxy(),
            Value::Object(_) => has_functions(value),
            _ => false,
        }
    }

    fn serialize(
        &self,
        value: Value,
        registry: &Arc<HandlerRegistry>,
    ) -> Result<Payload, TransferError> {
        let (port, inbox) = message_channel();
        rpc::expose(value, inbox, Arc::clone(registry))?;
        Ok(Payload::Port(port))
    }

    fn deserialize(
        &self,
        payload: Payload,
        registry: &Arc<HandlerRegistry>,
    ) -> Result<Value, TransferError> {
        match payload {
            Payload::Port(port) => Ok(Value::Remote(Remote::wrap(port, Arc::clone(registry)))),
            Payload::Clone(_) => Err(TransferError::UnexpectedPayload {
                handler: PROXY.to_string(),
            }),
        }
    }
}

/// Whether a plain object holds a function (or remote) anywhere in its
/// nested plain objects.
///
/// The scan is iterative and stops descending at [`MAX_SCAN_DEPTH`];
/// anything deeper is treated as data.
pub fn has_functions(value: &Value) -> bool {
    let Value::Object(root) = value else {
        return false;
    };
    let mut pending = vec![(root, 1usize)];
    while let Some((fields, depth)) = pending.pop() {
        for field in fields.values() {
            match field {
                Value::Function(_) | Value::Remote(_) => return true,
                Value::Object(nested) if depth < MAX_SCAN_DEPTH => {
                    pending.push((nested, depth + 1))
                }
                _ => {}
            }
        }
    }
    false
}
