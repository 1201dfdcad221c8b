//! Fixture modules for the integration tests.
//!
//! Each `*.toml` file in this directory names one of the factories
//! registered by [`loader`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use worker_require::{
    CallResult, Cloneable, ErrorValue, Function, Instance, NativeLoader, RequireOptions, Settings,
    TO_CLONEABLE, Value, WorkerRequire,
};

pub fn dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

pub fn loader() -> NativeLoader {
    let loader = NativeLoader::new();
    loader
        .register("basic", basic)
        .register("async", async_module)
        .register("value", value)
        .register("functions", functions)
        .register("module_arg", module_arg)
        .register("error", error)
        .register("default", default)
        .register("counter", counter)
        .register("crash", crash)
        .register("dependency", dependency);
    loader
}

/// A context over the fixtures with workers on.
pub fn context() -> WorkerRequire {
    WorkerRequire::builder()
        .loader(loader())
        .settings(Settings::default())
        .build()
}

pub fn fib(n: u64) -> u64 {
    if n <= 1 { 1 } else { fib(n - 1) + fib(n - 2) }
}

fn number(args: &[Value], index: usize) -> Result<f64, ErrorValue> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| ErrorValue::type_error(format!("argument {index} must be a number")))
}

// ─────────────────────────────────────────────────────────────────────────────
// basic
// ─────────────────────────────────────────────────────────────────────────────

fn basic() -> CallResult {
    Ok(Value::object([
        (
            "fibonacci",
            Function::sync(|args| Ok(fib(number(&args, 0)? as u64).into())),
        ),
        (
            "add",
            Function::sync(|args| Ok((number(&args, 0)? + number(&args, 1)?).into())),
        ),
        (
            "array",
            Function::sync(|args| {
                let mut items = args.first().and_then(Value::as_array).unwrap_or_default().to_vec();
                items.push(args.get(1).cloned().unwrap_or_default());
                Ok(Value::Array(items))
            }),
        ),
        (
            "edgy",
            Function::sync(|args| {
                let mut args = args;
                args.resize(3, Value::Undefined);
                if args[2].is_undefined() {
                    args[2] = Value::Number(f64::NAN);
                }
                Ok(Value::Array(args))
            }),
        ),
    ]))
}

fn async_module() -> CallResult {
    Ok(Value::object([(
        "wait",
        Function::new(|_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Value::from("done"))
        }),
    )]))
}

fn default() -> CallResult {
    Ok(Value::object([(
        "default",
        Function::new(|_| async { Ok(Value::from("done")) }),
    )]))
}

// ─────────────────────────────────────────────────────────────────────────────
// value
// ─────────────────────────────────────────────────────────────────────────────

struct Class;

impl Instance for Class {
    fn class_name(&self) -> &str {
        "Class"
    }

    fn get(&self, name: &str) -> Option<Value> {
        (name == "method")
            .then(|| Function::sync(|args| Ok((number(&args, 0)? * number(&args, 1)?).into())).into())
    }
}

struct Foo {
    a: f64,
    b: String,
}

impl Cloneable for Foo {
    fn to_cloneable(&self) -> CallResult {
        Ok(Value::object([("a", Value::from(self.a)), ("b", Value::from(self.b.as_str()))]))
    }
}

impl Instance for Foo {
    fn class_name(&self) -> &str {
        "Foo"
    }

    fn get(&self, name: &str) -> Option<Value> {
        match name {
            "a" => Some(self.a.into()),
            "b" => Some(self.b.as_str().into()),
            "method" => Some(Function::sync(|_| Ok("boop".into())).into()),
            _ => None,
        }
    }

    fn fields(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("a".to_string(), self.a.into()),
            ("b".to_string(), self.b.as_str().into()),
            ("c".to_string(), "not part of the snapshot".into()),
        ])
    }

    fn as_cloneable(&self) -> Option<&dyn Cloneable> {
        Some(self)
    }
}

fn value() -> CallResult {
    Ok(Value::object([
        ("instance", Value::instance(Class)),
        (
            "obj",
            Value::object([(
                "func",
                Function::sync(|args| Ok(number(&args, 0)?.powf(number(&args, 1)?).into())),
            )]),
        ),
        (
            "transferFoo",
            Function::sync(|_| {
                Ok(Value::instance(Foo {
                    a: 1000.0,
                    b: "foo".to_string(),
                }))
            })
            .into(),
        ),
        (
            "transferMarked",
            Function::sync(|_| {
                Ok(Value::object([
                    ("a", Value::from(1000)),
                    ("secret", Value::from("not part of the snapshot")),
                    (
                        TO_CLONEABLE,
                        Function::sync(|_| Ok(Value::object([("a", 1000)]))).into(),
                    ),
                ]))
            })
            .into(),
        ),
    ]))
}

// ─────────────────────────────────────────────────────────────────────────────
// functions
// ─────────────────────────────────────────────────────────────────────────────

fn functions() -> CallResult {
    Ok(Value::object([
        (
            "callFunction",
            Function::new(|args| async move {
                let handler = args.into_iter().next().unwrap_or_default();
                handler.invoke(vec![1.into(), 2.into()]).await
            }),
        ),
        (
            "callFunctionOnObject",
            Function::new(|args| async move {
                let object = args.into_iter().next().unwrap_or_default();
                object.call_method("add", vec![1.into(), 2.into()]).await
            }),
        ),
        (
            "callAsyncFunction",
            Function::new(|args| async move {
                let value = args.into_iter().next().unwrap_or_default();
                let first = value.invoke(vec![]).await?;
                let second = value.invoke(vec![]).await?;
                Ok((number(&[first], 0)? + number(&[second], 0)?).into())
            }),
        ),
    ]))
}

fn module_arg() -> CallResult {
    Ok(Value::object([(
        "fib",
        Function::new(|args| async move {
            let module = args.first().cloned().unwrap_or_default();
            let n = args.get(1).cloned().unwrap_or_default();
            module.call_method("fibonacci", vec![n]).await
        }),
    )]))
}

fn error() -> CallResult {
    Ok(Value::object([(
        "throwError",
        Function::sync(|_| Err(ErrorValue::new("boom"))),
    )]))
}

// ─────────────────────────────────────────────────────────────────────────────
// State and failure
// ─────────────────────────────────────────────────────────────────────────────

/// Per-worker state: every load gets its own counter and log.
fn counter() -> CallResult {
    let count = Arc::new(AtomicU64::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    let record_log = Arc::clone(&log);

    Ok(Value::object([
        (
            "increment",
            Function::sync(move |_| Ok((count.fetch_add(1, Ordering::SeqCst) + 1).into())),
        ),
        (
            "record",
            Function::sync(move |args| {
                record_log.lock().push(args.first().cloned().unwrap_or_default());
                Ok(Value::Undefined)
            }),
        ),
        (
            "log",
            Function::sync(move |_| Ok(Value::Array(log.lock().clone()))),
        ),
    ]))
}

fn crash() -> CallResult {
    Ok(Value::object([
        (
            "panic",
            Function::sync(|_| -> CallResult { panic!("worker crashed on purpose") }),
        ),
        ("ping", Function::sync(|_| Ok("pong".into()))),
    ]))
}

/// A module that requires another module from inside its worker.
fn dependency() -> CallResult {
    let require = context();
    let basic = require
        .require_from(dir(), "basic", RequireOptions::default())
        .map_err(|e| ErrorValue::new(e.to_string()))?;

    Ok(Value::object([(
        "doubleFibonacci",
        Function::new(move |args| {
            let call = basic.call("fibonacci", args);
            async move {
                let n = call.await?;
                Ok((number(&[n], 0)? * 2.0).into())
            }
        }),
    )]))
}
