//! End-to-end tests: modules on worker threads called through proxies.

mod fixtures;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::future::join_all;
use worker_require::{
    CallError, ErrorValue, Function, ModuleProxy, Promise, Property, RequireError, RequireOptions,
    Settings, TO_CLONEABLE, Value, WorkerRequire,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn require(context: &WorkerRequire, id: &str) -> ModuleProxy {
    context
        .require(id, RequireOptions::default())
        .unwrap_or_else(|e| panic!("require {id}: {e}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Basic calls
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_wraps_functions_in_a_worker() -> Result<()> {
    init_tracing();
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");

    let (sum, fib) = tokio::join!(
        basic.call("add", vec![1.into(), 2.into()]),
        basic.call("fibonacci", vec![20.into()]),
    );
    assert_eq!(sum?, Value::from(3));
    assert_eq!(fib?, Value::from(fixtures::fib(20)));

    basic.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_destroy_without_use() {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");
    basic.destroy().await;
    assert!(context.cache().is_empty());
}

#[tokio::test]
async fn test_destroy_twice() {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");

    let Property::Destroy(destroy) = basic.get("destroy") else {
        panic!("destroy should be reserved");
    };
    destroy.call().await;
    destroy.call().await;
    assert!(context.cache().is_empty());
}

#[tokio::test]
async fn test_default_export() -> Result<()> {
    let context = fixtures::context();
    let module = require(&context, "./fixtures/default");
    assert_eq!(module.call("default", vec![]).await?, Value::from("done"));
    module.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_async_function() -> Result<()> {
    let context = fixtures::context();
    let module = require(&context, "./fixtures/async");
    assert_eq!(module.call("wait", vec![]).await?, Value::from("done"));
    module.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_arrays() -> Result<()> {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");

    let result = basic.call("array", vec![vec![1, 2].into(), 3.into()]).await?;
    assert_eq!(result, Value::from(vec![1, 2, 3]));

    basic.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_edge_values() -> Result<()> {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");

    let result = basic
        .call("edgy", vec![Value::Null, Value::Undefined, Value::Number(f64::NAN)])
        .await?;
    let items = result.as_array().expect("an array");
    assert_eq!(items.len(), 3);
    assert!(items[0].is_null());
    assert!(items[1].is_undefined());
    assert!(items[2].as_f64().is_some_and(f64::is_nan));

    basic.destroy().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Values with behavior
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_instance_method() -> Result<()> {
    let context = fixtures::context();
    let value = require(&context, "./fixtures/value");

    let result = value.member("instance").call("method", vec![3.into(), 4.into()]).await?;
    assert_eq!(result, Value::from(12));

    value.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_object_method() -> Result<()> {
    let context = fixtures::context();
    let value = require(&context, "./fixtures/value");

    let result = value.member("obj").call("func", vec![3.into(), 4.into()]).await?;
    assert_eq!(result, Value::from(81));

    value.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_uninvoked_member_is_not_thenable() -> Result<()> {
    let context = fixtures::context();
    let value = require(&context, "./fixtures/value");

    let obj = value.member("obj");
    obj.call("func", vec![1.into(), 2.into()]).await?;
    assert!(obj.get("then").is_none());
    assert!(obj.get(TO_CLONEABLE).is_none());
    assert_eq!(obj.get("func").map(|m| m.path().to_vec()), Some(vec!["obj".into(), "func".into()]));

    value.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_cloneable_snapshot() -> Result<()> {
    let context = fixtures::context();
    let value = require(&context, "./fixtures/value");

    let result = value.call("transferFoo", vec![]).await?;
    assert_eq!(result.get("a"), Value::from(1000));
    assert_eq!(result.get("b"), Value::from("foo"));
    assert!(result.get("c").is_undefined());
    assert!(result.get("method").is_undefined());
    assert!(result.as_remote().is_none());

    value.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_object_with_marker_is_snapshotted() -> Result<()> {
    let context = fixtures::context();
    let value = require(&context, "./fixtures/value");

    let result = value.call("transferMarked", vec![]).await?;
    assert!(result.as_remote().is_none());
    assert_eq!(result, Value::object([("a", 1000)]));

    value.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_function_argument() -> Result<()> {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");
    let functions = require(&context, "./fixtures/functions");

    let result = functions.call("callFunction", vec![basic.member("add").into()]).await?;
    assert_eq!(result, Value::from(3));

    basic.destroy().await;
    functions.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_deep_function_argument() -> Result<()> {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");
    let functions = require(&context, "./fixtures/functions");

    let object = Value::object([("add", Value::from(basic.member("add")))]);
    let result = functions.call("callFunctionOnObject", vec![object]).await?;
    assert_eq!(result, Value::from(3));

    basic.destroy().await;
    functions.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_sync_or_async_callback() -> Result<()> {
    let context = fixtures::context();
    let functions = require(&context, "./fixtures/functions");

    let sync = Function::sync(|_| Ok(1.into()));
    let promised = Function::sync(|_| Ok(Promise::resolved(1.into()).into()));
    let (a, b) = tokio::join!(
        functions.call("callAsyncFunction", vec![sync.into()]),
        functions.call("callAsyncFunction", vec![promised.into()]),
    );
    assert_eq!(a?, Value::from(2));
    assert_eq!(b?, Value::from(2));

    functions.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_module_as_argument() -> Result<()> {
    let context = fixtures::context();
    let basic = require(&context, "./fixtures/basic");
    let module_arg = require(&context, "./fixtures/module_arg");

    let result = module_arg.call("fib", vec![basic.clone().into(), 20.into()]).await?;
    assert_eq!(result, Value::from(fixtures::fib(20)));

    basic.destroy().await;
    module_arg.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_module_requiring_module() -> Result<()> {
    let context = fixtures::context();
    let dependency = require(&context, "./fixtures/dependency");

    let result = dependency.call("doubleFibonacci", vec![20.into()]).await?;
    assert_eq!(result, Value::from(fixtures::fib(20) * 2));

    dependency.destroy().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_thrown_error() {
    let context = fixtures::context();
    let error = require(&context, "./fixtures/error");

    let err = error.call("throwError", vec![]).await.unwrap_err();
    let CallError::Remote(thrown) = err else {
        panic!("expected a thrown error, got {err:?}");
    };
    assert_eq!(thrown, ErrorValue::new("boom"));

    error.destroy().await;
}

#[test]
fn test_invalid_path_fails_synchronously() {
    let context = fixtures::context();
    let err = context
        .require("./fixtures/doesnt-exist", RequireOptions::default())
        .unwrap_err();
    assert!(matches!(err, RequireError::NotFound { .. }));
    assert!(context.cache().is_empty());
}

#[tokio::test]
async fn test_load_failure_is_rejected_call() {
    let context = fixtures::context();
    let broken = require(&context, "./fixtures/broken");

    let err = broken.call("anything", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::Remote(e) if e.message.contains("not-registered")));

    broken.destroy().await;
}

#[tokio::test]
async fn test_stale_handle_is_replaced() -> Result<()> {
    let context = fixtures::context();
    let crash = require(&context, "./fixtures/crash");
    let first = crash.handle().expect("handle acquired on require").id();

    let err = crash.call("panic", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::Terminated));

    assert_eq!(crash.call("ping", vec![]).await?, Value::from("pong"));
    assert_ne!(crash.handle().expect("fresh handle").id(), first);
    assert_eq!(context.cache().len(), 1);

    crash.destroy().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Caching, ordering and isolation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cached_proxies_share_worker() {
    let context = fixtures::context();
    let a = require(&context, "./fixtures/basic");
    let b = context
        .require_from(fixtures::dir().join("nested"), "../basic.toml", RequireOptions::default())
        .unwrap();

    assert!(Arc::ptr_eq(&a.handle().unwrap(), &b.handle().unwrap()));
    assert_eq!(context.cache().len(), 1);

    a.destroy().await;
    b.destroy().await;
    assert!(context.cache().is_empty());
}

#[tokio::test]
async fn test_directory_index() -> Result<()> {
    let context = fixtures::context();
    let nested = require(&context, "./fixtures/nested");
    assert!(nested.path().ends_with("nested/index.toml"));
    assert_eq!(nested.call("add", vec![2.into(), 2.into()]).await?, Value::from(4));
    nested.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_calls_run_in_dispatch_order() -> Result<()> {
    let context = fixtures::context();
    let counter = require(&context, "./fixtures/counter");

    let calls: Vec<_> = (0..100i32).map(|i| counter.call("record", vec![i.into()])).collect();
    for result in join_all(calls).await {
        result?;
    }

    let log = counter.call("log", vec![]).await?;
    assert_eq!(log, Value::from((0..100).collect::<Vec<i32>>()));

    counter.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_workers_do_not_share_state() -> Result<()> {
    let context = fixtures::context();
    let factory = context.create_require("./fixtures/counter", RequireOptions::uncached())?;
    let a = factory.create()?;
    let b = factory.create()?;

    assert_eq!(a.call("increment", vec![]).await?, Value::from(1));
    assert_eq!(a.call("increment", vec![]).await?, Value::from(2));
    assert_eq!(b.call("increment", vec![]).await?, Value::from(1));

    let shared = require(&context, "./fixtures/counter");
    assert!(Arc::ptr_eq(&shared.handle().unwrap(), &a.handle().unwrap()));
    assert_eq!(shared.call("increment", vec![]).await?, Value::from(3));

    context.shutdown().await;
    assert!(context.cache().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_workers_beat_in_process() -> Result<()> {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cores < 2 {
        eprintln!("test_parallel_workers_beat_in_process skipped: needs 2 cores, found {cores}");
        return Ok(());
    }

    let workers = cores.min(4);
    let n: i32 = 32;
    let expected = Value::from(fixtures::fib(n as u64));

    // Baseline: the same calls, run one after another on this thread.
    let serial_context = WorkerRequire::builder()
        .loader(fixtures::loader())
        .settings(Settings {
            enabled: false,
            ..Settings::default()
        })
        .build();
    let serial_module = require(&serial_context, "./fixtures/basic");
    serial_module.call("add", vec![0.into(), 0.into()]).await?;

    let start = Instant::now();
    for result in join_all((0..workers).map(|_| serial_module.call("fibonacci", vec![n.into()]))).await {
        assert_eq!(result?, expected);
    }
    let serial = start.elapsed();

    let context = fixtures::context();
    let factory = context.create_require("./fixtures/basic", RequireOptions::uncached())?;
    let proxies = (0..workers).map(|_| factory.create()).collect::<Result<Vec<_>, _>>()?;
    for result in join_all(proxies.iter().map(|p| p.call("add", vec![0.into(), 0.into()]))).await {
        result?;
    }

    let start = Instant::now();
    for result in join_all(proxies.iter().map(|p| p.call("fibonacci", vec![n.into()]))).await {
        assert_eq!(result?, expected);
    }
    let parallel = start.elapsed();

    assert!(
        parallel * 3 / 2 < serial,
        "{workers} workers took {parallel:?}, in-process took {serial:?}"
    );

    context.shutdown().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_in_process_mode() -> Result<()> {
    let context = WorkerRequire::builder()
        .loader(fixtures::loader())
        .settings(Settings::from_lookup(|key| (key == "WORKER_REQUIRE").then(|| "false".into())))
        .build();
    let basic = require(&context, "./fixtures/basic");
    let functions = require(&context, "./fixtures/functions");

    assert!(basic.is_in_process());
    assert_eq!(basic.call("add", vec![1.into(), 2.into()]).await?, Value::from(3));
    let result = functions.call("callFunction", vec![basic.member("add").into()]).await?;
    assert_eq!(result, Value::from(3));
    assert!(context.cache().is_empty());

    basic.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_installed_context() -> Result<()> {
    // The only test in this binary that installs a context.
    assert!(matches!(
        worker_require::require("./fixtures/basic", RequireOptions::default()),
        Err(RequireError::NotInstalled)
    ));

    assert!(fixtures::context().install().is_ok());
    let basic = worker_require::require("./fixtures/basic", RequireOptions::default())?;
    assert_eq!(basic.call("add", vec![2.into(), 3.into()]).await?, Value::from(5));

    let factory = worker_require::create_require("./fixtures/basic", RequireOptions::uncached())?;
    let other = factory.create()?;
    assert!(!Arc::ptr_eq(&basic.handle().unwrap(), &other.handle().unwrap()));

    basic.destroy().await;
    other.destroy().await;
    Ok(())
}
