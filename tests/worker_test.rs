//! End-to-end tests against a scripted calculator worker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::sleep;

use tether::testing::{ScriptedFactory, ScriptedWorker};
use tether::{ConnectionStatus, WireMessage, WorkerHandle};

/// A calculator whose constructor arguments configure the rounding
/// precision applied by `add`.
fn calculator() -> ScriptedFactory {
    let precision = Arc::new(Mutex::new(0i32));

    let ctor_precision = precision.clone();
    ScriptedWorker::new()
        .on_construct(move |args| {
            let precision = ctor_precision.clone();
            async move {
                // Startup is slow enough that tests can observe the
                // machine while it is connecting.
                sleep(Duration::from_millis(20)).await;
                let digits = args
                    .first()
                    .and_then(|v| v.get("precision"))
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| json!("missing precision"))?;
                *precision.lock().unwrap() = digits as i32;
                Ok(serde_json::Value::Null)
            }
        })
        .method("add", move |args| {
            let precision = precision.clone();
            async move {
                let mut sum = 0.0;
                for value in &args {
                    sum += value.as_f64().ok_or_else(|| json!("not a number"))?;
                }
                let factor = 10f64.powi(*precision.lock().unwrap());
                Ok(json!((sum * factor).round() / factor))
            }
        })
        .into_factory()
}

#[tokio::test]
async fn test_acquire_then_add() {
    let factory = Arc::new(calculator());
    let handle = WorkerHandle::new(factory, vec![json!({"precision": 1})]);

    let proxy = handle.acquire();
    let result = proxy
        .call("add", vec![json!(1.11), json!(2.22)])
        .await
        .unwrap();
    assert_eq!(result, json!(3.3));
    assert_eq!(handle.state(), ConnectionStatus::Connected);

    handle.release();
    assert_eq!(handle.state(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_call_before_acquire_stays_blocked_then_resolves() {
    let factory = Arc::new(calculator());
    let handle = WorkerHandle::new(factory.clone(), vec![json!({"precision": 1})]);

    let proxy = handle.proxy();
    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.call("add", vec![json!(1.11), json!(2.22)]).await })
    };

    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), ConnectionStatus::Blocked);

    // 50ms with no acquisition: still blocked, nothing spawned, call
    // unresolved.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), ConnectionStatus::Blocked);
    assert_eq!(factory.spawn_count(), 0);
    assert!(!call.is_finished());

    handle.acquire();
    assert_eq!(handle.state(), ConnectionStatus::Connecting);

    assert_eq!(call.await.unwrap().unwrap(), json!(3.3));
    assert_eq!(handle.state(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_release_rejects_in_flight_call() {
    // The slow variant never answers fast enough for the race to matter:
    // releasing must reject, not deliver the sum.
    let factory = Arc::new(
        ScriptedWorker::new()
            .method("add", |_| async {
                sleep(Duration::from_secs(5)).await;
                Ok(json!(3.3))
            })
            .into_factory(),
    );
    let handle = WorkerHandle::new(factory, vec![]);

    let proxy = handle.acquire();
    let call = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.call("add", vec![json!(1.11), json!(2.22)]).await })
    };

    // Let the envelope reach the worker before releasing.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), ConnectionStatus::Connected);
    handle.release();

    let err = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("rejection must not hang")
        .unwrap()
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_out_of_order_completion_on_connected_channel() {
    let factory = Arc::new(
        ScriptedWorker::new()
            .method("slow", |_| async {
                sleep(Duration::from_millis(100)).await;
                Ok(json!("slow"))
            })
            .method("fast", |_| async { Ok(json!("fast")) })
            .into_factory(),
    );
    let handle = WorkerHandle::new(factory, vec![]);

    let proxy = handle.acquire();
    // Establish the connection first so both calls are in flight together.
    proxy.call("fast", vec![]).await.unwrap();

    let slow = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let result = proxy.call("slow", vec![]).await;
            (result, Instant::now())
        })
    };
    let fast = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let result = proxy.call("fast", vec![]).await;
            (result, Instant::now())
        })
    };

    let (slow_result, slow_done) = slow.await.unwrap();
    let (fast_result, fast_done) = fast.await.unwrap();

    // Responses arrived in reverse send order, each to the right caller.
    assert_eq!(slow_result.unwrap(), json!("slow"));
    assert_eq!(fast_result.unwrap(), json!("fast"));
    assert!(fast_done < slow_done);
}

#[tokio::test]
async fn test_fault_then_recovery_cycle() {
    let factory = Arc::new(
        ScriptedWorker::new()
            .method("ping", |_| async { Ok(json!("pong")) })
            .method("hang", |_| async { futures::future::pending().await })
            .into_factory(),
    );
    let handle = WorkerHandle::new(factory.clone(), vec![]);

    let proxy = handle.acquire();
    proxy.call("ping", vec![]).await.unwrap();

    let hung = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.call("hang", vec![]).await })
    };
    sleep(Duration::from_millis(20)).await;

    factory.inject_fault("worker crashed").await;

    let err = hung.await.unwrap().unwrap_err();
    assert!(err.is_fault());

    // The dead channel fails fast until the machine is cycled.
    let err = proxy.call("ping", vec![]).await.unwrap_err();
    assert!(err.is_fault());

    handle.release();
    assert_eq!(handle.state(), ConnectionStatus::Disconnected);

    let proxy = handle.acquire();
    assert_eq!(proxy.call("ping", vec![]).await.unwrap(), json!("pong"));
    assert_eq!(factory.spawn_count(), 2);
}

#[tokio::test]
async fn test_stray_response_does_not_disturb_the_proxy() {
    let factory = Arc::new(
        ScriptedWorker::new()
            .method("ping", |_| async { Ok(json!("pong")) })
            .into_factory(),
    );
    let handle = WorkerHandle::new(factory.clone(), vec![]);

    let proxy = handle.acquire();
    proxy.call("ping", vec![]).await.unwrap();

    // A response for an id nobody is waiting on is dropped silently.
    factory
        .inject_message(WireMessage::Success {
            id: 424242,
            result: json!("stray"),
        })
        .await;

    assert_eq!(proxy.call("ping", vec![]).await.unwrap(), json!("pong"));
    assert_eq!(handle.state(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_method_forwarders_are_reusable() {
    let factory = Arc::new(calculator());
    let handle = WorkerHandle::new(factory, vec![json!({"precision": 1})]);

    let proxy = handle.acquire();
    let add = proxy.method("add");
    assert_eq!(add.name(), "add");

    let first = add.call(vec![json!(1.11), json!(2.22)]).await.unwrap();
    let second = add.call(vec![json!(0.05), json!(0.04)]).await.unwrap();
    assert_eq!(first, json!(3.3));
    assert_eq!(second, json!(0.1));
}

#[tokio::test]
async fn test_typed_result_decoding() {
    let factory = Arc::new(calculator());
    let handle = WorkerHandle::new(factory, vec![json!({"precision": 1})]);

    let proxy = handle.acquire();
    let sum: f64 = proxy
        .call_decoded("add", vec![json!(1.11), json!(2.22)])
        .await
        .unwrap();
    assert!((sum - 3.3).abs() < f64::EPSILON);
}
