//! End-to-end tests running real worker processes.
//!
//! Every test spawns the stock worker binary, so the full channel is
//! exercised: spawn, init, ready, task calls, bidirectional calls, and
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use taskfarm::{CallRouter, Farm, FarmError, FarmOptions, FarmState, ModuleRegistry};

fn options(module: &str) -> FarmOptions {
    FarmOptions::new(module)
        .with_worker_program(env!("CARGO_BIN_EXE_taskfarm-worker"))
        .with_local_worker(false)
}

async fn start(options: FarmOptions) -> Farm {
    Farm::start(options, ModuleRegistry::new(), CallRouter::new())
        .await
        .expect("farm should start")
}

#[tokio::test]
async fn test_ping_round_trip() {
    let farm = start(options("ping")).await;

    assert_eq!(farm.run(Value::Null).await.unwrap(), json!("pong"));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_echo_calls_correlate() {
    let farm = Arc::new(start(options("echo").with_max_workers(4)).await);

    let calls = (0..1000).map(|i| {
        let farm = Arc::clone(&farm);
        tokio::spawn(async move { (i, farm.run(json!(i)).await.unwrap()) })
    });
    for handle in calls.collect::<Vec<_>>() {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result, json!(i), "call {i} got someone else's response");
    }

    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_init_payload_reaches_module() {
    let farm = start(
        options("init").with_init_payload(json!({"token": "abc", "level": 3})),
    )
    .await;

    let seen = farm.run(Value::Null).await.unwrap();
    assert_eq!(seen["token"], "abc");
    assert_eq!(seen["level"], 3);
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_warm_up_prespawns_full_pool() {
    let farm = start(options("ping").with_warm_workers(true).with_max_workers(3)).await;

    farm.warmed_up().await;
    assert_eq!(farm.active_workers(), 3);
    assert_eq!(farm.warmed_count(), 3);

    assert_eq!(farm.run(Value::Null).await.unwrap(), json!("pong"));
    farm.end().await.unwrap();
    assert_eq!(farm.active_workers(), 0);
}

#[tokio::test]
async fn test_local_worker_serves_without_processes() {
    // Without warm-up the local path handles everything; the registry must
    // resolve the module in this process.
    let options = FarmOptions::new("echo")
        .with_worker_program(env!("CARGO_BIN_EXE_taskfarm-worker"))
        .with_max_workers(4);
    let farm = Farm::start(options, taskfarm::modules::registry(), CallRouter::new())
        .await
        .unwrap();

    assert!(!farm.should_use_remote_workers());
    assert_eq!(farm.active_workers(), 0);

    assert_eq!(farm.run(json!("local")).await.unwrap(), json!("local"));
    assert_eq!(farm.active_workers(), 0, "no child should have spawned");
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_bidirectional_add() {
    let mut router = CallRouter::new();
    router.register("add", |args| async move {
        let a = args[0].as_i64().ok_or("expected a number")?;
        let b = args[1].as_i64().ok_or("expected a number")?;
        Ok(json!(a + b))
    });
    let farm = Farm::start(options("adder"), ModuleRegistry::new(), router)
        .await
        .unwrap();

    assert_eq!(farm.run(json!([1, 2])).await.unwrap(), json!(3));
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_bidirectional_calls_correlate() {
    let mut router = CallRouter::new();
    router.register("add", |args| async move {
        let a = args[0].as_i64().ok_or("expected a number")?;
        let b = args[1].as_i64().ok_or("expected a number")?;
        Ok(json!(a + b))
    });
    let farm = Arc::new(
        Farm::start(
            options("adder").with_max_workers(4),
            ModuleRegistry::new(),
            router,
        )
        .await
        .unwrap(),
    );

    let calls = (0..1000i64).map(|i| {
        let farm = Arc::clone(&farm);
        tokio::spawn(async move { (i, farm.run(json!([1 + i, 2])).await.unwrap()) })
    });
    for handle in calls.collect::<Vec<_>>() {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result, json!(3 + i));
    }

    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_pid_pair_crosses_processes() {
    let farm = start(options("pid").with_max_workers(1)).await;

    let pair = farm.run(Value::Null).await.unwrap();
    let worker_pid = pair[0].as_u64().unwrap();
    let coordinator_pid = pair[1].as_u64().unwrap();

    assert_eq!(coordinator_pid, u64::from(std::process::id()));
    assert_ne!(worker_pid, coordinator_pid);
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_task_failure_carries_message() {
    let farm = start(options("fail")).await;

    match farm.run(json!("boom")).await {
        Err(FarmError::Task(message)) => assert_eq!(message, "boom"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // The worker survives a failed task.
    match farm.run(json!("again")).await {
        Err(FarmError::Task(message)) => assert_eq!(message, "again"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_worker_crash_fails_only_pending_calls() {
    let farm = start(options("exit").with_max_workers(1)).await;

    match farm.run(Value::Null).await {
        Err(FarmError::WorkerExited) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(farm.active_workers(), 0);
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_unknown_handler_reported_to_module() {
    // The coordinator's router has no "add" handler, so the adder module
    // sees the lookup failure and surfaces it as the task's error.
    let farm = start(options("adder")).await;

    match farm.run(json!([1, 2])).await {
        Err(FarmError::Task(message)) => {
            assert!(message.contains("add"), "unexpected message: {message}")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    farm.end().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queue_drains_past_pool_ceiling() {
    let farm = Arc::new(start(options("echo").with_max_workers(1)).await);

    let calls = (0..16).map(|i| {
        let farm = Arc::clone(&farm);
        tokio::spawn(async move { farm.run(json!(i)).await.unwrap() })
    });
    for (i, handle) in calls.collect::<Vec<_>>().into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), json!(i as i64));
    }

    assert_eq!(farm.active_workers(), 1, "ceiling of one must hold");
    assert_eq!(farm.queued_calls(), 0);
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_queued_calls_are_served_in_arrival_order() {
    // One worker, calls submitted in a known order. join_all polls the
    // futures in index order, so call i is routed i-th; the counter module
    // reports the execution sequence number, which must match.
    let farm = start(options("counter").with_max_workers(1)).await;

    let calls: Vec<_> = (0..12).map(|_| farm.run(Value::Null)).collect();
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i as u64), "call {i} ran out of order");
    }
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_call_does_not_wedge_the_farm() {
    let farm = start(options("echo").with_max_workers(1)).await;

    // Abandon a call while its worker is still spawning. The farm must
    // neither leak the call's in-flight slot nor leave the worker busy.
    let _ = tokio::time::timeout(Duration::from_millis(1), farm.run(json!("dropped"))).await;

    assert_eq!(farm.run(json!("next")).await.unwrap(), json!("next"));
    tokio::time::timeout(Duration::from_secs(10), farm.end())
        .await
        .expect("end should resolve after an abandoned call")
        .unwrap();
}

#[tokio::test]
async fn test_end_during_warm_up_stops_every_worker() {
    let farm = start(options("ping").with_warm_workers(true).with_max_workers(2)).await;

    // end() must wait for in-progress spawns and stop what they produce;
    // every pre-spawned worker registers before it is torn down.
    farm.end().await.unwrap();
    assert_eq!(farm.state(), FarmState::Ended);
    assert_eq!(farm.active_workers(), 0);
    assert_eq!(farm.warmed_count(), 2, "both spawns should have registered");
}

#[tokio::test]
async fn test_started_event_resolves() {
    let farm = start(options("ping")).await;
    farm.started().await;
    assert_eq!(farm.state(), FarmState::Running);
    farm.end().await.unwrap();
}

#[tokio::test]
async fn test_end_then_run_is_rejected() {
    let farm = start(options("ping")).await;
    assert_eq!(farm.run(Value::Null).await.unwrap(), json!("pong"));

    farm.end().await.unwrap();
    assert_eq!(farm.state(), FarmState::Ended);
    assert_eq!(farm.active_workers(), 0);

    match farm.run(Value::Null).await {
        Err(FarmError::Ended) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }

    // end() stays idempotent after completion.
    farm.end().await.unwrap();
}
