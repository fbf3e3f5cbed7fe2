use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use farmhand::{
    CallArg, CallTarget, ErrorCode, Farm, FarmError, FarmOptions, MasterCall, MethodTable,
    ModuleRegistry, WorkerContext,
};
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

/// Shared scratch state the test worker module records into.
#[derive(Default)]
struct TestState {
    record: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl TestState {
    fn record(&self, tag: &str) {
        if let Ok(mut record) = self.record.lock() {
            record.push(tag.to_string());
        }
    }

    fn recorded(&self) -> Vec<String> {
        self.record.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

fn sum_args(args: &[CallArg]) -> i64 {
    args.iter()
        .filter_map(CallArg::as_value)
        .filter_map(Value::as_i64)
        .sum()
}

fn first_string(args: &[CallArg]) -> String {
    args.first()
        .and_then(CallArg::as_value)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Builds the registry every test farm runs against: a `bundler` worker
/// module plus a `reporter` module reachable through master calls.
fn test_modules(state: Arc<TestState>) -> Arc<ModuleRegistry> {
    let run_state = state.clone();
    let die_state = state.clone();
    let mark_state = state.clone();
    let gauge_state = state.clone();

    let bundler = MethodTable::new()
        .method("run", move |_ctx, args| {
            let state = run_state.clone();
            async move {
                state.record("run");
                Ok(json!(sum_args(&args)))
            }
        })
        .method("die_once", move |_ctx, _args| {
            let state = die_state.clone();
            async move {
                if state.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first attempt dies");
                }
                Ok(json!("recovered"))
            }
        })
        .method("mark", move |_ctx, args| {
            let state = mark_state.clone();
            async move {
                let tag = first_string(&args);
                state.record(&tag);
                if tag == "A" && state.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(Duration::from_millis(50)).await;
                    panic!("A dies on its first attempt");
                }
                if tag == "B" {
                    sleep(Duration::from_millis(150)).await;
                }
                Ok(json!(tag))
            }
        })
        .method("gauge", move |_ctx, _args| {
            let state = gauge_state.clone();
            async move {
                let current = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_active.fetch_max(current, Ordering::SeqCst);
                sleep(Duration::from_millis(30)).await;
                state.active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .method("double_remote", |ctx: WorkerContext, args: Vec<CallArg>| async move {
            let handle = args
                .first()
                .and_then(CallArg::as_handle)
                .ok_or_else(|| FarmError::invalid_request("expected a handle"))?;
            let input = args
                .get(1)
                .and_then(CallArg::as_value)
                .cloned()
                .ok_or_else(|| FarmError::invalid_request("expected a value"))?;
            ctx.call_handle(handle, vec![CallArg::data(input)]).await
        })
        .method("ask_master", |ctx: WorkerContext, _args| async move {
            let response = ctx
                .call_master(MasterCall {
                    idx: None,
                    target: CallTarget::Location {
                        path: "reporter".to_string(),
                    },
                    method: Some("ping".to_string()),
                    args: vec![],
                    await_response: true,
                })
                .await?;
            Ok(response.unwrap_or(Value::Null))
        })
        .method("fail", |_ctx, _args| async move {
            Err::<Value, _>(FarmError::call("requested failure"))
        })
        .method("sleep_forever", |_ctx, _args| async move {
            sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });

    let reporter = MethodTable::new().method("ping", |_ctx, _args| async move { Ok(json!("pong")) });

    Arc::new(
        ModuleRegistry::new()
            .with_module("bundler", Arc::new(bundler))
            .with_module("reporter", Arc::new(reporter)),
    )
}

fn remote_only_options(
    state: Arc<TestState>,
    max_workers: usize,
    calls_per_worker: usize,
) -> FarmOptions {
    FarmOptions {
        max_concurrent_workers: max_workers,
        max_concurrent_calls_per_worker: calls_per_worker,
        use_local_worker: false,
        warm_workers: false,
        worker_path: Some("bundler".to_string()),
        modules: test_modules(state),
        ..FarmOptions::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("farmhand=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn calls_fan_out_across_the_pool() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 2, 1)).expect("farm should start");

    let (a, b, c) = tokio::join!(
        farm.run(vec![CallArg::data(1), CallArg::data(2)]),
        farm.run(vec![CallArg::data(3), CallArg::data(4)]),
        farm.run(vec![CallArg::data(5), CallArg::data(6)]),
    );

    assert_eq!(a.expect("first call"), json!(3));
    assert_eq!(b.expect("second call"), json!(7));
    assert_eq!(c.expect("third call"), json!(11));

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn local_path_answers_while_workers_warm_up() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let options = FarmOptions {
        max_concurrent_workers: 2,
        max_concurrent_calls_per_worker: 5,
        use_local_worker: true,
        warm_workers: true,
        worker_path: Some("bundler".to_string()),
        modules: test_modules(state),
        ..FarmOptions::default()
    };
    let farm = Farm::new(options).expect("farm should start");

    // Cold start: the first call resolves on the local path.
    let first = farm
        .run(vec![CallArg::data(1)])
        .await
        .expect("local call should succeed");
    assert_eq!(first, json!(1));

    // Keep calling until every worker has a completed warmup call.
    let mut warmed = false;
    for _ in 0..20 {
        let _ = farm.run(vec![CallArg::data(1)]).await;
        if timeout(Duration::from_millis(250), farm.warmed_up())
            .await
            .is_ok()
        {
            warmed = true;
            break;
        }
    }
    assert!(warmed, "warmup should complete");

    // Past the cutover, the remote path answers the same way.
    let after = farm
        .run(vec![CallArg::data(1)])
        .await
        .expect("remote call should succeed");
    assert_eq!(after, first);

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn crashed_worker_calls_are_retried_on_a_replacement() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state.clone(), 1, 1)).expect("farm should start");

    let result = timeout(
        Duration::from_secs(10),
        farm.create_handle("die_once").call(vec![]),
    )
    .await
    .expect("retry should not hang")
    .expect("retried call should resolve");

    assert_eq!(result, json!("recovered"));
    assert_eq!(state.attempts.load(Ordering::SeqCst), 2);

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn orphaned_calls_run_before_newer_submissions() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state.clone(), 1, 2)).expect("farm should start");

    let mark = |tag: &str| {
        let caller = farm.create_handle("mark");
        let args = vec![CallArg::data(tag)];
        async move { caller.call(args).await }
    };

    // Prime the worker so the next calls are assigned as they arrive.
    mark("P").await.expect("prime call should succeed");

    let (a, b, c) = timeout(
        Duration::from_secs(10),
        async { tokio::join!(mark("A"), mark("B"), mark("C")) },
    )
    .await
    .expect("calls should not hang");
    assert_eq!(a.expect("A"), json!("A"));
    assert_eq!(b.expect("B"), json!("B"));
    assert_eq!(c.expect("C"), json!("C"));

    // A and B die with the first worker; the replacement runs them
    // before C, in reverse of their dispatch order.
    let record = state.recorded();
    assert_eq!(
        record,
        ["P", "A", "B", "B", "A", "C"],
        "unexpected record: {record:?}"
    );

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn per_worker_cap_is_respected() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state.clone(), 1, 2)).expect("farm should start");

    let gauge = farm.create_handle("gauge");
    let mut calls = Vec::new();
    for _ in 0..6 {
        calls.push(gauge.call(vec![]));
    }
    for outcome in futures::future::join_all(calls).await {
        outcome.expect("gauge call should succeed");
    }

    assert!(
        state.max_active.load(Ordering::SeqCst) <= 2,
        "cap exceeded: {}",
        state.max_active.load(Ordering::SeqCst)
    );

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn reverse_handles_call_back_into_the_parent() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 1, 5)).expect("farm should start");

    let handle = farm.create_reverse_handle(|args| async move {
        let input = args
            .first()
            .and_then(CallArg::as_value)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(json!(input * 2))
    });

    let result = farm
        .create_handle("double_remote")
        .call(vec![CallArg::handle(handle), CallArg::data(21)])
        .await
        .expect("reverse call should succeed");

    assert_eq!(result, json!(42));

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn master_calls_reach_parent_modules() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 1, 5)).expect("farm should start");

    let result = farm
        .create_handle("ask_master")
        .call(vec![])
        .await
        .expect("master call should succeed");

    assert_eq!(result, json!("pong"));

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn user_errors_reject_only_their_own_call() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 1, 5)).expect("farm should start");

    let err = farm
        .create_handle("fail")
        .call(vec![])
        .await
        .expect_err("failing method must reject");
    assert_eq!(err.code, ErrorCode::Call);
    assert_eq!(err.message, "requested failure");

    // The farm survives: the next call on the same worker succeeds.
    let ok = farm
        .run(vec![CallArg::data(2), CallArg::data(3)])
        .await
        .expect("farm should still dispatch");
    assert_eq!(ok, json!(5));

    farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn ending_settles_in_flight_calls_and_rejects_new_ones() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 1, 2)).expect("farm should start");

    let first = tokio::spawn({
        let farm = farm.clone();
        async move { farm.create_handle("sleep_forever").call(vec![]).await }
    });
    let second = tokio::spawn({
        let farm = farm.clone();
        async move { farm.create_handle("sleep_forever").call(vec![]).await }
    });
    sleep(Duration::from_millis(100)).await;

    // The call issued while end() is in progress sees the ending error.
    let (end_result, raced) = tokio::join!(farm.end(), farm.run(vec![CallArg::data(1)]));
    end_result.expect("end should succeed");
    let raced = raced.expect_err("calls during ending must reject");
    assert_eq!(raced.code, ErrorCode::Ending);
    assert_eq!(
        raced.message,
        "Cannot add a worker call if workerfarm is ending"
    );

    // Both in-flight futures settle instead of hanging.
    for task in [first, second] {
        let outcome = timeout(Duration::from_secs(2), task)
            .await
            .expect("in-flight call should settle")
            .expect("task should not panic");
        let err = outcome.expect_err("abandoned calls reject");
        assert_eq!(err.code, ErrorCode::Ending);
    }
}

#[tokio::test]
async fn ending_an_idle_farm_is_idempotent() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 2, 1)).expect("farm should start");

    farm.end().await.expect("first end should succeed");
    farm.end().await.expect("second end should succeed");
}

#[tokio::test]
async fn local_and_remote_paths_agree() {
    init_tracing();
    let args = vec![CallArg::data(json!({ "ignored": true })), CallArg::data(4), CallArg::data(5)];

    let local_farm = Farm::new(FarmOptions {
        max_concurrent_workers: 0,
        use_local_worker: true,
        warm_workers: false,
        worker_path: Some("bundler".to_string()),
        modules: test_modules(Arc::new(TestState::default())),
        ..FarmOptions::default()
    })
    .expect("local farm should start");
    let local = local_farm
        .run(args.clone())
        .await
        .expect("local call should succeed");

    let state = Arc::new(TestState::default());
    let remote_farm = Farm::new(remote_only_options(state, 1, 1)).expect("remote farm should start");
    let remote = remote_farm
        .run(args)
        .await
        .expect("remote call should succeed");

    assert_eq!(local, remote);

    local_farm.end().await.expect("end should succeed");
    remote_farm.end().await.expect("end should succeed");
}

#[tokio::test]
async fn missing_worker_path_fails_construction() {
    let err = Farm::new(FarmOptions::default()).expect_err("missing path must fail");
    assert_eq!(err.message, "Please provide a worker path!");
}

#[tokio::test]
async fn unknown_request_targets_fail() {
    init_tracing();
    let state = Arc::new(TestState::default());
    let farm = Farm::new(remote_only_options(state, 1, 1)).expect("farm should start");

    let err = farm
        .process_request(MasterCall {
            idx: None,
            target: CallTarget::Location {
                path: "nope".to_string(),
            },
            method: None,
            args: vec![],
            await_response: true,
        })
        .await
        .expect_err("unknown module must fail");
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = farm
        .process_request(MasterCall {
            idx: None,
            target: CallTarget::Handle {
                id: farmhand::HandleId(404),
            },
            method: None,
            args: vec![],
            await_response: true,
        })
        .await
        .expect_err("unknown handle must fail");
    assert_eq!(err.code, ErrorCode::NotFound);

    farm.end().await.expect("end should succeed");
}
