//! Integration tests for pool dispatch, batching, failure handling and shutdown.
//!
//! Most tests run against `ScriptedUnit`, an in-memory unit that sleeps for the
//! requested time and records what it was sent, so scheduling invariants can
//! be checked directly. Failure-path tests use real thread units running the
//! built-in handlers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use taskpool::{
    builtin, Pool, PoolConfig, PoolError, ResultEnvelope, TaskEnvelope, ThreadSpawner,
    UnitConfig, UnitSpawner, WorkerUnit,
};

// ── Scripted units ─────────────────────────────────────────────────────

/// Observations shared by every scripted unit of one pool.
#[derive(Default)]
struct Tally {
    /// Times a unit was sent a task while it still had one in flight.
    violations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    /// Labels in the order units received them.
    received: Mutex<Vec<String>>,
    terminated: AtomicUsize,
}

impl Tally {
    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

/// Payload: `{"label": str, "ms": int, "die": bool, "fail": bool, "garbage": bool}`; batch
/// items in `element` are read as `ms`.
struct ScriptedUnit {
    id: usize,
    tally: Arc<Tally>,
    in_flight: Arc<AtomicBool>,
    dead: AtomicBool,
    results_tx: mpsc::UnboundedSender<Vec<u8>>,
    results_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl WorkerUnit for ScriptedUnit {
    fn id(&self) -> usize {
        self.id
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), PoolError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.tally.violations.fetch_add(1, Ordering::SeqCst);
        }
        let active = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.max_active.fetch_max(active, Ordering::SeqCst);

        let task = TaskEnvelope::from_bytes(&frame).unwrap();
        let payload = task.payload;
        let label = payload["label"].as_str().unwrap_or_default().to_string();
        self.tally.received.lock().unwrap().push(label.clone());

        if payload["die"].as_bool().unwrap_or(false) {
            self.dead.store(true, Ordering::SeqCst);
            self.in_flight.store(false, Ordering::SeqCst);
            self.tally.active.fetch_sub(1, Ordering::SeqCst);
            return Ok(());
        }

        let ms = payload["ms"]
            .as_u64()
            .or_else(|| payload["element"].as_u64())
            .unwrap_or(0);
        let result = if payload["fail"].as_bool().unwrap_or(false) {
            ResultEnvelope::failure(format!("{label} failed"))
        } else {
            ResultEnvelope::success(json!({ "unit": self.id, "label": label }))
        };

        let frame = if payload["garbage"].as_bool().unwrap_or(false) {
            b"not a result envelope".to_vec()
        } else {
            result.to_bytes().unwrap()
        };

        let tx = self.results_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let tally = Arc::clone(&self.tally);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            in_flight.store(false, Ordering::SeqCst);
            tally.active.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(frame);
        });
        Ok(())
    }

    async fn next_result(&self) -> Option<Vec<u8>> {
        if self.dead.load(Ordering::SeqCst) {
            return None;
        }
        self.results_rx.lock().await.recv().await
    }

    async fn terminate(&self) {
        self.tally.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedSpawner {
    tally: Arc<Tally>,
    /// Fail construction of this unit id.
    fail_at: Option<usize>,
}

impl ScriptedSpawner {
    fn new() -> Self {
        Self {
            tally: Arc::new(Tally::default()),
            fail_at: None,
        }
    }
}

#[async_trait]
impl UnitSpawner for ScriptedSpawner {
    async fn spawn(&self, id: usize, _config: &UnitConfig) -> Result<Arc<dyn WorkerUnit>, PoolError> {
        if self.fail_at == Some(id) {
            return Err(PoolError::Io(std::io::Error::other("no more workers")));
        }
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(ScriptedUnit {
            id,
            tally: Arc::clone(&self.tally),
            in_flight: Arc::new(AtomicBool::new(false)),
            dead: AtomicBool::new(false),
            results_tx,
            results_rx: AsyncMutex::new(results_rx),
        }))
    }
}

async fn scripted_pool(units: usize) -> (Pool, Arc<Tally>) {
    let spawner = ScriptedSpawner::new();
    let tally = Arc::clone(&spawner.tally);
    let pool = Pool::new(units, UnitConfig::default(), &spawner).await.unwrap();
    (pool, tally)
}

async fn thread_pool(units: usize) -> Pool {
    Pool::new(units, UnitConfig::default(), &ThreadSpawner::new(builtin::registry()))
        .await
        .unwrap()
}

fn task(label: &str, ms: u64) -> Value {
    json!({ "label": label, "ms": ms })
}

// ── Dispatch ────────────────────────────────────────────────────────

#[tokio::test]
async fn two_units_five_tasks_all_settle() {
    let (pool, tally) = scripted_pool(2).await;

    let durations = [50u64, 10, 30, 5, 20];
    let handles: Vec<_> = durations
        .iter()
        .enumerate()
        .map(|(i, ms)| pool.submit("scripted", task(&format!("t{i}"), *ms)))
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle.await.unwrap();
        assert_eq!(value["label"], format!("t{i}"));
    }

    assert_eq!(tally.violations.load(Ordering::SeqCst), 0);
    assert!(tally.max_active.load(Ordering::SeqCst) <= 2);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.busy_units, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.functions["scripted"].executed, 5);

    pool.terminate().await;
}

#[tokio::test]
async fn many_tasks_never_overlap_on_a_unit() {
    let (pool, tally) = scripted_pool(3).await;

    let handles: Vec<_> = (0..40)
        .map(|i| pool.submit("scripted", task(&format!("t{i}"), (i % 7) as u64)))
        .collect();
    let results = futures::future::join_all(handles).await;

    assert_eq!(results.len(), 40);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(tally.violations.load(Ordering::SeqCst), 0);
    assert!(tally.max_active.load(Ordering::SeqCst) <= 3);
    pool.terminate().await;
}

#[tokio::test]
async fn single_unit_dispatches_in_submission_order() {
    let (pool, tally) = scripted_pool(1).await;

    let labels = ["a", "b", "c", "d", "e"];
    let handles: Vec<_> = labels.iter().map(|l| pool.submit("scripted", task(l, 5))).collect();
    futures::future::join_all(handles).await;

    assert_eq!(tally.received(), labels.to_vec());
    pool.terminate().await;
}

#[tokio::test]
async fn queued_tasks_dispatch_in_order_across_units() {
    let (pool, tally) = scripted_pool(2).await;

    // Unit 0 stays busy with the long task, so every queued task must go
    // through unit 1 one at a time, oldest first.
    let long = pool.submit("scripted", task("long", 400));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let queued: Vec<_> = ["q0", "q1", "q2", "q3"]
        .iter()
        .map(|l| pool.submit("scripted", task(l, 30)))
        .collect();

    for (i, handle) in queued.into_iter().enumerate() {
        let value = handle.await.unwrap();
        assert_eq!(value["label"], format!("q{i}"));
        assert_eq!(value["unit"], 1);
    }
    assert_eq!(long.await.unwrap()["unit"], 0);

    assert_eq!(tally.received(), vec!["long", "q0", "q1", "q2", "q3"]);
    assert_eq!(tally.violations.load(Ordering::SeqCst), 0);
    pool.terminate().await;
}

#[tokio::test]
async fn queued_tasks_wait_for_busy_units() {
    let (pool, _tally) = scripted_pool(2).await;

    let handles: Vec<_> = (0..5)
        .map(|i| pool.submit("scripted", task(&format!("t{i}"), 100)))
        .collect();

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.busy_units, 2);
    assert_eq!(stats.queued, 3);

    futures::future::join_all(handles).await;
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.busy_units, 0);
    assert_eq!(stats.queued, 0);
    pool.terminate().await;
}

#[tokio::test]
async fn idle_pool_prefers_lowest_unit() {
    let (pool, _tally) = scripted_pool(3).await;

    for i in 0..4 {
        let value = pool.submit("scripted", task(&format!("t{i}"), 1)).await.unwrap();
        assert_eq!(value["unit"], 0);
    }
    pool.terminate().await;
}

#[tokio::test]
async fn typed_decode_through_pool() {
    let pool = thread_pool(2).await;
    let total: f64 = pool
        .submit("sum", json!({"numbers": [1, 2, 3]}))
        .decode()
        .await
        .unwrap();
    assert_eq!(total, 6.0);
    pool.terminate().await;
}

// ── Batches ─────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_batch_resolves_without_touching_units() {
    let (pool, tally) = scripted_pool(2).await;

    pool.submit_batch("scripted", Vec::<u64>::new(), json!({})).await.unwrap();

    assert!(tally.received().is_empty());
    assert_eq!(pool.stats().await.unwrap().settled(), 0);
    pool.terminate().await;
}

#[tokio::test]
async fn batch_waits_for_slowest_task() {
    let (pool, _tally) = scripted_pool(2).await;

    let batch = pool.submit_batch("scripted", vec![400u64, 5, 5], json!({"label": "batch"}));
    tokio::pin!(batch);

    // The 400ms item keeps the batch pending well past the short ones.
    let early = tokio::time::timeout(Duration::from_millis(150), &mut batch).await;
    assert!(early.is_err(), "batch resolved before its slowest task");

    batch.await.unwrap();
    assert_eq!(pool.stats().await.unwrap().completed, 3);
    pool.terminate().await;
}

#[tokio::test]
async fn batch_items_land_under_element_key() {
    let pool = thread_pool(2).await;

    let results = pool
        .collect_batch("echo", vec!["a.ts", "b.ts"], json!({"outDir": "dist"}))
        .await
        .unwrap();
    let values: Vec<Value> = results.into_iter().map(Result::unwrap).collect();

    assert_eq!(
        values,
        vec![
            json!({"outDir": "dist", "element": "a.ts"}),
            json!({"outDir": "dist", "element": "b.ts"}),
        ]
    );
    pool.terminate().await;
}

#[tokio::test]
async fn batch_reports_failure_after_all_settle() {
    let pool = thread_pool(2).await;

    let err = pool
        .submit_batch("fail", vec![1, 2, 3], json!({"message": "bad input"}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::TaskFailed { .. }));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.busy_units, 0);
    pool.terminate().await;
}

#[tokio::test]
async fn batch_rejects_non_object_shared_payload() {
    let (pool, tally) = scripted_pool(1).await;

    let err = pool.submit_batch("scripted", vec![1], "shared").await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidPayload(_)));
    assert!(tally.received().is_empty());
    pool.terminate().await;
}

#[tokio::test]
async fn labelled_runs_return_results() {
    let pool = thread_pool(2).await;

    let value = pool.run("echoing input", "echo", json!({"x": 1})).await.unwrap();
    assert_eq!(value, json!({"x": 1}));

    pool.run_batch("summing numbers", "sum", vec![1, 2, 3], ()).await.unwrap();
    assert_eq!(pool.stats().await.unwrap().completed, 4);
    pool.terminate().await;
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_task_leaves_unit_in_rotation() {
    let pool = thread_pool(1).await;

    let err = pool.submit("fail", json!({"message": "type error"})).await.unwrap_err();
    match err {
        PoolError::TaskFailed {
            function_name,
            message,
        } => {
            assert_eq!(function_name, "fail");
            assert_eq!(message, "type error");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(pool.submit("echo", json!("still here")).await.unwrap(), json!("still here"));
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retired_units, 0);
    pool.terminate().await;
}

#[tokio::test]
async fn panicking_handler_is_a_task_failure() {
    let pool = thread_pool(1).await;

    let err = pool.submit("panic", ()).await.unwrap_err();
    assert!(err.is_task_local());
    assert_eq!(pool.submit("sum", json!({"numbers": [2, 2]})).await.unwrap(), json!(4.0));
    pool.terminate().await;
}

#[tokio::test]
async fn unknown_function_is_a_task_failure() {
    let pool = thread_pool(1).await;
    let err = pool.submit("does-not-exist", ()).await.unwrap_err();
    assert!(matches!(err, PoolError::TaskFailed { .. }));
    pool.terminate().await;
}

#[tokio::test]
async fn failing_tally_task_only_rejects_its_own_future() {
    let (pool, _tally) = scripted_pool(2).await;

    let bad = pool.submit("scripted", json!({"label": "bad", "ms": 10, "fail": true}));
    let good = pool.submit("scripted", task("good", 30));

    assert!(matches!(bad.await, Err(PoolError::TaskFailed { .. })));
    assert_eq!(good.await.unwrap()["label"], "good");
    pool.terminate().await;
}

#[tokio::test]
async fn undecodable_result_retires_unit() {
    let (pool, tally) = scripted_pool(2).await;

    let err = pool
        .submit("scripted", json!({"label": "garbled", "garbage": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Protocol(_)));

    for i in 0..3 {
        let value = pool.submit("scripted", task(&format!("after{i}"), 1)).await.unwrap();
        assert_eq!(value["label"], format!("after{i}"));
        assert_eq!(value["unit"], 1);
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.retired_units, 1);
    assert_eq!(stats.failed, 1);
    assert!(tally.terminated.load(Ordering::SeqCst) >= 1);
    pool.terminate().await;
}

#[tokio::test]
async fn lost_unit_is_retired_and_pool_continues() {
    let (pool, tally) = scripted_pool(2).await;

    let err = pool
        .submit("scripted", json!({"label": "doomed", "die": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::UnitLost { unit_id: 0 }));

    for i in 0..3 {
        let value = pool.submit("scripted", task(&format!("after{i}"), 1)).await.unwrap();
        assert_eq!(value["unit"], 1);
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.retired_units, 1);
    assert_eq!(stats.lost, 1);
    assert_eq!(stats.completed, 3);
    assert_eq!(tally.violations.load(Ordering::SeqCst), 0);
    pool.terminate().await;
}

#[tokio::test]
async fn losing_every_unit_rejects_remaining_work() {
    let (pool, _tally) = scripted_pool(1).await;

    let doomed = pool.submit("scripted", json!({"label": "doomed", "die": true}));
    let queued = pool.submit("scripted", task("queued", 1));

    assert!(matches!(doomed.await, Err(PoolError::UnitLost { .. })));
    assert!(matches!(queued.await, Err(PoolError::NoLiveUnits)));
    assert!(matches!(
        pool.submit("scripted", task("late", 1)).await,
        Err(PoolError::NoLiveUnits)
    ));
    pool.terminate().await;
}

// ── Construction and shutdown ───────────────────────────────────────

#[tokio::test]
async fn construction_failure_terminates_started_units() {
    let mut spawner = ScriptedSpawner::new();
    spawner.fail_at = Some(2);

    let err = match Pool::new(4, UnitConfig::default(), &spawner).await {
        Ok(_) => panic!("construction should fail"),
        Err(e) => e,
    };

    assert!(matches!(err, PoolError::Construction { unit_id: 2, .. }), "got: {err}");
    assert_eq!(spawner.tally.terminated.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn from_config_resolves_unit_count() {
    let config = PoolConfig {
        units: 3,
        ..Default::default()
    };
    let pool = Pool::from_config(&config, &ThreadSpawner::new(builtin::registry()))
        .await
        .unwrap();
    assert_eq!(pool.unit_count(), 3);
    assert_eq!(pool.stats().await.unwrap().unit_count, 3);
    pool.terminate().await;
}

#[tokio::test]
async fn terminate_settles_queued_and_in_flight_tasks() {
    let (pool, tally) = scripted_pool(1).await;

    let running = pool.submit("scripted", task("running", 500));
    let queued_a = pool.submit("scripted", task("queued-a", 1));
    let queued_b = pool.submit("scripted", task("queued-b", 1));

    // Let the first task reach the unit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.terminate().await;

    assert!(matches!(running.await, Err(PoolError::Terminated)));
    assert!(matches!(queued_a.await, Err(PoolError::Terminated)));
    assert!(matches!(queued_b.await, Err(PoolError::Terminated)));

    assert_eq!(tally.received(), vec!["running".to_string()]);
    assert_eq!(tally.terminated.load(Ordering::SeqCst), 1);
    assert!(pool.is_terminated());
}

#[tokio::test]
async fn submit_after_terminate_is_rejected() {
    let (pool, tally) = scripted_pool(2).await;
    pool.terminate().await;

    let result = pool.submit("scripted", task("late", 1)).await;
    assert!(matches!(result, Err(PoolError::Terminated)));
    assert!(tally.received().is_empty());
}

#[tokio::test]
async fn dropping_last_handle_terminates_units() {
    let (pool, tally) = scripted_pool(3).await;
    let clone = pool.clone();
    drop(pool);
    assert_eq!(clone.submit("scripted", task("x", 1)).await.unwrap()["label"], "x");
    drop(clone);

    for _ in 0..50 {
        if tally.terminated.load(Ordering::SeqCst) == 3 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("units were not terminated after the last handle dropped");
}
