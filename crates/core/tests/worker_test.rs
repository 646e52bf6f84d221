//! End-to-end worker behaviour against the in-memory storage.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tq_core::{
    Job, JobId, JobStatus, MemoryStorage, RetryPolicy, Storage, TaskArgs, TaskError,
    TaskRegistry, TaskResult, Worker, WorkerConfig,
};

async fn add(args: TaskArgs) -> TaskResult {
    let a: i64 = args.arg(0)?;
    let b: i64 = args.arg(1)?;
    Ok(json!(a + b))
}

async fn scale(args: TaskArgs) -> TaskResult {
    let value: i64 = args.arg(0)?;
    let factor: i64 = args.kwarg("factor")?;
    Ok(json!(value * factor))
}

async fn always_fails(_args: TaskArgs) -> TaskResult {
    Err(TaskError::new("RuntimeError", "nope"))
}

async fn hangs(_args: TaskArgs) -> TaskResult {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Ok(Value::Null)
}

async fn explodes(_args: TaskArgs) -> TaskResult {
    panic!("handler blew up")
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::default()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(10))
        .cap(Duration::from_millis(20))
        .jitter(false)
}

fn config(retry: RetryPolicy) -> WorkerConfig {
    WorkerConfig::builder()
        .worker_id("test-worker")
        .poll_timeout(Duration::from_millis(20))
        .retry(retry)
        .build()
}

fn start(worker: &Worker<MemoryStorage>) -> JoinHandle<()> {
    let runner = worker.clone();
    tokio::spawn(async move { runner.run_forever().await })
}

async fn shutdown(worker: &Worker<MemoryStorage>, handle: JoinHandle<()>) {
    worker.stop();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker loop did not exit")
        .unwrap();
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

async fn status_of(storage: &MemoryStorage, id: &JobId) -> Option<JobStatus> {
    storage.get(id).await.unwrap().map(|job| job.status)
}

#[tokio::test]
async fn test_successful_job_is_marked_done() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("add", add);
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(3))).unwrap();

    let job = Job::new("add").with_args((2, 3)).unwrap();
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            status_of(&storage, &id).await == Some(JobStatus::Success)
        })
        .await
    );
    shutdown(&worker, handle).await;

    let stored = storage.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(stored.error.is_none());

    let metrics = worker.metrics();
    assert_eq!(metrics.processed, 1);
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.retried, 0);
    assert_eq!(metrics.dead_lettered, 0);
}

#[tokio::test]
async fn test_keyword_arguments_reach_handler() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("scale", scale);
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(0))).unwrap();

    let job = Job::new("scale")
        .with_args((4,))
        .unwrap()
        .with_kwargs(json!({"factor": 3}))
        .unwrap();
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            status_of(&storage, &id).await == Some(JobStatus::Success)
        })
        .await
    );
    shutdown(&worker, handle).await;
}

#[tokio::test]
async fn test_failing_job_retries_then_dead_letters() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("always_fails", always_fails);
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(1))).unwrap();

    let job = Job::new("always_fails");
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            storage.dead_len().await.unwrap() == 1
        })
        .await
    );
    shutdown(&worker, handle).await;
    assert!(worker.join(Duration::from_secs(1)).await);

    let stored = storage.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.error.as_deref(), Some("RuntimeError: nope"));

    let dead = storage.list_dead(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, id);
    assert_eq!(dead[0].job.status, JobStatus::Failed);
    assert!(dead[0].error.contains("RuntimeError"));

    let metrics = worker.metrics();
    assert_eq!(metrics.processed, 2);
    assert_eq!(metrics.succeeded, 0);
    assert_eq!(metrics.retried, 1);
    assert_eq!(metrics.dead_lettered, 1);
}

#[tokio::test]
async fn test_hung_handler_times_out_and_is_abandoned() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("hangs", hangs);
    let config = WorkerConfig::builder()
        .poll_timeout(Duration::from_millis(20))
        .task_timeout(Duration::from_millis(50))
        .retry(RetryPolicy::no_retries())
        .build();
    let worker = Worker::new(storage.clone(), registry, config).unwrap();

    let job = Job::new("hangs");
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let started = Instant::now();
    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            storage.dead_len().await.unwrap() == 1
        })
        .await
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    let stored = storage.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.error.unwrap().starts_with("TaskTimeout"));

    shutdown(&worker, handle).await;
    // The abandoned runner is still sleeping and is never killed.
    assert!(!worker.join(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_task_names_resolve_case_insensitively() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("MyTask", |_args| async { Ok(json!("ok")) });
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(0))).unwrap();

    let lower = Job::new("mytask");
    let upper = Job::new("MYTASK");
    let ids = [lower.id, upper.id];
    storage.enqueue(lower).await.unwrap();
    storage.enqueue(upper).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            for id in &ids {
                if status_of(&storage, id).await != Some(JobStatus::Success) {
                    return false;
                }
            }
            true
        })
        .await
    );
    shutdown(&worker, handle).await;
    assert_eq!(worker.metrics().succeeded, 2);
}

#[tokio::test]
async fn test_unknown_task_is_dead_lettered_without_retries() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("add", add);
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(3))).unwrap();

    let job = Job::new("does_not_exist");
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            storage.dead_len().await.unwrap() == 1
        })
        .await
    );
    shutdown(&worker, handle).await;

    let stored = storage.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 1);

    let dead = storage.list_dead(10).await.unwrap();
    assert!(dead[0].error.starts_with("TaskNotFound"));
    assert!(dead[0].error.contains("add"));

    let metrics = worker.metrics();
    assert_eq!(metrics.retried, 0);
    assert_eq!(metrics.dead_lettered, 1);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_loop() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("explodes", explodes);
    registry.register("add", add);
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(0))).unwrap();

    let bad = Job::new("explodes");
    let good = Job::new("add").with_args((1, 1)).unwrap();
    let (bad_id, good_id) = (bad.id, good.id);
    storage.enqueue(bad).await.unwrap();
    storage.enqueue(good).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            status_of(&storage, &good_id).await == Some(JobStatus::Success)
        })
        .await
    );
    shutdown(&worker, handle).await;

    let failed = storage.get(&bad_id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("TaskPanicked: handler blew up")
    );
    assert_eq!(worker.metrics().dead_lettered, 1);
}

#[tokio::test]
async fn test_blocking_handler_errors_carry_their_kind() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register_blocking("parse", |args| {
        let raw: String = args.arg(0)?;
        std::thread::sleep(Duration::from_millis(5));
        let parsed: i64 = raw.parse()?;
        Ok(json!(parsed))
    });
    let worker = Worker::new(storage.clone(), registry, config(fast_retry(0))).unwrap();

    let good = Job::new("parse").with_args(("42",)).unwrap();
    let bad = Job::new("parse").with_args(("forty-two",)).unwrap();
    let (good_id, bad_id) = (good.id, bad.id);
    storage.enqueue(good).await.unwrap();
    storage.enqueue(bad).await.unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            storage.dead_len().await.unwrap() == 1
                && status_of(&storage, &good_id).await == Some(JobStatus::Success)
        })
        .await
    );
    shutdown(&worker, handle).await;

    let failed = storage.get(&bad_id).await.unwrap().unwrap();
    assert!(failed.error.unwrap().starts_with("ParseIntError"));
}

#[tokio::test]
async fn test_reaper_recovers_abandoned_claim() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("add", add);

    let job = Job::new("add").with_args((5, 5)).unwrap();
    let id = job.id;
    storage.enqueue(job).await.unwrap();
    // A claim by a worker that then vanished.
    let claimed = storage.dequeue(None).await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 1);

    let config = WorkerConfig::builder()
        .poll_timeout(Duration::from_millis(20))
        .visibility_timeout(Duration::from_millis(50))
        .reap_interval(Duration::from_millis(20))
        .retry(fast_retry(0))
        .build();
    let worker = Worker::new(storage.clone(), registry, config).unwrap();

    let handle = start(&worker);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            status_of(&storage, &id).await == Some(JobStatus::Success)
        })
        .await
    );
    shutdown(&worker, handle).await;
    assert!(worker.join(Duration::from_secs(1)).await);

    assert_eq!(storage.get(&id).await.unwrap().unwrap().attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_sharing_storage_run_each_job_once() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    registry.register("count", move |_args| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    });

    let workers: Vec<_> = (0..3)
        .map(|_| Worker::new(storage.clone(), registry.clone(), config(fast_retry(0))).unwrap())
        .collect();
    let handles: Vec<_> = workers.iter().map(start).collect();

    for _ in 0..60 {
        storage.enqueue(Job::new("count")).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || async {
            workers.iter().map(|w| w.metrics().succeeded).sum::<u64>() == 60
        })
        .await
    );
    for (worker, handle) in workers.iter().zip(handles) {
        shutdown(worker, handle).await;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 60);
    assert_eq!(storage.size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_and_join_quiesce_worker() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("always_fails", always_fails);
    let retry = RetryPolicy::default()
        .max_retries(1)
        .base_delay(Duration::from_millis(100))
        .cap(Duration::from_millis(100))
        .jitter(false);
    let worker = Worker::new(storage.clone(), registry, config(retry)).unwrap();

    let job = Job::new("always_fails");
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let handle = start(&worker);
    assert!(wait_until(Duration::from_secs(2), || async { worker.metrics().retried == 1 }).await);
    shutdown(&worker, handle).await;

    // The pending retry timer still completes during join.
    assert!(worker.join(Duration::from_secs(1)).await);
    let stored = storage.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(storage.size().await.unwrap(), 1);
}

#[tokio::test]
async fn test_dropped_worker_still_requeues_pending_retry() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("always_fails", always_fails);
    let retry = RetryPolicy::default()
        .max_retries(1)
        .base_delay(Duration::from_millis(100))
        .cap(Duration::from_millis(100))
        .jitter(false);
    let worker = Worker::new(storage.clone(), registry, config(retry)).unwrap();

    let job = Job::new("always_fails");
    let id = job.id;
    storage.enqueue(job).await.unwrap();

    let handle = start(&worker);
    assert!(wait_until(Duration::from_secs(2), || async { worker.metrics().retried == 1 }).await);
    shutdown(&worker, handle).await;
    drop(worker);

    assert!(
        wait_until(Duration::from_secs(1), || async {
            status_of(&storage, &id).await == Some(JobStatus::Pending)
        })
        .await
    );
    assert_eq!(storage.size().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_does_not_block_running_worker() {
    let storage = MemoryStorage::new();
    let registry = TaskRegistry::new();
    registry.register("add", add);
    registry.register("hangs", hangs);
    let config = WorkerConfig::builder()
        .poll_timeout(Duration::from_millis(20))
        .task_timeout(Duration::from_millis(100))
        .visibility_timeout(Duration::from_secs(5))
        .reap_interval(Duration::from_millis(20))
        .retry(fast_retry(0))
        .build();
    let worker = Worker::new(storage.clone(), registry, config).unwrap();
    let handle = start(&worker);

    // An idle worker settles even though its reaper keeps running.
    assert!(worker.join(Duration::from_millis(200)).await);

    storage.enqueue(Job::new("hangs")).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || async { worker.metrics().processed == 1 }).await);

    // The abandoned runner keeps this join waiting for its whole timeout.
    let joiner = worker.clone();
    let join_task = tokio::spawn(async move { joiner.join(Duration::from_secs(2)).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let job = Job::new("add").with_args((4, 4)).unwrap();
    let id = job.id;
    storage.enqueue(job).await.unwrap();
    assert!(
        wait_until(Duration::from_millis(500), || async {
            status_of(&storage, &id).await == Some(JobStatus::Success)
        })
        .await
    );
    assert!(!join_task.is_finished());

    assert!(!join_task.await.unwrap());
    shutdown(&worker, handle).await;
}
