use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use mom_celery::{
    //
    CeleryError,
    ConnectionOptions,
    DeliveryMode,
    MemoryConnector,
    MemoryHub,
    Resolution,
    Result,
    ResultBody,
    SubmitOptions,
    TaskArgs,
    TaskPublisher,
    TaskPublisherBuilder,
    TaskStatus,
};

#[cfg(feature = "logging")]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(not(feature = "logging"))]
fn init_tracing() {}

/// Stands in for a Celery worker: consumes published tasks from the hub and
/// stores their results.
struct MathWorker {
    // ---
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl MathWorker {
    // ---
    fn spawn(hub: Arc<MemoryHub>, delay: Duration) -> Self {
        // ---
        let (shutdown, mut stop) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut handled = 0;
            loop {
                let published = hub.published();
                for msg in &published[handled..] {
                    tokio::time::sleep(delay).await;
                    let task = msg.json().expect("task body is JSON");
                    hub.complete(task["id"].as_str().expect("task id"), &execute(&task))
                        .expect("store result");
                }
                handled = published.len();

                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        });

        Self { handle, shutdown }
    }

    async fn shutdown(self) {
        // ---
        let _ = self.shutdown.send(());
        self.handle.await.expect("worker task panicked");
    }
}

fn execute(task: &Value) -> ResultBody {
    // ---
    match task["task"].as_str() {
        Some("tasks.add") => {
            let sum: i64 = task["args"]
                .as_array()
                .map(|args| args.iter().filter_map(Value::as_i64).sum())
                .unwrap_or(0);
            ResultBody {
                status: TaskStatus::Success,
                result: json!(sum),
                traceback: None,
            }
        }
        Some("tasks.greet") => ResultBody {
            status: TaskStatus::Success,
            result: json!(format!("hello {}", task["kwargs"]["name"].as_str().unwrap_or("?"))),
            traceback: None,
        },
        other => ResultBody {
            status: TaskStatus::Failure,
            result: json!({"exc_type": "NotRegistered", "exc_message": other}),
            traceback: Some("Traceback (most recent call last):\n  ...".into()),
        },
    }
}

async fn publisher(hub: &Arc<MemoryHub>, options: ConnectionOptions) -> Result<TaskPublisher> {
    // ---
    TaskPublisherBuilder::new(options.normalize()?)
        .connector(MemoryConnector::with_hub(hub.clone()))
        .build()
        .await
}

#[tokio::test]
async fn test_positional_round_trip() -> Result<()> {
    // ---
    init_tracing();
    let hub = MemoryHub::new();
    let worker = MathWorker::spawn(hub.clone(), Duration::ZERO);
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let mut handle = p
        .post_task("tasks.add", TaskArgs::from_value(json!([2, 3]))?)
        .await?;
    let sum = handle.get(Duration::from_secs(5), Duration::from_millis(20)).await?;

    assert_eq!(sum, json!(5));
    assert!(handle.is_success()?);
    assert_eq!(handle.status()?, TaskStatus::Success);
    assert_eq!(handle.traceback()?, None);

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_wire_format_for_positional_args() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let handle = p
        .post_task("tasks.add", TaskArgs::from_value(json!({"0": 2, "1": 3}))?)
        .await?;

    let sent = hub.published();
    assert_eq!(sent.len(), 1);
    let body = sent[0].json()?;

    assert_eq!(body["id"], json!(handle.id().as_str()));
    assert_eq!(body["task"], json!("tasks.add"));
    assert_eq!(body["args"], json!([2, 3]));
    assert_eq!(body["kwargs"], json!({}));
    Ok(())
}

#[tokio::test]
async fn test_wire_format_for_keyword_args() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let worker = MathWorker::spawn(hub.clone(), Duration::ZERO);
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let mut handle = p
        .post_task("tasks.greet", TaskArgs::from_value(json!({"name": "ada"}))?)
        .await?;

    let body = hub.published()[0].json()?;
    assert_eq!(body["args"], json!([]));
    assert_eq!(body["kwargs"], json!({"name": "ada"}));

    let greeting = handle.get(Duration::from_secs(5), Duration::from_millis(20)).await?;
    assert_eq!(greeting, json!("hello ada"));

    worker.shutdown().await;
    Ok(())
}

#[test]
fn test_scalar_args_are_rejected() {
    // ---
    let err = TaskArgs::from_value(json!(42)).unwrap_err();
    assert!(matches!(err, CeleryError::Configuration(_)));
}

#[tokio::test]
async fn test_persistent_messages_set_delivery_mode() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let durable = publisher(&hub, ConnectionOptions::new().persistent_messages(true)).await?;
    let transient = publisher(&hub, ConnectionOptions::new()).await?;

    durable
        .submit("tasks.add", TaskArgs::none(), SubmitOptions::no_handle())
        .await?;
    transient
        .submit("tasks.add", TaskArgs::none(), SubmitOptions::no_handle())
        .await?;

    let sent = hub.published();
    assert_eq!(sent[0].options.delivery_mode, Some(DeliveryMode::Persistent));
    assert_eq!(sent[1].options.delivery_mode, None);
    Ok(())
}

#[tokio::test]
async fn test_default_routing_key_ignores_binding() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new().binding("jobs")).await?;

    p.submit("tasks.add", TaskArgs::none(), SubmitOptions::no_handle())
        .await?;

    assert_eq!(hub.published()[0].routing_key, "celery");
    Ok(())
}

#[test]
fn test_mixed_arguments_cannot_be_built() {
    // ---
    let mixed = serde_json::from_value::<TaskArgs>(json!({"args": [1], "kwargs": {"x": 2}}));
    assert!(mixed.is_err());
}

#[tokio::test]
async fn test_rejected_publish_is_reported() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new()).await?;
    hub.reject_publishes(true);

    let err = p
        .post_task("tasks.add", TaskArgs::positional(vec![json!(1)]))
        .await
        .unwrap_err();

    match err {
        CeleryError::Publish { task_name, task_id } => {
            assert_eq!(task_name, "tasks.add");
            assert!(!task_id.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_skips_backend() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new()).await?;
    let connections = hub.connection_count();

    let submission = p
        .submit("tasks.add", TaskArgs::none(), SubmitOptions::no_handle())
        .await?;

    assert!(submission.into_handle().is_none());
    assert_eq!(hub.connection_count(), connections);
    assert_eq!(hub.published().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failure_is_returned_as_data() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let worker = MathWorker::spawn(hub.clone(), Duration::ZERO);
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let mut handle = p.post_task("tasks.missing", TaskArgs::none()).await?;
    let payload = handle.get(Duration::from_secs(5), Duration::from_millis(20)).await?;

    assert_eq!(payload["exc_type"], json!("NotRegistered"));
    assert_eq!(handle.status()?, TaskStatus::Failure);
    assert!(handle.failed().await?);
    assert!(handle.traceback()?.is_some());

    worker.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_readiness_is_sticky() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let mut handle = p.post_task("tasks.add", TaskArgs::none()).await?;
    assert!(!handle.is_ready().await?);
    assert!(matches!(handle.status(), Err(CeleryError::PrematureAccess { .. })));

    hub.complete(
        handle.id().as_str(),
        &ResultBody {
            status: TaskStatus::Success,
            result: json!(0),
            traceback: None,
        },
    )?;

    assert!(handle.is_ready().await?);
    let fetches = hub.fetch_count();
    for _ in 0..5 {
        assert!(handle.is_ready().await?);
    }
    assert_eq!(hub.fetch_count(), fetches);
    assert_eq!(handle.resolution(), Resolution::Resolved(TaskStatus::Success));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_get_times_out_on_schedule() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new()).await?;
    let mut handle = p.post_task("tasks.add", TaskArgs::none()).await?;

    let started = Instant::now();
    let err = handle
        .get(Duration::from_secs(2), Duration::from_millis(500))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, CeleryError::ResultTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(1500), "too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2500), "too late: {elapsed:?}");
    assert_eq!(handle.state(), TaskStatus::Pending);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_result_arriving_mid_wait() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let worker = MathWorker::spawn(hub.clone(), Duration::from_millis(700));
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let mut handle = p
        .post_task("tasks.add", TaskArgs::positional(vec![json!(40), json!(2)]))
        .await?;

    let started = Instant::now();
    let answer = handle.get(Duration::from_secs(5), Duration::from_millis(100)).await?;
    let elapsed = started.elapsed();

    assert_eq!(answer, json!(42));
    assert!(elapsed >= Duration::from_millis(700), "too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "polling lagged: {elapsed:?}");
    assert_eq!(handle.resolution(), Resolution::Resolved(TaskStatus::Success));

    // Resolved once; later calls are answered from the cache.
    let fetches = hub.fetch_count();
    for _ in 0..3 {
        assert!(handle.is_ready().await?);
    }
    assert_eq!(handle.get(Duration::from_secs(1), Duration::from_millis(100)).await?, json!(42));
    assert_eq!(hub.fetch_count(), fetches);

    worker.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropping_get_cancels_wait() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let p = publisher(&hub, ConnectionOptions::new()).await?;
    let mut handle = p.post_task("tasks.add", TaskArgs::none()).await?;

    let waited = tokio::time::timeout(
        Duration::from_millis(300),
        handle.get(Duration::from_secs(60), Duration::from_millis(50)),
    )
    .await;

    assert!(waited.is_err());
    assert_eq!(handle.resolution(), Resolution::Unresolved);
    Ok(())
}

#[tokio::test]
async fn test_handles_are_independent() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let worker = MathWorker::spawn(hub.clone(), Duration::ZERO);
    let p = publisher(&hub, ConnectionOptions::new()).await?;

    let mut handles = Vec::new();
    for n in 0..10 {
        handles.push(
            p.post_task("tasks.add", TaskArgs::positional(vec![json!(n), json!(n)]))
                .await?,
        );
    }

    let waits = handles.into_iter().enumerate().map(|(n, mut h)| async move {
        let v = h.get(Duration::from_secs(5), Duration::from_millis(20)).await?;
        assert_eq!(v, json!(2 * n as i64));
        Ok::<_, CeleryError>(())
    });
    for wait in waits {
        wait.await?;
    }

    worker.shutdown().await;
    Ok(())
}
