use serde_json::json;
use std::sync::Arc;

use mom_celery::{
    //
    AsyncResult,
    CeleryError,
    ConnectionOptions,
    HandleSnapshot,
    MemoryConnector,
    MemoryHub,
    Result,
    ResultBody,
    TaskArgs,
    TaskPublisherBuilder,
    TaskStatus,
    TlsOptions,
    TransportCatalog,
    TransportKind,
};

fn success(result: serde_json::Value) -> ResultBody {
    ResultBody {
        status: TaskStatus::Success,
        result,
        traceback: None,
    }
}

#[tokio::test]
async fn test_explicit_memory_selector_uses_global_hub() -> Result<()> {
    // ---
    let descriptor = ConnectionOptions::new().transport("memory").normalize()?;
    let publisher = TaskPublisherBuilder::new(descriptor).build().await?;

    let handle = publisher
        .post_task("tasks.global", TaskArgs::positional(vec![json!("x")]))
        .await?;

    let hub = MemoryConnector::global_hub();
    assert!(hub
        .published()
        .iter()
        .any(|m| m.json().map(|b| b["id"] == json!(handle.id().as_str())).unwrap_or(false)));
    Ok(())
}

#[tokio::test]
async fn test_rehydrate_by_task_id() -> Result<()> {
    // ---
    let descriptor = Arc::new(ConnectionOptions::new().transport("memory").normalize()?);
    let hub = MemoryConnector::global_hub();

    let mut handle = AsyncResult::rehydrate("rehydrated-task", descriptor).await?;
    assert!(!handle.is_ready().await?);
    assert_eq!(handle.task_name(), None);

    hub.complete("rehydrated-task", &success(json!("done")))?;
    assert!(handle.is_ready().await?);
    assert_eq!(handle.result()?, &json!("done"));
    Ok(())
}

#[tokio::test]
async fn test_snapshot_survives_serialization() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let connector = MemoryConnector::with_hub(hub.clone());
    let publisher = TaskPublisherBuilder::new(ConnectionOptions::new().normalize()?)
        .connector(connector.clone())
        .build()
        .await?;

    let handle = publisher
        .post_task("tasks.add", TaskArgs::positional(vec![json!(1), json!(2)]))
        .await?;
    let task_id = handle.id().clone();
    let saved = serde_json::to_string(&handle.snapshot())?;
    drop(handle);

    hub.complete(task_id.as_str(), &success(json!(3)))?;

    let snapshot: HandleSnapshot = serde_json::from_str(&saved)?;
    let mut revived = AsyncResult::from_snapshot_with(snapshot, &connector).await?;

    assert_eq!(revived.id(), &task_id);
    assert_eq!(revived.task_name(), Some("tasks.add"));
    assert_eq!(revived.get_default().await?, json!(3));
    Ok(())
}

#[tokio::test]
async fn test_empty_catalog_has_no_transport() -> Result<()> {
    // ---
    let err = TaskPublisherBuilder::new(ConnectionOptions::new().normalize()?)
        .catalog(TransportCatalog::empty())
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, CeleryError::NoTransportAvailable(_)));
    Ok(())
}

#[tokio::test]
async fn test_tls_requirement_filters_catalog() -> Result<()> {
    // ---
    let descriptor = ConnectionOptions::new().tls(TlsOptions::enabled()).normalize()?;

    let catalog = TransportCatalog::empty().with(TransportKind::Redis, false);
    assert!(matches!(
        catalog.resolve(&descriptor),
        Err(CeleryError::NoTransportAvailable(_))
    ));

    let catalog = catalog.with(TransportKind::Lapin, true);
    assert_eq!(catalog.resolve(&descriptor)?, TransportKind::Lapin);
    Ok(())
}

#[tokio::test]
async fn test_refused_connection_fails_build() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    hub.refuse_connections(true);

    let err = TaskPublisherBuilder::new(ConnectionOptions::new().normalize()?)
        .connector(MemoryConnector::with_hub(hub))
        .build()
        .await
        .unwrap_err();

    assert!(matches!(err, CeleryError::Connection(_)));
    Ok(())
}

#[cfg(not(feature = "transport_redis"))]
#[test]
fn test_disabled_adapter_reports_unavailable() {
    // ---
    assert!(matches!(
        mom_celery::create_connector(TransportKind::Redis),
        Err(CeleryError::NoTransportAvailable(_))
    ));
}

#[cfg(feature = "transport_lapin")]
#[test]
fn test_installed_catalog_prefers_lapin() {
    // ---
    let first = TransportCatalog::installed().entries()[0];
    assert_eq!(first.kind, TransportKind::Lapin);
    assert!(first.supports_tls);
}
