//! Integration tests for the endpoint registry and container groups

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kafka_listener_core::testing::MockCluster;
use kafka_listener_core::{
    handler_fn, BackOff, ContainerFactory, ContainerFailure, ContainerProperties,
    ContainerState, EndpointDescriptor, EndpointRegistry, FailureListener, HandlerOutput,
    ListenerError, RecordHandler,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn registry(cluster: &MockCluster) -> EndpointRegistry {
    let properties = ContainerProperties {
        poll_timeout: Duration::from_millis(20),
        commit_retry: BackOff::fixed(Duration::from_millis(5), 3),
        connection_retry: BackOff::fixed(Duration::from_millis(5), 5),
        ..ContainerProperties::default()
    };
    EndpointRegistry::new(ContainerFactory::new(cluster.client_factory(), properties))
}

fn noop() -> Arc<dyn RecordHandler> {
    handler_fn(|_, _| async { Ok(HandlerOutput::Done) })
}

fn endpoint(id: &str) -> EndpointDescriptor {
    EndpointDescriptor::builder()
        .id(id)
        .topics(["t1"])
        .build()
        .unwrap()
}

fn grouped(id: &str, group: &str) -> EndpointDescriptor {
    EndpointDescriptor::builder()
        .id(id)
        .topics(["t1"])
        .container_group(group)
        .build()
        .unwrap()
}

fn state(registry: &EndpointRegistry, id: &str) -> ContainerState {
    registry.get_container(id).unwrap().state()
}

#[tokio::test]
async fn test_duplicate_live_id_is_rejected() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let registry = registry(&cluster);

    registry.register(endpoint("e1"), noop()).await?;
    let err = registry.register(endpoint("e1"), noop()).await.unwrap_err();
    assert!(matches!(err, ListenerError::DuplicateId(ref id) if id == "e1"));

    registry.start_all().await?;
    let err = registry.register(endpoint("e1"), noop()).await.unwrap_err();
    assert!(matches!(err, ListenerError::DuplicateId(_)));
    assert_eq!(state(&registry, "e1"), ContainerState::Running);

    // once stopped, the id can be registered again
    registry.stop_container("e1", Duration::from_secs(1)).await?;
    let replacement = registry.register(endpoint("e1"), noop()).await?;
    assert_eq!(replacement.state(), ContainerState::Running);
    assert_eq!(registry.container_ids(), vec!["e1"]);

    registry.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn test_start_all_honours_auto_startup() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let registry = registry(&cluster);

    registry.register(endpoint("auto"), noop()).await?;
    let manual = EndpointDescriptor::builder()
        .id("manual")
        .topics(["t1"])
        .auto_startup(false)
        .build()?;
    registry.register(manual, noop()).await?;

    registry.start_all().await?;
    assert!(registry.is_running());
    assert_eq!(state(&registry, "auto"), ContainerState::Running);
    assert_eq!(state(&registry, "manual"), ContainerState::Created);

    // registered after startup: starts right away
    let late = registry.register(endpoint("late"), noop()).await?;
    assert_eq!(late.state(), ContainerState::Running);

    registry.start_container("manual").await?;
    assert_eq!(state(&registry, "manual"), ContainerState::Running);

    let reports = registry.stop_all(Duration::from_secs(1)).await;
    let ids: Vec<&str> = reports.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["auto", "manual", "late"]);
    assert!(reports.iter().all(|(_, r)| r.abandoned == 0));
    for id in ["auto", "manual", "late"] {
        assert_eq!(state(&registry, id), ContainerState::Stopped);
    }
    assert!(!registry.is_running());
    assert_eq!(cluster.open_clients(), 0);
    Ok(())
}

#[tokio::test]
async fn test_group_operations_act_on_members_only() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let registry = registry(&cluster);

    registry.register(grouped("a", "billing"), noop()).await?;
    registry.register(grouped("b", "billing"), noop()).await?;
    registry.register(grouped("c", "audit"), noop()).await?;
    assert_eq!(registry.group_names(), vec!["audit", "billing"]);

    let billing = registry.group("billing").expect("group exists");
    assert_eq!(billing.ids(), vec!["a", "b"]);
    billing.start_all().await?;
    assert_eq!(state(&registry, "a"), ContainerState::Running);
    assert_eq!(state(&registry, "b"), ContainerState::Running);
    assert_eq!(state(&registry, "c"), ContainerState::Created);

    let reports = billing.stop_all(Duration::from_secs(1)).await;
    assert_eq!(reports.len(), 2);
    assert_eq!(state(&registry, "a"), ContainerState::Stopped);
    assert_eq!(state(&registry, "b"), ContainerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_unregister_removes_group_membership() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let registry = registry(&cluster);

    registry.register(grouped("a", "billing"), noop()).await?;
    registry.register(grouped("b", "billing"), noop()).await?;
    registry.start_all().await?;

    let err = registry.unregister("a").await.unwrap_err();
    assert!(matches!(
        err,
        ListenerError::IllegalState {
            state: ContainerState::Running,
            operation: "unregister",
            ..
        }
    ));

    registry.stop_container("a", Duration::from_secs(1)).await?;
    registry.unregister("a").await?;
    assert!(registry.get_container("a").is_none());

    let billing = registry.group("billing").expect("group exists");
    assert_eq!(billing.ids(), vec!["b"]);

    registry.stop_container("b", Duration::from_secs(1)).await?;
    registry.unregister("b").await?;
    assert!(registry.group("billing").is_none());
    Ok(())
}

struct ForwardFailures(mpsc::UnboundedSender<(String, ContainerFailure)>);

impl FailureListener for ForwardFailures {
    fn container_failed(&self, id: &str, failure: &ContainerFailure) {
        let _ = self.0.send((id.to_string(), failure.clone()));
    }
}

#[tokio::test]
async fn test_failures_are_reported_and_queryable() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let (tx, mut failures) = mpsc::unbounded_channel();
    let registry = registry(&cluster).with_failure_listener(Arc::new(ForwardFailures(tx)));

    let failing = handler_fn(|_, _| async { Err(anyhow::anyhow!("no database connection")) });
    registry.register(endpoint("broken"), failing).await?;
    registry.register(endpoint("healthy"), noop()).await?;
    registry.start_all().await?;

    cluster.produce("t1", 0, "payload");
    let (id, failure) = tokio::time::timeout(Duration::from_secs(5), failures.recv())
        .await?
        .expect("failure reported");
    assert_eq!(id, "broken");
    assert_eq!(failure.error.failed_record(), Some(("t1", 0, 0)));

    // never restarted automatically
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state(&registry, "broken"), ContainerState::Failed);
    assert_eq!(state(&registry, "healthy"), ContainerState::Running);

    let status = registry.status("broken")?;
    let json = serde_json::to_value(&status)?;
    assert_eq!(json["state"], "FAILED");
    assert!(json["failure"]["error"]
        .as_str()
        .unwrap_or_default()
        .contains("no database connection"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cluster.committed("healthy", "t1", 0) != Some(1) {
        assert!(tokio::time::Instant::now() < deadline, "healthy never committed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let statuses = registry.statuses();
    assert_eq!(statuses.len(), 2);
    let healthy = &statuses[1];
    assert_eq!(healthy.sub_units.len(), 1);
    assert_eq!(healthy.sub_units[0].committed.len(), 1);
    assert_eq!(healthy.sub_units[0].committed[0].offset, 1);

    registry.shutdown(Duration::from_secs(1)).await;
    assert_eq!(state(&registry, "broken"), ContainerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume_by_id() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let registry = registry(&cluster);
    registry.register(endpoint("e1"), noop()).await?;

    assert!(matches!(
        registry.pause_container("e1").await,
        Err(ListenerError::IllegalState { .. })
    ));

    registry.start_all().await?;
    registry.pause_container("e1").await?;
    assert_eq!(registry.status("e1")?.state, ContainerState::Paused);
    registry.resume_container("e1").await?;
    assert_eq!(registry.status("e1")?.state, ContainerState::Running);

    registry.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test]
async fn test_start_container_after_shutdown_is_refused() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let registry = registry(&cluster);
    registry.register(endpoint("e1"), noop()).await?;
    registry.start_all().await?;
    assert_eq!(cluster.open_clients(), 1);

    registry.shutdown(Duration::from_secs(1)).await;
    assert!(matches!(
        registry.start_container("e1").await,
        Err(ListenerError::RegistryClosed)
    ));
    assert_eq!(state(&registry, "e1"), ContainerState::Stopped);
    assert_eq!(cluster.open_clients(), 0);
    Ok(())
}
