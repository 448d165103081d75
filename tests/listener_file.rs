//! Integration tests for listener files: loading from disk and running the
//! declared listeners against the in-memory cluster

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use kafka_listener::{run_until, ListenerFile};
use kafka_listener_core::testing::MockCluster;
use kafka_listener_core::{AckMode, InitialOffset};
use tokio::sync::oneshot;
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

fn write_listener_file(suffix: &str, content: &str) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

async fn wait_for_commit(
    cluster: &MockCluster,
    group: &str,
    topic: &str,
    partition: i32,
    offset: i64,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cluster.committed(group, topic, partition) != Some(offset) {
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "{topic}-{partition} never committed {offset} (last {:?})",
            cluster.committed(group, topic, partition)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

const RUNNABLE_YAML: &str = r#"
consumer:
  group.id: billing
container:
  poll_timeout: 20ms
  retry_backoff: 5ms
  shutdown_timeout: 2s
status_interval: 50ms
listeners:
  - id: invoices
    topics: [invoices]
    concurrency: 2
    handler: discard
    filter: { kind: skip-tombstones }
"#;

#[tokio::test]
async fn test_toml_listener_file_from_disk() -> Result<()> {
    init_logging();

    let file = write_listener_file(
        ".toml",
        r#"
status_interval = "5m"

[kafka]
brokers = "kafka-1:9092,kafka-2:9092"

[consumer]
"group.id" = "billing"

[container]
ack_mode = "batch"
concurrency = 2

[[listeners]]
id = "manual"
handler = "log"
error_handler = "logging"

[[listeners.topic_partitions]]
topic = "invoices"
partition = 0
initial_offset = "beginning"

[[listeners.topic_partitions]]
topic = "invoices"
partition = 1
initial_offset = { at = 42 }
"#,
    )?;

    let listeners = ListenerFile::from_file(file.path())?;
    assert_eq!(listeners.kafka.brokers, "kafka-1:9092,kafka-2:9092");
    assert_eq!(listeners.status_interval()?, Duration::from_secs(300));
    assert_eq!(listeners.container_properties()?.ack_mode, AckMode::Batch);

    let partitions = &listeners.listeners[0].topic_partitions;
    assert_eq!(partitions.len(), 2);
    assert_eq!(partitions[0].initial_offset, Some(InitialOffset::Beginning));
    assert_eq!(partitions[1].initial_offset, Some(InitialOffset::At(42)));

    let resolved = listeners.resolve(MockCluster::new().client_factory())?;
    assert_eq!(resolved[0].id, "manual");
    assert_eq!(resolved[0].concurrency, 2);
    assert_eq!(resolved[0].settings.group_id.as_deref(), Some("billing"));
    Ok(())
}

#[tokio::test]
async fn test_invalid_listener_is_reported_with_its_position() -> Result<()> {
    init_logging();

    let file = write_listener_file(
        ".yaml",
        r#"
consumer:
  group.id: billing
listeners:
  - id: ok
    topics: [invoices]
  - id: both
    topics: [invoices]
    topic_pattern: "inv.*"
"#,
    )?;

    let listeners = ListenerFile::from_file(file.path())?;
    let err = listeners
        .resolve(MockCluster::new().client_factory())
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("Invalid listener #2"), "{message}");
    Ok(())
}

#[tokio::test]
async fn test_unreadable_listener_file() -> Result<()> {
    let file = write_listener_file(".yaml", "listeners: [")?;
    let err = ListenerFile::from_file(file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse listener YAML"));

    let missing = std::path::Path::new("/nonexistent/listeners.yaml");
    assert!(ListenerFile::from_file(missing).is_err());
    Ok(())
}

#[tokio::test]
async fn test_run_until_consumes_and_commits() -> Result<()> {
    init_logging();

    let cluster = MockCluster::new();
    cluster.create_topic("invoices", 2);
    cluster.produce("invoices", 0, "a");
    cluster.produce("invoices", 0, "b");
    cluster.produce_tombstone("invoices", 0, "a");
    cluster.produce("invoices", 1, "c");

    let file = write_listener_file(".yaml", RUNNABLE_YAML)?;
    let listeners = ListenerFile::from_file(file.path())?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let broker = cluster.client_factory();
    let run = tokio::spawn(async move {
        run_until(&listeners, broker, async {
            let _ = stop_rx.await;
        })
        .await
    });

    // the filtered tombstone is committed too
    wait_for_commit(&cluster, "billing", "invoices", 0, 3).await?;
    wait_for_commit(&cluster, "billing", "invoices", 1, 1).await?;
    assert_eq!(cluster.open_clients(), 2);

    let _ = stop_tx.send(());
    let reports = run.await??;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "invoices");
    assert_eq!(reports[0].1.abandoned, 0);
    assert_eq!(cluster.open_clients(), 0);
    Ok(())
}

#[tokio::test]
async fn test_run_until_fails_when_a_container_cannot_start() -> Result<()> {
    init_logging();

    let cluster = MockCluster::new();
    cluster.create_topic("invoices", 1);
    cluster.fail_next_client_creations(1);

    let listeners = ListenerFile::parse(RUNNABLE_YAML, kafka_listener::Format::Yaml)?;
    let err = run_until(&listeners, cluster.client_factory(), std::future::pending())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("Failed to start listener containers"));
    assert_eq!(cluster.open_clients(), 0);
    Ok(())
}
