//! Integration tests for the poll/filter/dispatch/commit loop

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use kafka_listener_core::testing::MockCluster;
use kafka_listener_core::{
    handler_fn, AckMode, BackOff, ChannelReplySink, ConsumerRecord, ContainerFactory,
    ContainerProperties, ContainerState, DefaultErrorHandler, Delivery, EndpointDescriptor,
    HandlerOutput, ListenerContainer, ListenerError, LoggingErrorHandler, RecordHandler,
    Retryable,
};
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

fn properties() -> ContainerProperties {
    ContainerProperties {
        poll_timeout: Duration::from_millis(20),
        commit_retry: BackOff::fixed(Duration::from_millis(5), 3),
        connection_retry: BackOff::fixed(Duration::from_millis(5), 5),
        ..ContainerProperties::default()
    }
}

fn factory(cluster: &MockCluster) -> ContainerFactory {
    ContainerFactory::new(cluster.client_factory(), properties())
}

/// Handler recording every delivery it sees.
fn recording() -> (Arc<dyn RecordHandler>, Arc<Mutex<Vec<Delivery>>>) {
    let seen: Arc<Mutex<Vec<Delivery>>> = Arc::default();
    let handler = {
        let seen = Arc::clone(&seen);
        handler_fn(move |delivery, _| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(delivery);
                Ok(HandlerOutput::Done)
            }
        })
    };
    (handler, seen)
}

fn records(seen: &Mutex<Vec<Delivery>>) -> Vec<ConsumerRecord> {
    seen.lock()
        .unwrap()
        .iter()
        .flat_map(|d| d.records().to_vec())
        .collect()
}

fn payload(record: &ConsumerRecord) -> &str {
    std::str::from_utf8(record.payload.as_deref().unwrap_or_default()).unwrap()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_state(container: &ListenerContainer, state: ContainerState) {
    let mut states = container.watch_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("container never reached {state}"))
        .expect("state channel closed");
}

#[tokio::test]
async fn test_partition_order_is_preserved() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    cluster.create_topic("t1", 3);

    let (handler, seen) = recording();
    let descriptor = EndpointDescriptor::builder()
        .id("ordered")
        .topics(["t1"])
        .concurrency(2)
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    for i in 0..20 {
        for partition in 0..3 {
            cluster.produce("t1", partition, format!("{i}"));
        }
    }
    wait_until("all records", || records(&seen).len() == 60).await;
    for partition in 0..3 {
        wait_until("final commit", || {
            cluster.committed("ordered", "t1", partition) == Some(20)
        })
        .await;
    }

    let mut by_partition: BTreeMap<i32, Vec<i64>> = BTreeMap::new();
    for record in records(&seen) {
        by_partition
            .entry(record.partition)
            .or_default()
            .push(record.offset);
    }
    for (partition, offsets) in &by_partition {
        assert_eq!(
            offsets,
            &(0..20).collect::<Vec<i64>>(),
            "partition {partition} out of order"
        );
    }

    // committed offsets only move forward
    let mut last: BTreeMap<i32, i64> = BTreeMap::new();
    for (_, commit) in cluster.commits() {
        let previous = last.insert(commit.partition, commit.offset).unwrap_or(0);
        assert!(commit.offset >= previous);
    }

    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_filtered_records_are_committed_but_not_dispatched() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let (handler, seen) = recording();

    let descriptor = EndpointDescriptor::builder()
        .id("filtered")
        .topics(["t1"])
        .filter(Arc::new(|record: &ConsumerRecord| {
            record.payload.as_deref() != Some(b"skip".as_slice())
        }))
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    for value in ["a", "skip", "b", "skip"] {
        cluster.produce("t1", 0, value);
    }
    wait_until("commit past the filtered tail", || {
        cluster.committed("filtered", "t1", 0) == Some(4)
    })
    .await;

    let payloads: Vec<String> = records(&seen).iter().map(|r| payload(r).to_string()).collect();
    assert_eq!(payloads, vec!["a", "b"]);
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_batch_mode_dispatches_once_per_poll() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    for i in 0..5 {
        cluster.produce("t1", 0, format!("{i}"));
    }
    let (handler, seen) = recording();

    let descriptor = EndpointDescriptor::builder()
        .id("batch")
        .topics(["t1"])
        .batch_mode(true)
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    wait_until("batch commit", || cluster.committed("batch", "t1", 0) == Some(5)).await;
    let deliveries = seen.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 1);
    assert!(matches!(&deliveries[0], Delivery::Batch(records) if records.len() == 5));
    // one commit for the whole batch
    assert_eq!(cluster.commits().len(), 1);

    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_batch_ack_mode_commits_once_per_poll() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    for i in 0..4 {
        cluster.produce("t1", 0, format!("{i}"));
    }
    let (handler, seen) = recording();

    let factory = ContainerFactory::new(
        cluster.client_factory(),
        ContainerProperties {
            ack_mode: AckMode::Batch,
            ..properties()
        },
    );
    let descriptor = EndpointDescriptor::builder().id("acks").topics(["t1"]).build()?;
    let container = factory.create_container(descriptor, handler)?;
    container.start().await?;

    wait_until("commit", || cluster.committed("acks", "t1", 0) == Some(4)).await;
    assert_eq!(seen.lock().unwrap().len(), 4);
    assert_eq!(cluster.commits().len(), 1);

    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_split_iterables_controls_reply_units() -> Result<()> {
    init_logging();

    for (split, expected_units) in [(true, 3), (false, 1)] {
        let cluster = MockCluster::new();
        let (sink, mut replies) = ChannelReplySink::new();
        let factory = factory(&cluster).with_reply_sink(Arc::new(sink));

        let handler = handler_fn(|_, _| async {
            Ok(HandlerOutput::Replies(vec![
                Bytes::from_static(b"x"),
                Bytes::from_static(b"y"),
                Bytes::from_static(b"z"),
            ]))
        });
        let descriptor = EndpointDescriptor::builder()
            .id("replies")
            .topics(["t1"])
            .split_iterables(split)
            .build()?;
        let container = factory.create_container(descriptor, handler)?;
        container.start().await?;
        cluster.produce("t1", 0, "in");

        wait_until("commit", || cluster.committed("replies", "t1", 0) == Some(1)).await;
        container.stop(Duration::from_secs(1)).await?;

        let mut units = Vec::new();
        while let Ok(unit) = replies.try_recv() {
            units.push(unit);
        }
        assert_eq!(units.len(), expected_units, "split_iterables={split}");
        let values: usize = units.iter().map(|u| u.values.len()).sum();
        assert_eq!(values, 3);
        assert!(units.iter().all(|u| u.topic == "t1" && u.offset == 0));
    }
    Ok(())
}

#[tokio::test]
async fn test_retryable_errors_are_redelivered() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |_, ctx| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.store(ctx.attempt, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    return Err(Retryable::new(anyhow::anyhow!("downstream busy")).into());
                }
                Ok(HandlerOutput::Done)
            }
        })
    };
    let descriptor = EndpointDescriptor::builder()
        .id("retry")
        .topics(["t1"])
        .error_handler(Arc::new(DefaultErrorHandler::new(BackOff::fixed(
            Duration::from_millis(5),
            5,
        ))))
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;
    cluster.produce("t1", 0, "flaky");

    wait_until("commit", || cluster.committed("retry", "t1", 0) == Some(1)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(container.state(), ContainerState::Running);
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_logging_error_handler_skips_failed_records() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let handler = handler_fn(|delivery, _| async move {
        if delivery.records()[0].offset == 0 {
            anyhow::bail!("poison record");
        }
        Ok(HandlerOutput::Done)
    });

    let descriptor = EndpointDescriptor::builder()
        .id("skip")
        .topics(["t1"])
        .error_handler(Arc::new(LoggingErrorHandler))
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;
    cluster.produce("t1", 0, "poison");
    cluster.produce("t1", 0, "fine");

    wait_until("commit", || cluster.committed("skip", "t1", 0) == Some(2)).await;
    assert_eq!(container.state(), ContainerState::Running);
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_handler_panic_fails_container() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let handler = handler_fn(|_, _| async {
        if true {
            panic!("handler bug");
        }
        Ok(HandlerOutput::Done)
    });

    let descriptor = EndpointDescriptor::builder().id("panics").topics(["t1"]).build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;
    cluster.produce("t1", 0, "boom");

    wait_for_state(&container, ContainerState::Failed).await;
    let failure = container.failure().expect("failure recorded");
    assert_eq!(failure.error.failed_record(), Some(("t1", 0, 0)));
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_commit_retry_exhaustion_fails_container() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let (handler, _) = recording();
    let descriptor = EndpointDescriptor::builder().id("commits").topics(["t1"]).build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    cluster.fail_next_commits(100);
    cluster.produce("t1", 0, "a");

    wait_for_state(&container, ContainerState::Failed).await;
    let failure = container.failure().expect("failure recorded");
    assert!(matches!(
        *failure.error,
        ListenerError::Commit { attempts: 4, .. }
    ));
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_transient_commit_failures_recover() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let (handler, _) = recording();
    let descriptor = EndpointDescriptor::builder().id("commits").topics(["t1"]).build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    cluster.fail_next_commits(2);
    cluster.produce("t1", 0, "a");

    wait_until("commit", || cluster.committed("commits", "t1", 0) == Some(1)).await;
    assert_eq!(container.state(), ContainerState::Running);
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_fatal_commit_error_fails_immediately() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let (handler, _) = recording();
    let descriptor = EndpointDescriptor::builder().id("fatal").topics(["t1"]).build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    cluster.fail_next_commits_fatally(1);
    cluster.produce("t1", 0, "a");

    wait_for_state(&container, ContainerState::Failed).await;
    let failure = container.failure().expect("failure recorded");
    assert!(matches!(*failure.error, ListenerError::Broker(_)));
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_transient_poll_errors_are_retried() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let (handler, seen) = recording();
    let descriptor = EndpointDescriptor::builder().id("polls").topics(["t1"]).build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    cluster.fail_next_polls(3);
    cluster.produce("t1", 0, "a");

    wait_until("delivery", || records(&seen).len() == 1).await;
    assert_eq!(container.state(), ContainerState::Running);
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_dispatch_context_carries_endpoint_metadata() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    let contexts = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let contexts = Arc::clone(&contexts);
        handler_fn(move |_, ctx| {
            let contexts = Arc::clone(&contexts);
            async move {
                contexts.lock().unwrap().push(ctx);
                Ok(HandlerOutput::Done)
            }
        })
    };

    let descriptor = EndpointDescriptor::builder()
        .id("meta")
        .group_id("audit")
        .topics(["t1"])
        .listener_info(Bytes::from_static(b"tenant-7"))
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;
    cluster.produce("t1", 0, "a");

    wait_until("delivery", || !contexts.lock().unwrap().is_empty()).await;
    let ctx = contexts.lock().unwrap()[0].clone();
    assert_eq!(&*ctx.endpoint_id, "meta");
    assert_eq!(ctx.group_id.as_deref(), Some("audit"));
    assert_eq!(ctx.sub_unit, 0);
    assert_eq!(ctx.attempt, 1);
    assert_eq!(ctx.listener_info, Some(Bytes::from_static(b"tenant-7")));

    wait_until("commit", || cluster.committed("audit", "t1", 0) == Some(1)).await;
    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_pattern_subscription_matches_topics() -> Result<()> {
    init_logging();
    let cluster = MockCluster::new();
    cluster.produce("orders-eu", 0, "a");
    cluster.produce("orders-us", 0, "b");
    cluster.produce("audit", 0, "c");
    cluster.produce("x-orders-1", 0, "d");
    let (handler, seen) = recording();

    let descriptor = EndpointDescriptor::builder()
        .id("orders")
        .topic_pattern("orders-.*")
        .build()?;
    let container = factory(&cluster).create_container(descriptor, handler)?;
    container.start().await?;

    wait_until("matching topics", || records(&seen).len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut topics: Vec<String> = records(&seen).into_iter().map(|r| r.topic).collect();
    topics.sort();
    assert_eq!(topics, vec!["orders-eu", "orders-us"]);

    container.stop(Duration::from_secs(1)).await?;
    Ok(())
}
