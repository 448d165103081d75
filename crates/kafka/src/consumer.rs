use std::time::Duration;

use async_trait::async_trait;
use kafka_listener_core::{
    BrokerClient, BrokerClientFactory, BrokerError, ClientSettings, CommitOffset,
    ConsumerRecord, InitialOffset, TopicPartition, TopicPartitionOffset,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as RdkafkaConsumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as RdkafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{classify, Error, Result};

/// Wait for follow-up messages once a poll received its first one.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Connection settings shared by every consumer the factory creates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Auto offset reset strategy ("earliest" or "latest")
    ///
    /// Applies when the group has no committed offset for a partition.
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    pub session_timeout_ms: String,
    /// Upper bound of records returned by one poll
    pub max_poll_records: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: "6000".to_string(),
            max_poll_records: 500,
        }
    }
}

/// Creates one `StreamConsumer` per sub-unit.
#[derive(Debug, Clone, Default)]
pub struct KafkaClientFactory {
    config: ConsumerConfig,
}

impl KafkaClientFactory {
    pub fn new(config: ConsumerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

/// librdkafka configuration for one sub-unit.
///
/// Offsets are always committed by the container, so auto commit is off.
/// Endpoint properties are applied last and may override the defaults.
pub fn client_config(config: &ConsumerConfig, settings: &ClientSettings) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("session.timeout.ms", &config.session_timeout_ms)
        .set("enable.partition.eof", "false");
    for (key, value) in &settings.properties {
        client.set(key, value);
    }
    client.set("enable.auto.commit", "false");
    if let Some(group_id) = &settings.group_id {
        client.set("group.id", group_id);
    }
    if let Some(client_id) = &settings.client_id {
        client.set("client.id", client_id);
    }
    client
}

/// Property read by this client instead of librdkafka, which rejects it.
pub const MAX_POLL_RECORDS: &str = "max.poll.records";

/// Split `max.poll.records` off the endpoint properties.
///
/// Returns the remaining settings and the per-poll record limit, falling back
/// to the factory's configured limit.
pub fn split_max_poll_records(
    config: &ConsumerConfig,
    settings: &ClientSettings,
) -> Result<(ClientSettings, usize)> {
    let mut settings = settings.clone();
    let limit = match settings.properties.remove(MAX_POLL_RECORDS) {
        Some(value) => value.trim().parse::<usize>().map_err(|e| {
            Error::InvalidConfig(format!(
                "{MAX_POLL_RECORDS} must be a number, got {value:?}: {e}"
            ))
        })?,
        None => config.max_poll_records,
    };
    Ok((settings, limit.max(1)))
}

impl BrokerClientFactory for KafkaClientFactory {
    fn create(
        &self,
        settings: &ClientSettings,
    ) -> std::result::Result<Box<dyn BrokerClient>, BrokerError> {
        if self.config.brokers.trim().is_empty() {
            return Err(Error::InvalidConfig("no Kafka brokers configured".to_string()).into());
        }
        let (settings, max_poll_records) = split_max_poll_records(&self.config, settings)?;
        let consumer: StreamConsumer = client_config(&self.config, &settings)
            .create()
            .map_err(|e| Error::Consumer(format!("Failed to create consumer: {e}")))?;
        debug!(
            "Created Kafka consumer (group {:?}, client {:?})",
            settings.group_id, settings.client_id
        );
        Ok(Box::new(KafkaBrokerClient {
            consumer: Some(consumer),
            has_group: settings.group_id.is_some(),
            max_poll_records,
        }))
    }
}

/// Broker client over an rdkafka `StreamConsumer`.
pub struct KafkaBrokerClient {
    consumer: Option<StreamConsumer>,
    has_group: bool,
    max_poll_records: usize,
}

impl KafkaBrokerClient {
    fn consumer(&self) -> std::result::Result<&StreamConsumer, BrokerError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| BrokerError::Fatal("consumer already closed".to_string()))
    }

    fn current_assignment(&self) -> std::result::Result<TopicPartitionList, BrokerError> {
        self.consumer()?.assignment().map_err(|e| classify(&e))
    }
}

/// librdkafka treats subscriptions starting with `^` as regular expressions.
pub fn subscription_pattern(pattern: &Regex) -> String {
    let source = pattern.as_str();
    if source.starts_with('^') {
        source.to_string()
    } else {
        format!("^{source}")
    }
}

fn start_offset(initial: Option<InitialOffset>) -> Offset {
    match initial {
        None => Offset::Stored,
        Some(InitialOffset::Beginning) => Offset::Beginning,
        Some(InitialOffset::End) => Offset::End,
        Some(InitialOffset::At(offset)) => Offset::Offset(offset),
    }
}

pub fn assignment_list(partitions: &[TopicPartitionOffset]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for p in partitions {
        tpl.add_partition_offset(&p.topic, p.partition, start_offset(p.initial_offset))?;
    }
    Ok(tpl)
}

pub fn commit_list(offsets: &[CommitOffset]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for o in offsets {
        tpl.add_partition_offset(&o.topic, o.partition, Offset::Offset(o.offset))?;
    }
    Ok(tpl)
}

fn to_record(msg: &BorrowedMessage<'_>) -> ConsumerRecord {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec)))
                .collect()
        })
        .unwrap_or_default();
    ConsumerRecord {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()),
        payload: msg.payload().map(|p| p.to_vec()),
        timestamp: msg.timestamp().to_millis(),
        headers,
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn subscribe(&mut self, topics: &[String]) -> std::result::Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer()?
            .subscribe(&topics)
            .map_err(|e| classify(&e))
    }

    async fn subscribe_pattern(&mut self, pattern: &Regex) -> std::result::Result<(), BrokerError> {
        let pattern = subscription_pattern(pattern);
        self.consumer()?
            .subscribe(&[pattern.as_str()])
            .map_err(|e| classify(&e))
    }

    async fn assign(
        &mut self,
        partitions: &[TopicPartitionOffset],
    ) -> std::result::Result<(), BrokerError> {
        let tpl = assignment_list(partitions)?;
        self.consumer()?.assign(&tpl).map_err(|e| classify(&e))
    }

    async fn poll(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<Vec<ConsumerRecord>, BrokerError> {
        let consumer = self.consumer()?;
        let mut records = Vec::new();

        // Fetch at least one message
        match tokio::time::timeout(timeout, consumer.recv()).await {
            Ok(Ok(msg)) => records.push(to_record(&msg)),
            Ok(Err(e)) => return Err(classify(&e)),
            Err(_) => return Ok(records),
        }

        // Try to fetch more with timeout
        while records.len() < self.max_poll_records {
            match tokio::time::timeout(DRAIN_TIMEOUT, consumer.recv()).await {
                Ok(Ok(msg)) => records.push(to_record(&msg)),
                Ok(Err(e)) => {
                    // delivered records go out first, the error surfaces next poll
                    warn!("Error receiving message after {} records: {e}", records.len());
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(records)
    }

    async fn commit(&mut self, offsets: &[CommitOffset]) -> std::result::Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        if !self.has_group {
            debug!("No consumer group; not storing {} offsets", offsets.len());
            return Ok(());
        }
        let tpl = commit_list(offsets)?;
        self.consumer()?
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| classify(&e))
    }

    async fn pause(&mut self) -> std::result::Result<(), BrokerError> {
        let tpl = self.current_assignment()?;
        self.consumer()?.pause(&tpl).map_err(|e| classify(&e))
    }

    async fn resume(&mut self) -> std::result::Result<(), BrokerError> {
        let tpl = self.current_assignment()?;
        self.consumer()?.resume(&tpl).map_err(|e| classify(&e))
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        match self.current_assignment() {
            Ok(tpl) => tpl
                .elements()
                .iter()
                .map(|e| TopicPartition::new(e.topic(), e.partition()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            // leave the group before the connection drops
            consumer.unsubscribe();
            debug!("Closed Kafka consumer");
        }
    }
}
