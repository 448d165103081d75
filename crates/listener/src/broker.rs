//! The broker client seam.
//!
//! A container never talks to Kafka directly. Every sub-unit asks the
//! [`BrokerClientFactory`] for its own [`BrokerClient`], so sub-units never
//! share a connection, an assignment or an offset cursor.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::BrokerError;
use crate::record::{CommitOffset, ConsumerRecord, TopicPartition, TopicPartitionOffset};

/// Fully resolved consumer configuration for one sub-unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub group_id: Option<String>,
    pub client_id: Option<String>,
    /// Merged consumer properties, excluding `group.id` and `client.id`.
    pub properties: BTreeMap<String, String>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Join the consumer group for a fixed set of topics.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Join the consumer group for every topic matching `pattern`.
    ///
    /// The match is re-evaluated whenever the client refreshes broker metadata.
    async fn subscribe_pattern(&mut self, pattern: &Regex) -> Result<(), BrokerError>;

    /// Take a fixed assignment, bypassing group management.
    async fn assign(&mut self, partitions: &[TopicPartitionOffset]) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for records. An empty batch is not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError>;

    async fn commit(&mut self, offsets: &[CommitOffset]) -> Result<(), BrokerError>;

    /// Stop fetching from the current assignment without leaving the group.
    async fn pause(&mut self) -> Result<(), BrokerError>;

    async fn resume(&mut self) -> Result<(), BrokerError>;

    fn assignment(&self) -> Vec<TopicPartition>;

    /// Leave the group and release the connection.
    async fn close(&mut self);
}

/// Creates one broker client per sub-unit.
pub trait BrokerClientFactory: Send + Sync {
    fn create(&self, settings: &ClientSettings) -> Result<Box<dyn BrokerClient>, BrokerError>;
}
