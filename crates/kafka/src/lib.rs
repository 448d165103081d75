//! Kafka broker client for `kafka-listener` containers, backed by librdkafka.
//!
//! Features:
//!
//! - One `StreamConsumer` per container sub-unit, so sub-units never share a
//!   connection, an assignment or an offset cursor
//! - Group subscriptions (topic lists or patterns) and manual assignments with
//!   initial offsets
//! - Manual, synchronous offset commits
//! - rdkafka errors classified into transient, commit and fatal failures

/// `BrokerClient` and `BrokerClientFactory` over rdkafka
pub mod consumer;
pub mod error;

// Re-export main types for easy access
pub use consumer::{ConsumerConfig, KafkaBrokerClient, KafkaClientFactory};
pub use error::{classify, Error, Result};
