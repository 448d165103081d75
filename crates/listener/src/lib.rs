//! Listener endpoint registry and container lifecycle management for Kafka
//! consumers.
//!
//! This crate provides:
//! - Validated endpoint descriptors (topic selection, group, concurrency, filters)
//! - A container factory merging factory defaults with endpoint overrides
//! - Listener containers running N concurrent poll/dispatch/commit sub-units
//! - A process-wide registry with group-based bulk lifecycle operations
//!
//! # Broker access
//!
//! The crate never links a Kafka client. Containers talk to the broker through
//! the [`BrokerClient`] trait; `kafka-listener-rdkafka` implements it on top of
//! librdkafka and [`testing::MockCluster`] implements it in memory.
//!
//! # Delivery guarantees
//!
//! Offsets are committed only after the records before them were dispatched
//! (or filtered), so a crash redelivers at most the uncommitted tail.
//! Records of one partition are always dispatched in offset order.

pub mod assignment;
pub mod broker;

/// Lifecycle state machine and supervision of sub-units
pub mod container;
pub mod endpoint;
pub mod error;
pub mod error_handler;
pub mod factory;
pub mod handler;
pub mod record;

/// Process-wide table of listener containers
pub mod registry;
pub mod sub_unit;
pub mod testing;

pub use broker::{BrokerClient, BrokerClientFactory, ClientSettings};
pub use container::{
    ContainerFailure, ContainerState, ContainerStatus, FailureListener, ListenerContainer,
    StopReport,
};
pub use endpoint::{EndpointDescriptor, EndpointDescriptorBuilder, TopicSelection};
pub use error::{BrokerError, ConfigurationError, ListenerError, Result};
pub use error_handler::{
    BackOff, DefaultErrorHandler, DispatchFailure, ErrorDecision, ErrorHandler,
    LoggingErrorHandler,
};
pub use factory::{AckMode, ContainerFactory, ContainerProperties, ConsumerSettings};
pub use handler::{
    handler_fn, ChannelReplySink, Delivery, DispatchContext, HandlerOutput, RecordFilter,
    RecordHandler, ReplySink, ReplyUnit, Retryable,
};
pub use record::{
    CommitOffset, ConsumerRecord, InitialOffset, TopicPartition, TopicPartitionOffset,
};
pub use registry::{ContainerGroup, EndpointRegistry};
pub use sub_unit::{SubUnitState, SubUnitStatus};
