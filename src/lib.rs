//! kafka-listener
//!
//! Runs Kafka listener containers declared in a listener file.
//!
//! # Features
//!
//! - Listener files in YAML or TOML: broker connection, factory-wide consumer
//!   properties, container defaults, named container factories and endpoints
//! - Built-in handlers (`log`, `discard`), filters (`skip-tombstones`,
//!   `skip-empty-payload`, `header-equals`) and error handlers (`default`,
//!   `logging`)
//! - Periodic JSON status lines per container with sub-unit assignments and
//!   last committed offsets
//!
//! The containers and the registry live in `kafka_listener_core`; the
//! librdkafka client lives in `kafka_listener_rdkafka`.
//!
//! # CLI Usage
//!
//! ```bash
//! # Print the consumer settings every listener resolves to
//! kafka-listener validate --config listeners.yaml
//!
//! # Run until Ctrl-C
//! kafka-listener run --config listeners.yaml --brokers kafka-1:9092
//! ```

pub mod config;
pub mod filters;
pub mod handlers;
pub mod runner;

pub use config::{parse_duration, Format, ListenerFile};
pub use runner::run_until;
