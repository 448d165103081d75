//! Listener files: YAML or TOML documents declaring the Kafka connection,
//! container defaults, named container factories and the listener endpoints.
//!
//! ```yaml
//! kafka:
//!   brokers: localhost:9092
//! consumer:
//!   group.id: billing
//! container:
//!   poll_timeout: 500ms
//!   ack_mode: batch
//! listeners:
//!   - id: invoices
//!     topics: [invoices]
//!     concurrency: 3
//!     filter: { kind: skip-tombstones }
//!     handler: log
//! ```

mod duration;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kafka_listener_core::{
    AckMode, BrokerClientFactory, ConfigurationError, ConsumerSettings, ContainerFactory,
    ContainerProperties, DefaultErrorHandler, EndpointDescriptor, EndpointRegistry, ErrorHandler,
    LoggingErrorHandler, TopicPartitionOffset,
};
use kafka_listener_rdkafka::ConsumerConfig;
use serde::{Deserialize, Serialize};

use crate::filters::FilterKind;
use crate::handlers::HandlerKind;

pub use duration::parse_duration;

const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(Format::Yaml),
            Some("toml") => Ok(Format::Toml),
            _ => anyhow::bail!(
                "Unsupported listener file '{}': expected a .yaml, .yml or .toml extension",
                path.display()
            ),
        }
    }
}

/// Container settings. Unset fields keep the inherited value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerSection {
    pub poll_timeout: Option<String>,
    pub ack_mode: Option<AckMode>,
    pub concurrency: Option<usize>,
    pub auto_startup: Option<bool>,
    pub batch_mode: Option<bool>,
    /// Retries of a rejected commit before the container fails
    pub commit_retries: Option<u32>,
    /// Retries of transient poll and join failures
    pub connection_retries: Option<u32>,
    /// First delay of both retry budgets
    pub retry_backoff: Option<String>,
    pub shutdown_timeout: Option<String>,
}

impl ContainerSection {
    pub fn apply(&self, base: &ContainerProperties) -> anyhow::Result<ContainerProperties> {
        let mut properties = base.clone();
        if let Some(poll_timeout) = &self.poll_timeout {
            properties.poll_timeout =
                parse_duration(poll_timeout).context("Invalid container.poll_timeout")?;
        }
        if let Some(ack_mode) = self.ack_mode {
            properties.ack_mode = ack_mode;
        }
        if let Some(concurrency) = self.concurrency {
            anyhow::ensure!(concurrency >= 1, "container.concurrency must be at least 1");
            properties.concurrency = concurrency;
        }
        if let Some(auto_startup) = self.auto_startup {
            properties.auto_startup = auto_startup;
        }
        if let Some(batch_mode) = self.batch_mode {
            properties.batch_mode = batch_mode;
        }
        if let Some(retries) = self.commit_retries {
            properties.commit_retry.max_attempts = retries;
        }
        if let Some(retries) = self.connection_retries {
            properties.connection_retry.max_attempts = retries;
        }
        if let Some(backoff) = &self.retry_backoff {
            let initial = parse_duration(backoff).context("Invalid container.retry_backoff")?;
            properties.commit_retry.initial = initial;
            properties.connection_retry.initial = initial;
        }
        if let Some(timeout) = &self.shutdown_timeout {
            properties.shutdown_timeout =
                parse_duration(timeout).context("Invalid container.shutdown_timeout")?;
        }
        Ok(properties)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandlerKind {
    /// Retry errors marked retryable, fail the container otherwise
    #[default]
    Default,
    /// Log and skip every failed record
    Logging,
}

impl ErrorHandlerKind {
    pub fn build(self) -> Arc<dyn ErrorHandler> {
        match self {
            ErrorHandlerKind::Default => Arc::new(DefaultErrorHandler::default()),
            ErrorHandlerKind::Logging => Arc::new(LoggingErrorHandler),
        }
    }
}

/// A named container factory. Inherits the top-level `container` and
/// `consumer` sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FactorySection {
    pub container: ContainerSection,
    pub consumer: BTreeMap<String, String>,
    pub error_handler: Option<ErrorHandlerKind>,
}

/// One listener endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerSection {
    pub id: Option<String>,
    pub group_id: Option<String>,
    pub id_is_group: Option<bool>,
    pub topics: Vec<String>,
    pub topic_pattern: Option<String>,
    pub topic_partitions: Vec<TopicPartitionOffset>,
    pub concurrency: Option<usize>,
    pub auto_startup: Option<bool>,
    pub batch_mode: Option<bool>,
    pub client_id_prefix: Option<String>,
    pub container_group: Option<String>,
    pub container_factory: Option<String>,
    pub split_iterables: Option<bool>,
    pub listener_info: Option<String>,
    /// `key=value` consumer property strings
    pub properties: Vec<String>,
    pub consumer: BTreeMap<String, String>,
    pub filter: Option<FilterKind>,
    pub error_handler: Option<ErrorHandlerKind>,
    pub handler: HandlerKind,
}

impl ListenerSection {
    pub fn descriptor(&self) -> Result<EndpointDescriptor, ConfigurationError> {
        let mut builder = EndpointDescriptor::builder()
            .topics(self.topics.iter().cloned())
            .topic_partitions(self.topic_partitions.iter().cloned())
            .properties(self.properties.iter().cloned());
        if let Some(id) = &self.id {
            builder = builder.id(id);
        }
        if let Some(group_id) = &self.group_id {
            builder = builder.group_id(group_id);
        }
        if let Some(id_is_group) = self.id_is_group {
            builder = builder.id_is_group(id_is_group);
        }
        if let Some(pattern) = &self.topic_pattern {
            builder = builder.topic_pattern(pattern);
        }
        if let Some(concurrency) = self.concurrency {
            builder = builder.concurrency(concurrency);
        }
        if let Some(auto_startup) = self.auto_startup {
            builder = builder.auto_startup(auto_startup);
        }
        if let Some(batch_mode) = self.batch_mode {
            builder = builder.batch_mode(batch_mode);
        }
        if let Some(prefix) = &self.client_id_prefix {
            builder = builder.client_id_prefix(prefix);
        }
        if let Some(group) = &self.container_group {
            builder = builder.container_group(group);
        }
        if let Some(factory) = &self.container_factory {
            builder = builder.container_factory(factory);
        }
        if let Some(split) = self.split_iterables {
            builder = builder.split_iterables(split);
        }
        if let Some(info) = &self.listener_info {
            builder = builder.listener_info(info.clone().into_bytes());
        }
        for (key, value) in &self.consumer {
            builder = builder.consumer_override(key, value);
        }
        if let Some(filter) = &self.filter {
            builder = builder.filter(filter.build());
        }
        if let Some(kind) = self.error_handler {
            builder = builder.error_handler(kind.build());
        }
        builder.build()
    }
}

/// Consumer settings an endpoint resolves to, as printed by `validate`.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEndpoint {
    pub id: String,
    pub factory: Option<String>,
    pub selection: String,
    pub container_group: Option<String>,
    pub concurrency: usize,
    pub auto_startup: bool,
    pub batch_mode: bool,
    pub settings: ConsumerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerFile {
    #[serde(default)]
    pub kafka: ConsumerConfig,
    /// Factory-wide consumer properties (`group.id`, `client.id`, librdkafka keys)
    #[serde(default)]
    pub consumer: BTreeMap<String, String>,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub error_handler: Option<ErrorHandlerKind>,
    #[serde(default)]
    pub factories: BTreeMap<String, FactorySection>,
    /// How often `run` logs container statuses
    #[serde(default)]
    pub status_interval: Option<String>,
    #[serde(default)]
    pub listeners: Vec<ListenerSection>,
}

impl ListenerFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let format = Format::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read listener file '{}'", path.display()))?;
        Self::parse(&content, format)
            .with_context(|| format!("Invalid listener file '{}'", path.display()))
    }

    pub fn parse(content: &str, format: Format) -> anyhow::Result<Self> {
        let file: ListenerFile = match format {
            Format::Yaml => {
                serde_yaml::from_str(content).context("Failed to parse listener YAML")?
            }
            Format::Toml => toml::from_str(content).context("Failed to parse listener TOML")?,
        };
        anyhow::ensure!(
            !file.listeners.is_empty(),
            "Listener file declares no listeners"
        );
        Ok(file)
    }

    pub fn status_interval(&self) -> anyhow::Result<Duration> {
        match &self.status_interval {
            Some(interval) => parse_duration(interval).context("Invalid status_interval"),
            None => Ok(DEFAULT_STATUS_INTERVAL),
        }
    }

    pub fn container_properties(&self) -> anyhow::Result<ContainerProperties> {
        self.container.apply(&ContainerProperties::default())
    }

    /// Deadline for stopping every container at shutdown.
    pub fn shutdown_timeout(&self) -> anyhow::Result<Duration> {
        Ok(self.container_properties()?.shutdown_timeout)
    }

    fn default_factory(
        &self,
        broker: &Arc<dyn BrokerClientFactory>,
    ) -> anyhow::Result<ContainerFactory> {
        let factory = ContainerFactory::new(Arc::clone(broker), self.container_properties()?)
            .with_consumer_defaults(self.consumer.clone());
        Ok(match self.error_handler {
            Some(kind) => factory.with_error_handler(kind.build()),
            None => factory,
        })
    }

    fn named_factory(
        &self,
        name: &str,
        section: &FactorySection,
        broker: &Arc<dyn BrokerClientFactory>,
    ) -> anyhow::Result<ContainerFactory> {
        let properties = section
            .container
            .apply(&self.container_properties()?)
            .with_context(|| format!("Invalid container section of factory '{name}'"))?;
        let mut consumer = self.consumer.clone();
        consumer.extend(section.consumer.clone());
        let factory = ContainerFactory::new(Arc::clone(broker), properties)
            .with_consumer_defaults(consumer);
        Ok(match section.error_handler.or(self.error_handler) {
            Some(kind) => factory.with_error_handler(kind.build()),
            None => factory,
        })
    }

    /// Registry with the default factory and every named factory, no
    /// containers yet.
    pub fn build_registry(
        &self,
        broker: Arc<dyn BrokerClientFactory>,
    ) -> anyhow::Result<EndpointRegistry> {
        let mut registry = EndpointRegistry::new(self.default_factory(&broker)?);
        for (name, section) in &self.factories {
            registry = registry.with_factory(name, self.named_factory(name, section, &broker)?);
        }
        Ok(registry)
    }

    /// Validate every listener and register its container.
    pub async fn register_all(&self, registry: &EndpointRegistry) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(self.listeners.len());
        for (index, listener) in self.listeners.iter().enumerate() {
            let descriptor = listener
                .descriptor()
                .with_context(|| format!("Invalid listener #{}", index + 1))?;
            let container = registry
                .register(descriptor, listener.handler.build())
                .await
                .with_context(|| format!("Failed to register listener #{}", index + 1))?;
            ids.push(container.id().to_string());
        }
        Ok(ids)
    }

    /// Validate every listener and resolve the consumer settings its
    /// container would use, without creating any broker client.
    pub fn resolve(
        &self,
        broker: Arc<dyn BrokerClientFactory>,
    ) -> anyhow::Result<Vec<ResolvedEndpoint>> {
        let default_factory = self.default_factory(&broker)?;
        let mut named = BTreeMap::new();
        for (name, section) in &self.factories {
            named.insert(name.as_str(), self.named_factory(name, section, &broker)?);
        }

        let mut resolved = Vec::with_capacity(self.listeners.len());
        for (index, listener) in self.listeners.iter().enumerate() {
            let descriptor = listener
                .descriptor()
                .with_context(|| format!("Invalid listener #{}", index + 1))?;
            let factory = match descriptor.container_factory() {
                Some(name) => named.get(name).with_context(|| {
                    format!("Listener '{}' uses unknown factory '{name}'", descriptor.id())
                })?,
                None => &default_factory,
            };
            let settings = factory.resolve_settings(&descriptor)?;
            let properties = factory.properties();
            resolved.push(ResolvedEndpoint {
                id: descriptor.id().to_string(),
                factory: descriptor.container_factory().map(str::to_string),
                selection: descriptor.selection().to_string(),
                container_group: descriptor.container_group().map(str::to_string),
                concurrency: descriptor.concurrency().unwrap_or(properties.concurrency),
                auto_startup: descriptor.auto_startup().unwrap_or(properties.auto_startup),
                batch_mode: descriptor.batch_mode().unwrap_or(properties.batch_mode),
                settings,
            });
        }
        Ok(resolved)
    }
}
