//! Container factory: merges factory-wide defaults with one endpoint's
//! overrides and builds the [`ListenerContainer`] that serves it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::{BrokerClientFactory, ClientSettings};
use crate::container::ListenerContainer;
use crate::endpoint::EndpointDescriptor;
use crate::error::ConfigurationError;
use crate::error_handler::{BackOff, DefaultErrorHandler, ErrorHandler};
use crate::handler::{RecordHandler, ReplySink};

/// When offsets are committed in record (non-batch) mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// After every dispatched record.
    #[default]
    Record,
    /// Once per poll, after every record of the poll was dispatched.
    Batch,
}

/// Container-level settings shared by every container a factory builds.
#[derive(Debug, Clone)]
pub struct ContainerProperties {
    /// Maximum wait of a single poll.
    pub poll_timeout: Duration,
    pub ack_mode: AckMode,
    /// Used when an endpoint does not set its own concurrency.
    pub concurrency: usize,
    /// Used when an endpoint does not set its own auto startup flag.
    pub auto_startup: bool,
    /// Used when an endpoint does not set its own batch flag.
    pub batch_mode: bool,
    /// Retry budget for rejected commits; exhaustion fails the container.
    pub commit_retry: BackOff,
    /// Retry budget for transient broker failures while polling or joining.
    pub connection_retry: BackOff,
    /// Deadline used by registry-wide shutdown and by restarts of failed
    /// containers.
    pub shutdown_timeout: Duration,
}

impl Default for ContainerProperties {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            ack_mode: AckMode::Record,
            concurrency: 1,
            auto_startup: true,
            batch_mode: false,
            commit_retry: BackOff {
                max_attempts: 3,
                ..BackOff::default()
            },
            connection_retry: BackOff {
                max_attempts: 10,
                ..BackOff::default()
            },
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Consumer configuration resolved for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSettings {
    pub group_id: Option<String>,
    pub client_id_prefix: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl ConsumerSettings {
    /// Settings handed to the broker client of sub-unit `index`.
    ///
    /// The client id gets a `-index` suffix when more than one sub-unit runs.
    pub fn for_sub_unit(&self, index: usize, concurrency: usize) -> ClientSettings {
        let client_id = self.client_id_prefix.as_ref().map(|prefix| {
            if concurrency > 1 {
                format!("{prefix}-{index}")
            } else {
                prefix.clone()
            }
        });
        ClientSettings {
            group_id: self.group_id.clone(),
            client_id,
            properties: self.properties.clone(),
        }
    }
}

/// Everything a container needs, fully resolved. Built once per container.
#[derive(Clone)]
pub(crate) struct ContainerSpec {
    pub descriptor: EndpointDescriptor,
    pub settings: ConsumerSettings,
    pub concurrency: usize,
    pub auto_startup: bool,
    pub batch_mode: bool,
    pub properties: ContainerProperties,
    pub handler: Arc<dyn RecordHandler>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub reply_sink: Option<Arc<dyn ReplySink>>,
    pub broker: Arc<dyn BrokerClientFactory>,
}

pub struct ContainerFactory {
    broker: Arc<dyn BrokerClientFactory>,
    consumer_defaults: BTreeMap<String, String>,
    properties: ContainerProperties,
    error_handler: Arc<dyn ErrorHandler>,
    reply_sink: Option<Arc<dyn ReplySink>>,
}

impl ContainerFactory {
    pub fn new(broker: Arc<dyn BrokerClientFactory>, properties: ContainerProperties) -> Self {
        Self {
            broker,
            consumer_defaults: BTreeMap::new(),
            properties,
            error_handler: Arc::new(DefaultErrorHandler::default()),
            reply_sink: None,
        }
    }

    /// Factory-wide consumer properties. `group.id` here is the fallback group
    /// for endpoints without one; `client.id` is the fallback client id prefix.
    pub fn with_consumer_defaults(mut self, defaults: BTreeMap<String, String>) -> Self {
        self.consumer_defaults = defaults;
        self
    }

    pub fn with_consumer_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.consumer_defaults.insert(key.into(), value.into());
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_reply_sink(mut self, sink: Arc<dyn ReplySink>) -> Self {
        self.reply_sink = Some(sink);
        self
    }

    pub fn properties(&self) -> &ContainerProperties {
        &self.properties
    }

    /// Merge factory defaults with the endpoint's overrides.
    ///
    /// Group id precedence: descriptor group (explicit or derived from the id)
    /// over the factory's `group.id`. Group-managed selections need a group.
    pub fn resolve_settings(
        &self,
        descriptor: &EndpointDescriptor,
    ) -> Result<ConsumerSettings, ConfigurationError> {
        let mut properties = self.consumer_defaults.clone();
        let default_group = properties.remove("group.id");
        let default_client_id = properties.remove("client.id");
        properties.extend(
            descriptor
                .consumer_overrides()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let group_id = descriptor
            .group_id()
            .map(str::to_string)
            .or(default_group)
            .filter(|g| !g.is_empty());

        if group_id.is_none() && !descriptor.selection().is_manual() {
            return Err(ConfigurationError::new(
                descriptor.id(),
                format!(
                    "{} requires a consumer group but neither the endpoint nor the factory sets one",
                    descriptor.selection()
                ),
            ));
        }

        Ok(ConsumerSettings {
            group_id,
            client_id_prefix: descriptor
                .client_id_prefix()
                .map(str::to_string)
                .or(default_client_id),
            properties,
        })
    }

    pub fn create_container(
        &self,
        descriptor: EndpointDescriptor,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<ListenerContainer, ConfigurationError> {
        let settings = self.resolve_settings(&descriptor)?;
        let concurrency = descriptor
            .concurrency()
            .unwrap_or(self.properties.concurrency);
        if concurrency == 0 {
            return Err(ConfigurationError::new(
                descriptor.id(),
                "factory concurrency must be at least 1",
            ));
        }
        debug!(
            "Creating container '{}' for {} with concurrency {}",
            descriptor.id(),
            descriptor.selection(),
            concurrency
        );

        let spec = ContainerSpec {
            auto_startup: descriptor
                .auto_startup()
                .unwrap_or(self.properties.auto_startup),
            batch_mode: descriptor.batch_mode().unwrap_or(self.properties.batch_mode),
            error_handler: descriptor
                .error_handler()
                .cloned()
                .unwrap_or_else(|| Arc::clone(&self.error_handler)),
            reply_sink: self.reply_sink.clone(),
            broker: Arc::clone(&self.broker),
            properties: self.properties.clone(),
            concurrency,
            settings,
            handler,
            descriptor,
        };
        Ok(ListenerContainer::new(spec))
    }
}
