use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::container::ContainerState;

/// A descriptor (or its factory resolution) violated one or more rules.
///
/// Every violated rule is collected so the caller sees the whole list at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    /// Endpoint id, or a placeholder when the id itself was invalid.
    pub endpoint: String,
    pub violations: Vec<String>,
}

impl ConfigurationError {
    pub fn new(endpoint: impl Into<String>, violation: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            violations: vec![violation.into()],
        }
    }

    /// Returns true when any violation message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.violations.iter().any(|v| v.contains(needle))
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid endpoint '{}': {}",
            self.endpoint,
            self.violations.join("; ")
        )
    }
}

impl std::error::Error for ConfigurationError {}

/// Failure reported by a broker client.
///
/// The variant decides how a sub-unit reacts: connection failures are retried,
/// commit failures are retried with the commit budget, fatal failures stop the
/// container immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Connection(String),

    #[error("offset commit rejected: {0}")]
    Commit(String),

    #[error("fatal broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("a listener container with id '{0}' is already registered")]
    DuplicateId(String),

    #[error("cannot {operation} container '{id}' in state {state}")]
    IllegalState {
        id: String,
        state: ContainerState,
        operation: &'static str,
    },

    #[error("no listener container with id '{0}'")]
    UnknownContainer(String),

    #[error("registry is shut down")]
    RegistryClosed,

    #[error("listener failed on {topic}-{partition}@{offset}: {source:#}")]
    Dispatch {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("offset commit failed after {attempts} attempts: {source}")]
    Commit {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("broker connection lost after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("container '{id}' failed: {cause}")]
    ContainerFailed {
        id: String,
        cause: Arc<ListenerError>,
    },
}

impl ListenerError {
    /// Position of the record that caused a dispatch failure, looking through
    /// `ContainerFailed` wrappers.
    pub fn failed_record(&self) -> Option<(&str, i32, i64)> {
        match self {
            ListenerError::Dispatch {
                topic,
                partition,
                offset,
                ..
            } => Some((topic.as_str(), *partition, *offset)),
            ListenerError::ContainerFailed { cause, .. } => cause.failed_record(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ListenerError>;
