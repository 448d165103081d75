//! Endpoint descriptors: the validated, immutable description of one
//! listener binding.
//!
//! Descriptors are produced by [`EndpointDescriptorBuilder::build`], which
//! checks every structural rule at once and reports all violations together.
//! Building never touches the network or a container factory.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use regex::Regex;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::error_handler::ErrorHandler;
use crate::handler::RecordFilter;
use crate::record::TopicPartitionOffset;

/// Prefix of generated endpoint ids.
pub const GENERATED_ID_PREFIX: &str = "kafka-listener-endpoint#";

/// Consumer properties that are always set structurally, never by overrides.
const RESERVED_PROPERTIES: [&str; 2] = ["group.id", "client.id"];

static NEXT_GENERATED_ID: AtomicU64 = AtomicU64::new(0);

/// How a listener selects what to consume. Exactly one mode per endpoint.
#[derive(Debug, Clone)]
pub enum TopicSelection {
    /// Group-managed subscription to a fixed topic list.
    Topics(Vec<String>),
    /// Group-managed subscription to every topic matching the pattern.
    Pattern(Regex),
    /// Manual assignment, no group management.
    Partitions(Vec<TopicPartitionOffset>),
}

impl TopicSelection {
    pub fn is_manual(&self) -> bool {
        matches!(self, TopicSelection::Partitions(_))
    }
}

impl fmt::Display for TopicSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSelection::Topics(topics) => write!(f, "topics [{}]", topics.join(", ")),
            TopicSelection::Pattern(pattern) => write!(f, "pattern /{}/", pattern.as_str()),
            TopicSelection::Partitions(partitions) => {
                let parts: Vec<String> = partitions
                    .iter()
                    .map(|p| format!("{}-{}", p.topic, p.partition))
                    .collect();
                write!(f, "partitions [{}]", parts.join(", "))
            }
        }
    }
}

/// A validated listener binding.
#[derive(Clone)]
pub struct EndpointDescriptor {
    id: String,
    id_generated: bool,
    group_id: Option<String>,
    selection: TopicSelection,
    concurrency: Option<usize>,
    auto_startup: Option<bool>,
    batch_mode: Option<bool>,
    client_id_prefix: Option<String>,
    container_group: Option<String>,
    container_factory: Option<String>,
    filter: Option<Arc<dyn RecordFilter>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    split_iterables: bool,
    listener_info: Option<Bytes>,
    consumer_overrides: BTreeMap<String, String>,
}

impl EndpointDescriptor {
    pub fn builder() -> EndpointDescriptorBuilder {
        EndpointDescriptorBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when no id was supplied and one was generated.
    pub fn id_generated(&self) -> bool {
        self.id_generated
    }

    /// Group id after applying the id-as-group rule; the factory default
    /// applies when this is `None`.
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn selection(&self) -> &TopicSelection {
        &self.selection
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn auto_startup(&self) -> Option<bool> {
        self.auto_startup
    }

    pub fn batch_mode(&self) -> Option<bool> {
        self.batch_mode
    }

    pub fn client_id_prefix(&self) -> Option<&str> {
        self.client_id_prefix.as_deref()
    }

    pub fn container_group(&self) -> Option<&str> {
        self.container_group.as_deref()
    }

    pub fn container_factory(&self) -> Option<&str> {
        self.container_factory.as_deref()
    }

    pub fn filter(&self) -> Option<&Arc<dyn RecordFilter>> {
        self.filter.as_ref()
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }

    pub fn split_iterables(&self) -> bool {
        self.split_iterables
    }

    pub fn listener_info(&self) -> Option<&Bytes> {
        self.listener_info.as_ref()
    }

    pub fn consumer_overrides(&self) -> &BTreeMap<String, String> {
        &self.consumer_overrides
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("selection", &self.selection)
            .field("concurrency", &self.concurrency)
            .field("auto_startup", &self.auto_startup)
            .field("batch_mode", &self.batch_mode)
            .field("client_id_prefix", &self.client_id_prefix)
            .field("container_group", &self.container_group)
            .field("container_factory", &self.container_factory)
            .field("filter", &self.filter.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .field("split_iterables", &self.split_iterables)
            .field("listener_info", &self.listener_info)
            .field("consumer_overrides", &self.consumer_overrides)
            .finish()
    }
}

/// Raw, unvalidated endpoint fields.
#[derive(Clone)]
pub struct EndpointDescriptorBuilder {
    id: Option<String>,
    group_id: Option<String>,
    id_is_group: bool,
    topics: Vec<String>,
    topic_pattern: Option<String>,
    topic_partitions: Vec<TopicPartitionOffset>,
    concurrency: Option<usize>,
    auto_startup: Option<bool>,
    batch_mode: Option<bool>,
    client_id_prefix: Option<String>,
    container_group: Option<String>,
    container_factory: Option<String>,
    filter: Option<Arc<dyn RecordFilter>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    split_iterables: bool,
    listener_info: Option<Bytes>,
    consumer_overrides: BTreeMap<String, String>,
    properties: Vec<String>,
}

impl Default for EndpointDescriptorBuilder {
    fn default() -> Self {
        Self {
            id: None,
            group_id: None,
            id_is_group: true,
            topics: Vec::new(),
            topic_pattern: None,
            topic_partitions: Vec::new(),
            concurrency: None,
            auto_startup: None,
            batch_mode: None,
            client_id_prefix: None,
            container_group: None,
            container_factory: None,
            filter: None,
            error_handler: None,
            split_iterables: true,
            listener_info: None,
            consumer_overrides: BTreeMap::new(),
            properties: Vec::new(),
        }
    }
}

impl EndpointDescriptorBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// When no group id is given, use the explicit endpoint id as group id.
    /// Enabled by default.
    pub fn id_is_group(mut self, id_is_group: bool) -> Self {
        self.id_is_group = id_is_group;
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.topic_pattern = Some(pattern.into());
        self
    }

    pub fn topic_partitions<I>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = TopicPartitionOffset>,
    {
        self.topic_partitions.extend(partitions);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = Some(auto_startup);
        self
    }

    pub fn batch_mode(mut self, batch_mode: bool) -> Self {
        self.batch_mode = Some(batch_mode);
        self
    }

    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = Some(prefix.into());
        self
    }

    pub fn container_group(mut self, group: impl Into<String>) -> Self {
        self.container_group = Some(group.into());
        self
    }

    pub fn container_factory(mut self, factory: impl Into<String>) -> Self {
        self.container_factory = Some(factory.into());
        self
    }

    pub fn filter(mut self, filter: Arc<dyn RecordFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn split_iterables(mut self, split: bool) -> Self {
        self.split_iterables = split;
        self
    }

    pub fn listener_info(mut self, info: impl Into<Bytes>) -> Self {
        self.listener_info = Some(info.into());
        self
    }

    pub fn consumer_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.consumer_overrides.insert(key.into(), value.into());
        self
    }

    /// Adds `key=value` (or `key: value`) property strings, merged over the
    /// explicit overrides in order.
    pub fn properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties
            .extend(properties.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<EndpointDescriptor, ConfigurationError> {
        let mut violations = Vec::new();

        let explicit_id = match self.id.as_deref().map(str::trim) {
            Some("") => {
                violations.push("id must not be blank".to_string());
                None
            }
            Some(id) => Some(id.to_string()),
            None => None,
        };
        let label = explicit_id
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string());

        let selection = self.validate_selection(&mut violations);

        if self.concurrency == Some(0) {
            violations.push("concurrency must be at least 1".to_string());
        }

        let consumer_overrides = self.merge_overrides(&label, &mut violations);

        let selection = match selection {
            Some(selection) if violations.is_empty() => selection,
            _ => {
                return Err(ConfigurationError {
                    endpoint: label,
                    violations,
                })
            }
        };

        let group_id = match (self.group_id, &explicit_id) {
            (Some(group), _) if !group.trim().is_empty() => Some(group),
            (_, Some(id)) if self.id_is_group => Some(id.clone()),
            _ => None,
        };

        let (id, id_generated) = match explicit_id {
            Some(id) => (id, false),
            None => {
                let n = NEXT_GENERATED_ID.fetch_add(1, Ordering::Relaxed);
                (format!("{GENERATED_ID_PREFIX}{n}"), true)
            }
        };

        Ok(EndpointDescriptor {
            id,
            id_generated,
            group_id,
            selection,
            concurrency: self.concurrency,
            auto_startup: self.auto_startup,
            batch_mode: self.batch_mode,
            client_id_prefix: self.client_id_prefix.filter(|p| !p.is_empty()),
            container_group: self.container_group.filter(|g| !g.is_empty()),
            container_factory: self.container_factory.filter(|f| !f.is_empty()),
            filter: self.filter,
            error_handler: self.error_handler,
            split_iterables: self.split_iterables,
            listener_info: self.listener_info,
            consumer_overrides,
        })
    }

    fn validate_selection(&self, violations: &mut Vec<String>) -> Option<TopicSelection> {
        let pattern = self.topic_pattern.as_deref().filter(|p| !p.is_empty());
        let modes = [
            !self.topics.is_empty(),
            pattern.is_some(),
            !self.topic_partitions.is_empty(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if modes != 1 {
            violations.push(format!(
                "exactly one of topics, topic_pattern or topic_partitions must be set (found {modes})"
            ));
            return None;
        }

        if !self.topics.is_empty() {
            if self.topics.iter().any(|t| t.trim().is_empty()) {
                violations.push("topic names must not be empty".to_string());
                return None;
            }
            let mut seen = HashSet::new();
            let topics = self
                .topics
                .iter()
                .filter(|t| seen.insert(t.as_str()))
                .cloned()
                .collect();
            return Some(TopicSelection::Topics(topics));
        }

        if let Some(pattern) = pattern {
            return match Regex::new(pattern) {
                Ok(regex) => Some(TopicSelection::Pattern(regex)),
                Err(e) => {
                    violations.push(format!("topic_pattern '{pattern}' does not compile: {e}"));
                    None
                }
            };
        }

        let mut seen = HashSet::new();
        let mut valid = true;
        for tpo in &self.topic_partitions {
            if tpo.topic.trim().is_empty() {
                violations.push("topic names must not be empty".to_string());
                valid = false;
            }
            if tpo.partition < 0 {
                violations.push(format!(
                    "partition {} of topic '{}' must not be negative",
                    tpo.partition, tpo.topic
                ));
                valid = false;
            }
            if !seen.insert((tpo.topic.as_str(), tpo.partition)) {
                violations.push(format!(
                    "partition {}-{} is listed more than once",
                    tpo.topic, tpo.partition
                ));
                valid = false;
            }
        }
        valid.then(|| TopicSelection::Partitions(self.topic_partitions.clone()))
    }

    fn merge_overrides(
        &self,
        label: &str,
        violations: &mut Vec<String>,
    ) -> BTreeMap<String, String> {
        let mut merged = self.consumer_overrides.clone();
        for property in &self.properties {
            match parse_property(property) {
                Some((key, value)) => {
                    merged.insert(key, value);
                }
                None => violations.push(format!(
                    "property '{property}' is not of the form key=value or key: value"
                )),
            }
        }
        for reserved in RESERVED_PROPERTIES {
            if merged.remove(reserved).is_some() {
                debug!("Ignoring consumer override '{reserved}' on endpoint '{label}'");
            }
        }
        merged
    }
}

fn parse_property(property: &str) -> Option<(String, String)> {
    let idx = property.find(['=', ':'])?;
    let key = property[..idx].trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), property[idx + 1..].trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::InitialOffset;

    #[test]
    fn topics_descriptor_is_valid() {
        let d = EndpointDescriptor::builder()
            .id("e1")
            .topics(["t1", "t2", "t1"])
            .concurrency(2)
            .build()
            .unwrap();

        assert_eq!(d.id(), "e1");
        assert!(!d.id_generated());
        assert_eq!(d.concurrency(), Some(2));
        match d.selection() {
            TopicSelection::Topics(topics) => assert_eq!(topics, &vec!["t1", "t2"]),
            other => panic!("unexpected selection {other:?}"),
        }
    }

    #[test]
    fn two_selection_modes_are_rejected() {
        let err = EndpointDescriptor::builder()
            .id("e1")
            .topics(["t1"])
            .topic_pattern("t.*")
            .build()
            .unwrap_err();
        assert!(err.mentions("exactly one of"));
        assert!(err.mentions("found 2"));
    }

    #[test]
    fn all_three_selection_modes_are_rejected() {
        let err = EndpointDescriptor::builder()
            .topics(["t1"])
            .topic_pattern("t.*")
            .topic_partitions([TopicPartitionOffset::new("t1", 0)])
            .build()
            .unwrap_err();
        assert!(err.mentions("found 3"));
    }

    #[test]
    fn missing_selection_is_rejected() {
        let err = EndpointDescriptor::builder().id("e1").build().unwrap_err();
        assert!(err.mentions("found 0"));
        assert_eq!(err.endpoint, "e1");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = EndpointDescriptor::builder()
            .id("e1")
            .topics(["t1"])
            .concurrency(0)
            .build()
            .unwrap_err();
        assert!(err.mentions("concurrency"));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let err = EndpointDescriptor::builder()
            .id("e1")
            .topic_pattern("orders-(")
            .build()
            .unwrap_err();
        assert!(err.mentions("does not compile"));
    }

    #[test]
    fn violations_are_collected_together() {
        let err = EndpointDescriptor::builder()
            .id("e1")
            .topic_pattern("orders-(")
            .concurrency(0)
            .properties(["no-separator"])
            .build()
            .unwrap_err();
        assert_eq!(err.violations.len(), 3, "{err}");
    }

    #[test]
    fn duplicate_and_negative_partitions_are_rejected() {
        let err = EndpointDescriptor::builder()
            .id("e1")
            .topic_partitions([
                TopicPartitionOffset::new("t1", 0),
                TopicPartitionOffset::new("t1", 0),
                TopicPartitionOffset::new("t1", -1),
            ])
            .build()
            .unwrap_err();
        assert!(err.mentions("more than once"));
        assert!(err.mentions("must not be negative"));
    }

    #[test]
    fn manual_partitions_keep_initial_offsets() {
        let d = EndpointDescriptor::builder()
            .id("e1")
            .topic_partitions([
                TopicPartitionOffset::new("t1", 0).with_offset(InitialOffset::Beginning),
                TopicPartitionOffset::new("t1", 1).with_offset(InitialOffset::At(42)),
            ])
            .build()
            .unwrap();
        match d.selection() {
            TopicSelection::Partitions(p) => {
                assert_eq!(p[1].initial_offset, Some(InitialOffset::At(42)));
            }
            other => panic!("unexpected selection {other:?}"),
        }
        assert!(d.selection().is_manual());
    }

    #[test]
    fn reserved_overrides_are_stripped() {
        let d = EndpointDescriptor::builder()
            .id("e1")
            .topics(["t1"])
            .consumer_override("group.id", "sneaky")
            .consumer_override("max.poll.records", "10")
            .properties(["client.id=other", "fetch.min.bytes: 1024"])
            .build()
            .unwrap();

        let overrides = d.consumer_overrides();
        assert!(!overrides.contains_key("group.id"));
        assert!(!overrides.contains_key("client.id"));
        assert_eq!(overrides["max.poll.records"], "10");
        assert_eq!(overrides["fetch.min.bytes"], "1024");
        assert_eq!(d.group_id(), Some("e1"));
    }

    #[test]
    fn properties_win_over_explicit_overrides() {
        let d = EndpointDescriptor::builder()
            .id("e1")
            .topics(["t1"])
            .consumer_override("auto.offset.reset", "latest")
            .properties(["auto.offset.reset=earliest"])
            .build()
            .unwrap();
        assert_eq!(d.consumer_overrides()["auto.offset.reset"], "earliest");
    }

    #[test]
    fn explicit_group_wins_over_id() {
        let d = EndpointDescriptor::builder()
            .id("e1")
            .group_id("billing")
            .topics(["t1"])
            .build()
            .unwrap();
        assert_eq!(d.group_id(), Some("billing"));
    }

    #[test]
    fn id_is_group_can_be_disabled() {
        let d = EndpointDescriptor::builder()
            .id("e1")
            .id_is_group(false)
            .topics(["t1"])
            .build()
            .unwrap();
        assert_eq!(d.group_id(), None);
    }

    #[test]
    fn generated_id_never_becomes_group() {
        let d = EndpointDescriptor::builder().topics(["t1"]).build().unwrap();
        assert!(d.id_generated());
        assert!(d.id().starts_with(GENERATED_ID_PREFIX));
        assert_eq!(d.group_id(), None);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = EndpointDescriptor::builder().topics(["t1"]).build().unwrap();
        let b = EndpointDescriptor::builder().topics(["t1"]).build().unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn blank_id_is_rejected() {
        let err = EndpointDescriptor::builder()
            .id("  ")
            .topics(["t1"])
            .build()
            .unwrap_err();
        assert!(err.mentions("id must not be blank"));
    }

    #[test]
    fn property_parsing() {
        assert_eq!(
            parse_property("a.b=c=d"),
            Some(("a.b".to_string(), "c=d".to_string()))
        );
        assert_eq!(
            parse_property("a.b: c"),
            Some(("a.b".to_string(), "c".to_string()))
        );
        assert_eq!(parse_property("=x"), None);
        assert_eq!(parse_property("novalue"), None);
    }
}
