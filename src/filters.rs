//! Built-in record filters selectable from listener files.

use std::sync::Arc;

use kafka_listener_core::{ConsumerRecord, RecordFilter};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FilterKind {
    /// Drop records without a payload (compaction tombstones)
    SkipTombstones,
    /// Drop records whose payload is missing or empty
    SkipEmptyPayload,
    /// Keep only records carrying the header with exactly this value
    HeaderEquals { name: String, value: String },
}

impl FilterKind {
    pub fn build(&self) -> Arc<dyn RecordFilter> {
        match self.clone() {
            FilterKind::SkipTombstones => {
                Arc::new(|record: &ConsumerRecord| record.payload.is_some())
            }
            FilterKind::SkipEmptyPayload => Arc::new(|record: &ConsumerRecord| {
                record.payload.as_ref().is_some_and(|p| !p.is_empty())
            }),
            FilterKind::HeaderEquals { name, value } => {
                Arc::new(move |record: &ConsumerRecord| {
                    record.header(&name) == Some(value.as_bytes())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: Option<&[u8]>) -> ConsumerRecord {
        ConsumerRecord {
            topic: "t1".to_string(),
            partition: 0,
            offset: 0,
            key: Some(b"k".to_vec()),
            payload: payload.map(<[u8]>::to_vec),
            timestamp: None,
            headers: vec![("tenant".to_string(), Some(b"acme".to_vec()))],
        }
    }

    #[test]
    fn test_skip_tombstones() {
        let filter = FilterKind::SkipTombstones.build();
        assert!(!filter.accept(&record(None)));
        assert!(filter.accept(&record(Some(b""))));
    }

    #[test]
    fn test_skip_empty_payload() {
        let filter = FilterKind::SkipEmptyPayload.build();
        assert!(!filter.accept(&record(None)));
        assert!(!filter.accept(&record(Some(b""))));
        assert!(filter.accept(&record(Some(b"x"))));
    }

    #[test]
    fn test_header_equals() {
        let acme = FilterKind::HeaderEquals {
            name: "tenant".to_string(),
            value: "acme".to_string(),
        }
        .build();
        let other = FilterKind::HeaderEquals {
            name: "tenant".to_string(),
            value: "globex".to_string(),
        }
        .build();
        assert!(acme.accept(&record(Some(b"x"))));
        assert!(!other.accept(&record(Some(b"x"))));
    }
}
