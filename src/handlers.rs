//! Built-in record handlers selectable from listener files.

use std::sync::Arc;

use async_trait::async_trait;
use kafka_listener_core::{Delivery, DispatchContext, HandlerOutput, RecordHandler};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerKind {
    /// Log every record at info level
    #[default]
    Log,
    /// Consume and commit without doing anything
    Discard,
}

impl HandlerKind {
    pub fn build(self) -> Arc<dyn RecordHandler> {
        match self {
            HandlerKind::Log => Arc::new(LogHandler),
            HandlerKind::Discard => Arc::new(DiscardHandler),
        }
    }
}

pub struct LogHandler;

#[async_trait]
impl RecordHandler for LogHandler {
    async fn handle(
        &self,
        delivery: Delivery,
        ctx: &DispatchContext,
    ) -> anyhow::Result<HandlerOutput> {
        for record in delivery.records() {
            let key = record
                .key
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            info!(
                "[{}#{}] {}-{}@{} key={} payload={} bytes",
                ctx.endpoint_id,
                ctx.sub_unit,
                record.topic,
                record.partition,
                record.offset,
                key,
                record.payload.as_ref().map_or(0, Vec::len)
            );
        }
        Ok(HandlerOutput::Done)
    }
}

pub struct DiscardHandler;

#[async_trait]
impl RecordHandler for DiscardHandler {
    async fn handle(
        &self,
        delivery: Delivery,
        ctx: &DispatchContext,
    ) -> anyhow::Result<HandlerOutput> {
        debug!("[{}] discarding {} records", ctx.endpoint_id, delivery.len());
        Ok(HandlerOutput::Done)
    }
}
