//! User-facing listener callbacks: the record handler, record filters and
//! reply emission.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::record::ConsumerRecord;

/// What a sub-unit hands to the handler in one call.
#[derive(Debug, Clone)]
pub enum Delivery {
    Record(ConsumerRecord),
    /// Every non-filtered record of one poll, in poll order.
    Batch(Vec<ConsumerRecord>),
}

impl Delivery {
    pub fn records(&self) -> &[ConsumerRecord] {
        match self {
            Delivery::Record(record) => std::slice::from_ref(record),
            Delivery::Batch(records) => records,
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

/// Metadata attached to every dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub endpoint_id: Arc<str>,
    pub group_id: Option<Arc<str>>,
    pub sub_unit: usize,
    /// 1 for the first delivery, incremented on every retry.
    pub attempt: u32,
    pub listener_info: Option<Bytes>,
}

/// Result of a successful handler invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandlerOutput {
    #[default]
    Done,
    Reply(Bytes),
    /// A multi-value result; emitted as one unit or split per value.
    Replies(Vec<Bytes>),
}

#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(
        &self,
        delivery: Delivery,
        ctx: &DispatchContext,
    ) -> anyhow::Result<HandlerOutput>;
}

/// Adapter turning an async closure into a [`RecordHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(Delivery, DispatchContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutput>> + Send,
{
    async fn handle(
        &self,
        delivery: Delivery,
        ctx: &DispatchContext,
    ) -> anyhow::Result<HandlerOutput> {
        (self.0)(delivery, ctx.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RecordHandler>
where
    F: Fn(Delivery, DispatchContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<HandlerOutput>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Marks a handler error as worth retrying.
///
/// The default error handler retries only errors carrying this marker;
/// everything else is terminal for the container.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct Retryable(#[source] pub anyhow::Error);

impl Retryable {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(error.into())
    }

    pub fn is_retryable(error: &anyhow::Error) -> bool {
        error.chain().any(|cause| cause.is::<Retryable>())
    }
}

/// Drops records before they reach the handler.
///
/// Filtered records are still considered consumed and get committed.
pub trait RecordFilter: Send + Sync {
    /// Returns true to keep the record.
    fn accept(&self, record: &ConsumerRecord) -> bool;
}

impl<F> RecordFilter for F
where
    F: Fn(&ConsumerRecord) -> bool + Send + Sync,
{
    fn accept(&self, record: &ConsumerRecord) -> bool {
        self(record)
    }
}

/// One emitted output unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyUnit {
    pub endpoint_id: Arc<str>,
    pub topic: String,
    pub partition: i32,
    /// Offset of the last record of the delivery that produced the reply.
    pub offset: i64,
    pub values: Vec<Bytes>,
}

#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, unit: ReplyUnit) -> anyhow::Result<()>;
}

/// Reply sink that forwards units to a tokio channel.
#[derive(Clone)]
pub struct ChannelReplySink {
    tx: mpsc::UnboundedSender<ReplyUnit>,
}

impl ChannelReplySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplyUnit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReplySink for ChannelReplySink {
    async fn send(&self, unit: ReplyUnit) -> anyhow::Result<()> {
        self.tx
            .send(unit)
            .map_err(|_| anyhow::anyhow!("reply channel closed"))
    }
}

/// Turns a handler result into output units.
pub(crate) fn reply_units(
    output: HandlerOutput,
    split_iterables: bool,
    endpoint_id: &Arc<str>,
    last: &ConsumerRecord,
) -> Vec<ReplyUnit> {
    let unit = |values: Vec<Bytes>| ReplyUnit {
        endpoint_id: Arc::clone(endpoint_id),
        topic: last.topic.clone(),
        partition: last.partition,
        offset: last.offset,
        values,
    };
    match output {
        HandlerOutput::Done => Vec::new(),
        HandlerOutput::Reply(value) => vec![unit(vec![value])],
        HandlerOutput::Replies(values) if split_iterables => {
            values.into_iter().map(|v| unit(vec![v])).collect()
        }
        HandlerOutput::Replies(values) => vec![unit(values)],
    }
}
