//! One independently scheduled consumption worker of a container.
//!
//! A sub-unit owns its broker client, its assignment and its commit cursor.
//! It runs poll -> filter -> dispatch -> commit until cancelled, and only
//! polls again once the previous batch is dispatched and committed.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assignment::UnitSelection;
use crate::broker::BrokerClient;
use crate::error::{BrokerError, ListenerError};
use crate::error_handler::{DispatchFailure, ErrorDecision};
use crate::factory::{AckMode, ContainerSpec};
use crate::handler::{reply_units, Delivery, DispatchContext, HandlerOutput};
use crate::record::{CommitOffset, ConsumerRecord, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubUnitState {
    Starting,
    Consuming,
    Paused,
    Stopped,
    Failed,
}

/// Point-in-time view of a sub-unit, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubUnitStatus {
    pub index: usize,
    pub client_id: Option<String>,
    pub state: SubUnitState,
    pub assigned: Vec<TopicPartition>,
    /// Last committed offset (next offset to read) per partition.
    pub committed: Vec<CommitOffset>,
    pub records_processed: u64,
}

/// Shared progress of a running sub-unit. Written by the sub-unit only.
pub(crate) struct SubUnitMonitor {
    index: usize,
    client_id: Option<String>,
    progress: Mutex<Progress>,
}

struct Progress {
    state: SubUnitState,
    assigned: Vec<TopicPartition>,
    committed: BTreeMap<TopicPartition, i64>,
    records_processed: u64,
}

impl SubUnitMonitor {
    pub(crate) fn new(index: usize, client_id: Option<String>) -> Self {
        Self {
            index,
            client_id,
            progress: Mutex::new(Progress {
                state: SubUnitState::Starting,
                assigned: Vec::new(),
                committed: BTreeMap::new(),
                records_processed: 0,
            }),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut progress);
    }

    pub(crate) fn snapshot(&self) -> SubUnitStatus {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        SubUnitStatus {
            index: self.index,
            client_id: self.client_id.clone(),
            state: progress.state,
            assigned: progress.assigned.clone(),
            committed: progress
                .committed
                .iter()
                .map(|(tp, offset)| CommitOffset {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: *offset,
                })
                .collect(),
            records_processed: progress.records_processed,
        }
    }
}

enum Outcome {
    Handled(HandlerOutput),
    Skipped,
    Cancelled,
}

pub(crate) struct SubUnit {
    index: usize,
    spec: Arc<ContainerSpec>,
    client: Box<dyn BrokerClient>,
    selection: UnitSelection,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    monitor: Arc<SubUnitMonitor>,
    endpoint_id: Arc<str>,
    group_id: Option<Arc<str>>,
    /// Next offset to commit per partition, for records already dispatched.
    pending: BTreeMap<TopicPartition, i64>,
    /// Records returned by polls issued while paused.
    held_back: Vec<ConsumerRecord>,
    broker_paused: bool,
    /// Assignment at the time of the last broker pause.
    paused_assignment: Vec<TopicPartition>,
}

impl SubUnit {
    pub(crate) fn new(
        index: usize,
        spec: Arc<ContainerSpec>,
        client: Box<dyn BrokerClient>,
        selection: UnitSelection,
        cancel: CancellationToken,
        paused: watch::Receiver<bool>,
        monitor: Arc<SubUnitMonitor>,
    ) -> Self {
        let endpoint_id: Arc<str> = Arc::from(spec.descriptor.id());
        let group_id = spec.settings.group_id.as_deref().map(Arc::from);
        Self {
            index,
            spec,
            client,
            selection,
            cancel,
            paused,
            monitor,
            endpoint_id,
            group_id,
            pending: BTreeMap::new(),
            held_back: Vec::new(),
            broker_paused: false,
            paused_assignment: Vec::new(),
        }
    }

    /// Join, report readiness on `ready`, then consume until cancelled.
    ///
    /// Errors while joining go to `ready`; errors afterwards are returned.
    pub(crate) async fn run(
        mut self,
        ready: oneshot::Sender<Result<(), ListenerError>>,
    ) -> Result<(), ListenerError> {
        match self.join().await {
            Ok(true) => {
                self.refresh_assignment();
                self.monitor.update(|p| p.state = SubUnitState::Consuming);
                let _ = ready.send(Ok(()));
            }
            Ok(false) => {
                self.client.close().await;
                self.monitor.update(|p| p.state = SubUnitState::Stopped);
                return Ok(());
            }
            Err(error) => {
                self.client.close().await;
                self.monitor.update(|p| p.state = SubUnitState::Failed);
                let _ = ready.send(Err(error));
                return Ok(());
            }
        }

        let result = self.consume().await;
        let result = match result {
            // whatever was dispatched before cancellation is still owed a commit
            Ok(()) => self.commit_pending().await,
            Err(error) => Err(error),
        };
        self.client.close().await;

        match &result {
            Ok(()) => {
                self.monitor.update(|p| p.state = SubUnitState::Stopped);
                debug!("Sub-unit {} of '{}' stopped", self.index, self.endpoint_id);
            }
            Err(_) => self.monitor.update(|p| p.state = SubUnitState::Failed),
        }
        result
    }

    /// Subscribe or assign. Returns false when cancelled before joining.
    async fn join(&mut self) -> Result<bool, ListenerError> {
        let mut retry = 0;
        loop {
            let joined = match &self.selection {
                UnitSelection::Subscribe(topics) => self.client.subscribe(topics).await,
                UnitSelection::Pattern(pattern) => self.client.subscribe_pattern(pattern).await,
                UnitSelection::Assign(partitions) => self.client.assign(partitions).await,
            };
            match joined {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() => {
                    retry += 1;
                    let Some(delay) = self.spec.properties.connection_retry.delay(retry) else {
                        return Err(ListenerError::Connection {
                            attempts: retry,
                            source: e,
                        });
                    };
                    warn!(
                        "Sub-unit {} of '{}' could not join ({e}), retrying in {delay:?}",
                        self.index, self.endpoint_id
                    );
                    if !self.sleep(delay).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(ListenerError::Broker(e)),
            }
        }
    }

    async fn consume(&mut self) -> Result<(), ListenerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let paused = *self.paused.borrow_and_update();
            if paused {
                self.hold_while_paused().await?;
                continue;
            }
            if self.broker_paused {
                self.set_broker_paused(false).await?;
            }

            let records = if self.held_back.is_empty() {
                match self.poll().await? {
                    Some(records) => records,
                    None => return Ok(()),
                }
            } else {
                std::mem::take(&mut self.held_back)
            };
            if records.is_empty() {
                continue;
            }
            // paused while the poll was in flight
            if *self.paused.borrow() {
                self.held_back.extend(records);
                continue;
            }

            if self.spec.batch_mode {
                self.process_batch(records).await?;
            } else {
                self.process_records(records).await?;
            }
        }
    }

    /// Keep polling the paused assignment so the group membership stays
    /// alive; anything returned meanwhile is delivered after resume.
    ///
    /// At most one poll is held back. Once something is held, or when the
    /// broker pause did not take effect, the sub-unit waits instead of
    /// polling.
    async fn hold_while_paused(&mut self) -> Result<(), ListenerError> {
        if !self.broker_paused || self.client.assignment() != self.paused_assignment {
            // partitions assigned since the last pause are not paused yet
            self.set_broker_paused(true).await?;
        }
        if !self.broker_paused || !self.held_back.is_empty() {
            self.wait_for_resume().await;
            return Ok(());
        }
        if let Some(records) = self.poll().await? {
            if !records.is_empty() {
                debug!(
                    "Sub-unit {} of '{}' holding back {} records while paused",
                    self.index,
                    self.endpoint_id,
                    records.len()
                );
                self.held_back.extend(records);
            }
        }
        Ok(())
    }

    /// Wait up to one poll timeout for a resume or a cancellation.
    async fn wait_for_resume(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.spec.properties.poll_timeout) => {}
            _ = self.paused.changed() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn set_broker_paused(&mut self, pause: bool) -> Result<(), ListenerError> {
        let result = if pause {
            self.client.pause().await
        } else {
            self.client.resume().await
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(
                    "Sub-unit {} of '{}' could not {} its assignment: {e}",
                    self.index,
                    self.endpoint_id,
                    if pause { "pause" } else { "resume" }
                );
                return Ok(());
            }
            Err(e) => return Err(ListenerError::Broker(e)),
        }
        self.broker_paused = pause;
        self.paused_assignment = if pause {
            self.client.assignment()
        } else {
            Vec::new()
        };
        self.monitor.update(|p| {
            p.state = if pause {
                SubUnitState::Paused
            } else {
                SubUnitState::Consuming
            }
        });
        Ok(())
    }

    /// Poll with the connection retry budget. `None` when cancelled during a
    /// backoff.
    async fn poll(&mut self) -> Result<Option<Vec<ConsumerRecord>>, ListenerError> {
        let mut retry = 0;
        loop {
            match self.client.poll(self.spec.properties.poll_timeout).await {
                Ok(records) => {
                    self.refresh_assignment();
                    return Ok(Some(records));
                }
                Err(e) if e.is_transient() => {
                    retry += 1;
                    let Some(delay) = self.spec.properties.connection_retry.delay(retry) else {
                        return Err(ListenerError::Connection {
                            attempts: retry,
                            source: e,
                        });
                    };
                    warn!(
                        "Sub-unit {} of '{}' poll failed ({e}), retrying in {delay:?}",
                        self.index, self.endpoint_id
                    );
                    if !self.sleep(delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(ListenerError::Broker(e)),
            }
        }
    }

    async fn process_records(&mut self, records: Vec<ConsumerRecord>) -> Result<(), ListenerError> {
        let record_acks = self.spec.properties.ack_mode == AckMode::Record;

        for record in records {
            let accepted = self.accepts(&record);
            if accepted {
                match self.dispatch(Delivery::Record(record.clone())).await? {
                    Outcome::Handled(output) => {
                        self.emit(output, &record).await;
                        self.monitor.update(|p| p.records_processed += 1);
                    }
                    Outcome::Skipped => {}
                    Outcome::Cancelled => break,
                }
            } else {
                debug!(
                    "Filtered {}-{}@{} for '{}'",
                    record.topic, record.partition, record.offset, self.endpoint_id
                );
            }

            self.mark_consumed(&record);
            if accepted && record_acks {
                self.commit_pending().await?;
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        self.commit_pending().await
    }

    async fn process_batch(&mut self, records: Vec<ConsumerRecord>) -> Result<(), ListenerError> {
        let accepted: Vec<ConsumerRecord> = records
            .iter()
            .filter(|r| self.accepts(r))
            .cloned()
            .collect();
        let filtered = records.len() - accepted.len();
        if filtered > 0 {
            debug!(
                "Filtered {filtered} of {} records for '{}'",
                records.len(),
                self.endpoint_id
            );
        }

        if let Some(last) = accepted.last().cloned() {
            let count = accepted.len() as u64;
            match self.dispatch(Delivery::Batch(accepted)).await? {
                Outcome::Handled(output) => {
                    self.emit(output, &last).await;
                    self.monitor.update(|p| p.records_processed += count);
                }
                Outcome::Skipped => {}
                Outcome::Cancelled => return Ok(()),
            }
        }

        for record in &records {
            self.mark_consumed(record);
        }
        self.commit_pending().await
    }

    fn accepts(&self, record: &ConsumerRecord) -> bool {
        self.spec
            .descriptor
            .filter()
            .map_or(true, |filter| filter.accept(record))
    }

    /// Hand a delivery to the handler, applying the error handler's decision
    /// on failure.
    async fn dispatch(&mut self, delivery: Delivery) -> Result<Outcome, ListenerError> {
        let batch = matches!(delivery, Delivery::Batch(_));
        let mut attempt = 1;
        loop {
            let ctx = DispatchContext {
                endpoint_id: Arc::clone(&self.endpoint_id),
                group_id: self.group_id.clone(),
                sub_unit: self.index,
                attempt,
                listener_info: self.spec.descriptor.listener_info().cloned(),
            };
            let handled = AssertUnwindSafe(self.spec.handler.handle(delivery.clone(), &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("listener panicked")));

            let error = match handled {
                Ok(output) => return Ok(Outcome::Handled(output)),
                Err(error) => error,
            };

            let first = &delivery.records()[0];
            let failure = DispatchFailure {
                endpoint_id: &self.endpoint_id,
                error: &error,
                topic: &first.topic,
                partition: first.partition,
                offset: first.offset,
                attempt,
                batch,
            };
            match self.spec.error_handler.decide(&failure) {
                ErrorDecision::Retry(delay) => {
                    if !self.sleep(delay).await {
                        return Ok(Outcome::Cancelled);
                    }
                    attempt += 1;
                }
                ErrorDecision::Skip => return Ok(Outcome::Skipped),
                ErrorDecision::Fail => {
                    return Err(ListenerError::Dispatch {
                        topic: first.topic.clone(),
                        partition: first.partition,
                        offset: first.offset,
                        source: error,
                    })
                }
            }
        }
    }

    async fn emit(&self, output: HandlerOutput, last: &ConsumerRecord) {
        let units = reply_units(
            output,
            self.spec.descriptor.split_iterables(),
            &self.endpoint_id,
            last,
        );
        if units.is_empty() {
            return;
        }
        let Some(sink) = &self.spec.reply_sink else {
            debug!(
                "Dropping {} reply units from '{}': no reply sink configured",
                units.len(),
                self.endpoint_id
            );
            return;
        };
        for unit in units {
            if let Err(e) = sink.send(unit).await {
                warn!("Failed to emit reply from '{}': {e:#}", self.endpoint_id);
            }
        }
    }

    fn mark_consumed(&mut self, record: &ConsumerRecord) {
        let next = record.offset + 1;
        let entry = self.pending.entry(record.topic_partition()).or_insert(next);
        *entry = (*entry).max(next);
    }

    /// Commit every pending offset, retrying with the commit budget.
    async fn commit_pending(&mut self) -> Result<(), ListenerError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let offsets: Vec<CommitOffset> = self
            .pending
            .iter()
            .map(|(tp, offset)| CommitOffset {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: *offset,
            })
            .collect();

        let mut retry = 0;
        loop {
            match self.client.commit(&offsets).await {
                Ok(()) => break,
                Err(e @ BrokerError::Fatal(_)) => return Err(ListenerError::Broker(e)),
                Err(e) => {
                    retry += 1;
                    let Some(delay) = self.spec.properties.commit_retry.delay(retry) else {
                        return Err(ListenerError::Commit {
                            attempts: retry,
                            source: e,
                        });
                    };
                    warn!(
                        "Sub-unit {} of '{}' commit failed ({e}), retrying in {delay:?}",
                        self.index, self.endpoint_id
                    );
                    // an in-flight commit is finished even when stopping
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let committed = std::mem::take(&mut self.pending);
        self.monitor.update(|p| p.committed.extend(committed));
        Ok(())
    }

    fn refresh_assignment(&self) {
        let assigned = self.client.assignment();
        self.monitor.update(|p| {
            if p.assigned != assigned {
                info!(
                    "Sub-unit {} of '{}' assigned [{}]",
                    self.index,
                    self.endpoint_id,
                    assigned
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                p.assigned = assigned;
            }
        });
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}
