//! In-memory broker for tests.
//!
//! [`MockCluster`] keeps topics, committed offsets and group membership in
//! process. Group-managed clients get their partitions recomputed on every
//! poll from the set of live members of their group, so starting or stopping
//! sub-units rebalances the same way a broker would, without the delays.
//!
//! Offsets reset to the beginning of a partition unless the client sets
//! `auto.offset.reset=latest`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Notify;

use crate::broker::{BrokerClient, BrokerClientFactory, ClientSettings};
use crate::error::BrokerError;
use crate::record::{CommitOffset, ConsumerRecord, InitialOffset, TopicPartition, TopicPartitionOffset};

const DEFAULT_MAX_POLL_RECORDS: usize = 100;

#[derive(Debug, Clone)]
enum Membership {
    None,
    Topics(Vec<String>),
    Pattern(Regex),
    Assigned(Vec<TopicPartitionOffset>),
}

#[derive(Debug)]
struct Member {
    group: Option<String>,
    client_id: Option<String>,
    membership: Membership,
}

#[derive(Default)]
struct ClusterState {
    topics: BTreeMap<String, Vec<Vec<ConsumerRecord>>>,
    committed: HashMap<(String, TopicPartition), i64>,
    commits: Vec<(Option<String>, CommitOffset)>,
    members: BTreeMap<u64, Member>,
    next_member: u64,
    created: usize,
    closed: usize,
    client_ids: Vec<Option<String>>,
    fail_commits: usize,
    fatal_commits: usize,
    fail_polls: usize,
    fail_joins: usize,
    fail_creates: usize,
}

impl ClusterState {
    /// Partitions a member currently owns.
    fn assignment_of(&self, id: u64) -> Vec<TopicPartition> {
        let Some(member) = self.members.get(&id) else {
            return Vec::new();
        };
        match &member.membership {
            Membership::None => Vec::new(),
            Membership::Assigned(partitions) => {
                partitions.iter().map(|p| p.topic_partition()).collect()
            }
            Membership::Topics(_) | Membership::Pattern(_) => {
                let mut owned = Vec::new();
                for (topic, partitions) in &self.topics {
                    let mut eligible: Vec<u64> = self
                        .members
                        .iter()
                        .filter(|(_, m)| m.group == member.group && subscribes(m, topic))
                        .map(|(id, _)| *id)
                        .collect();
                    eligible.sort_unstable();
                    if !eligible.contains(&id) {
                        continue;
                    }
                    for partition in 0..partitions.len() {
                        if eligible[partition % eligible.len()] == id {
                            owned.push(TopicPartition::new(topic.clone(), partition as i32));
                        }
                    }
                }
                owned
            }
        }
    }

    fn end_offset(&self, tp: &TopicPartition) -> i64 {
        self.topics
            .get(&tp.topic)
            .and_then(|p| p.get(tp.partition as usize))
            .map_or(0, |records| records.len() as i64)
    }
}

fn subscribes(member: &Member, topic: &str) -> bool {
    match &member.membership {
        Membership::Topics(topics) => topics.iter().any(|t| t == topic),
        // anchored at the start like a librdkafka `^` subscription
        Membership::Pattern(pattern) => pattern.find(topic).is_some_and(|m| m.start() == 0),
        _ => false,
    }
}

/// Shared in-memory cluster. Clones refer to the same cluster.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    produced: Arc<Notify>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.lock();
        let existing = state.topics.entry(topic.to_string()).or_default();
        if existing.len() < partitions {
            existing.resize_with(partitions, Vec::new);
        }
    }

    /// Append a record and return its offset. The topic is created with
    /// enough partitions when missing.
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.produce_record(topic, partition, None, Some(payload.into()))
    }

    pub fn produce_keyed(
        &self,
        topic: &str,
        partition: i32,
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> i64 {
        self.produce_record(topic, partition, Some(key.into()), Some(payload.into()))
    }

    /// Append a record without payload.
    pub fn produce_tombstone(&self, topic: &str, partition: i32, key: impl Into<Vec<u8>>) -> i64 {
        self.produce_record(topic, partition, Some(key.into()), None)
    }

    fn produce_record(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> i64 {
        let offset = {
            let mut state = self.lock();
            let partitions = state.topics.entry(topic.to_string()).or_default();
            let index = partition.max(0) as usize;
            if partitions.len() <= index {
                partitions.resize_with(index + 1, Vec::new);
            }
            let log = &mut partitions[index];
            let offset = log.len() as i64;
            log.push(ConsumerRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                payload,
                timestamp: Some(chrono::Utc::now().timestamp_millis()),
                headers: Vec::new(),
            });
            offset
        };
        self.produced.notify_waiters();
        offset
    }

    /// Committed offset of `group` for a partition. Manual assignments without
    /// a group commit under the empty group name.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    /// Every successful commit, in order, with the committing client id.
    pub fn commits(&self) -> Vec<(Option<String>, CommitOffset)> {
        self.lock().commits.clone()
    }

    pub fn fail_next_commits(&self, n: usize) {
        self.lock().fail_commits = n;
    }

    pub fn fail_next_commits_fatally(&self, n: usize) {
        self.lock().fatal_commits = n;
    }

    pub fn fail_next_polls(&self, n: usize) {
        self.lock().fail_polls = n;
    }

    pub fn fail_next_joins(&self, n: usize) {
        self.lock().fail_joins = n;
    }

    pub fn fail_next_client_creations(&self, n: usize) {
        self.lock().fail_creates = n;
    }

    /// Clients created and not yet closed or dropped.
    pub fn open_clients(&self) -> usize {
        let state = self.lock();
        state.created - state.closed
    }

    pub fn closed_clients(&self) -> usize {
        self.lock().closed
    }

    /// Client ids of every client created so far, in creation order.
    pub fn client_ids(&self) -> Vec<Option<String>> {
        self.lock().client_ids.clone()
    }

    /// Partitions currently owned by each live member of `group`.
    pub fn group_assignment(&self, group: &str) -> Vec<Vec<TopicPartition>> {
        let state = self.lock();
        state
            .members
            .iter()
            .filter(|(_, m)| m.group.as_deref() == Some(group))
            .map(|(id, _)| state.assignment_of(*id))
            .collect()
    }

    pub fn client_factory(&self) -> Arc<dyn BrokerClientFactory> {
        Arc::new(MockClientFactory {
            cluster: self.clone(),
        })
    }
}

struct MockClientFactory {
    cluster: MockCluster,
}

impl BrokerClientFactory for MockClientFactory {
    fn create(&self, settings: &ClientSettings) -> Result<Box<dyn BrokerClient>, BrokerError> {
        let mut state = self.cluster.lock();
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(BrokerError::Fatal("client creation refused".to_string()));
        }
        let id = state.next_member;
        state.next_member += 1;
        state.created += 1;
        state.client_ids.push(settings.client_id.clone());
        state.members.insert(
            id,
            Member {
                group: settings.group_id.clone(),
                client_id: settings.client_id.clone(),
                membership: Membership::None,
            },
        );

        let max_poll_records = settings
            .properties
            .get("max.poll.records")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_POLL_RECORDS);
        let reset_to_end = settings
            .properties
            .get("auto.offset.reset")
            .is_some_and(|v| v == "latest");

        Ok(Box::new(MockClient {
            id,
            cluster: self.cluster.clone(),
            group: settings.group_id.clone(),
            positions: HashMap::new(),
            assignment: Vec::new(),
            paused: false,
            closed: false,
            max_poll_records,
            reset_to_end,
        }))
    }
}

struct MockClient {
    id: u64,
    cluster: MockCluster,
    group: Option<String>,
    positions: HashMap<TopicPartition, i64>,
    assignment: Vec<TopicPartition>,
    paused: bool,
    closed: bool,
    max_poll_records: usize,
    reset_to_end: bool,
}

impl MockClient {
    fn join(&mut self, membership: Membership) -> Result<(), BrokerError> {
        let mut state = self.cluster.lock();
        if state.fail_joins > 0 {
            state.fail_joins -= 1;
            return Err(BrokerError::Connection("coordinator not available".to_string()));
        }
        if let Some(member) = state.members.get_mut(&self.id) {
            member.membership = membership;
        }
        Ok(())
    }

    /// Recompute the assignment and position newly owned partitions.
    fn rebalance(&mut self, state: &ClusterState) {
        let assignment = state.assignment_of(self.id);
        if assignment == self.assignment {
            return;
        }
        self.positions.retain(|tp, _| assignment.contains(tp));

        let explicit: HashMap<TopicPartition, InitialOffset> = match state
            .members
            .get(&self.id)
            .map(|m| &m.membership)
        {
            Some(Membership::Assigned(partitions)) => partitions
                .iter()
                .filter_map(|p| p.initial_offset.map(|o| (p.topic_partition(), o)))
                .collect(),
            _ => HashMap::new(),
        };
        let group = self.group.clone().unwrap_or_default();

        for tp in &assignment {
            if self.positions.contains_key(tp) {
                continue;
            }
            let end = state.end_offset(tp);
            let position = match explicit.get(tp) {
                Some(InitialOffset::Beginning) => 0,
                Some(InitialOffset::End) => end,
                Some(InitialOffset::At(offset)) => (*offset).clamp(0, end),
                None => match state.committed.get(&(group.clone(), tp.clone())) {
                    Some(committed) => *committed,
                    None if self.reset_to_end => end,
                    None => 0,
                },
            };
            self.positions.insert(tp.clone(), position);
        }
        self.assignment = assignment;
    }

    fn fetch(&mut self) -> Result<Vec<ConsumerRecord>, BrokerError> {
        let cluster = self.cluster.clone();
        let mut state = cluster.lock();
        if state.fail_polls > 0 {
            state.fail_polls -= 1;
            return Err(BrokerError::Connection("broker transport failure".to_string()));
        }
        self.rebalance(&state);
        if self.paused {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for tp in &self.assignment {
            let Some(position) = self.positions.get_mut(tp) else {
                continue;
            };
            let Some(log) = state
                .topics
                .get(&tp.topic)
                .and_then(|p| p.get(tp.partition as usize))
            else {
                continue;
            };
            let start = (*position).max(0) as usize;
            let room = self.max_poll_records - records.len();
            let batch: Vec<ConsumerRecord> = log.iter().skip(start).take(room).cloned().collect();
            *position += batch.len() as i64;
            records.extend(batch);
            if records.len() >= self.max_poll_records {
                break;
            }
        }
        Ok(records)
    }

    fn leave(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.cluster.lock();
        state.members.remove(&self.id);
        state.closed += 1;
    }
}

#[async_trait]
impl BrokerClient for MockClient {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        self.join(Membership::Topics(topics.to_vec()))
    }

    async fn subscribe_pattern(&mut self, pattern: &Regex) -> Result<(), BrokerError> {
        self.join(Membership::Pattern(pattern.clone()))
    }

    async fn assign(&mut self, partitions: &[TopicPartitionOffset]) -> Result<(), BrokerError> {
        self.join(Membership::Assigned(partitions.to_vec()))?;
        // manual assignments take effect immediately
        let cluster = self.cluster.clone();
        let state = cluster.lock();
        self.rebalance(&state);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>, BrokerError> {
        let produced = Arc::clone(&self.cluster.produced);
        let notified = produced.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let records = self.fetch()?;
        if !records.is_empty() {
            return Ok(records);
        }
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = &mut notified => {}
        }
        self.fetch()
    }

    async fn commit(&mut self, offsets: &[CommitOffset]) -> Result<(), BrokerError> {
        let mut state = self.cluster.lock();
        if state.fatal_commits > 0 {
            state.fatal_commits -= 1;
            return Err(BrokerError::Fatal("group authorization failed".to_string()));
        }
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(BrokerError::Commit("request timed out".to_string()));
        }
        let group = self.group.clone().unwrap_or_default();
        let client_id = state
            .members
            .get(&self.id)
            .and_then(|m| m.client_id.clone());
        for offset in offsets {
            state.committed.insert(
                (
                    group.clone(),
                    TopicPartition::new(offset.topic.clone(), offset.partition),
                ),
                offset.offset,
            );
            state.commits.push((client_id.clone(), offset.clone()));
        }
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), BrokerError> {
        self.paused = true;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), BrokerError> {
        self.paused = false;
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.clone()
    }

    async fn close(&mut self) {
        self.leave();
    }
}

impl Drop for MockClient {
    fn drop(&mut self) {
        self.leave();
    }
}
