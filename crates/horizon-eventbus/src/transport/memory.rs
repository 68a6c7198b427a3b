//! In-process broker for tests and single-process deployments.
//!
//! Behaves like a small Kafka cluster: topics are split into partitions,
//! keyed messages are placed with the Kafka default partitioner, and
//! consumer groups divide partitions among their members. Offsets are
//! committed per group and partition; a member that leaves without
//! committing hands its uncommitted messages to whoever takes over the
//! partition.
//!
//! Every clone of an [`InMemoryBroker`] shares the same state, so several
//! buses built over clones of one broker form one logical bus.

use super::{
    ConsumerSpec, DeliveryReceipt, InboundMessage, MessageConsumer, MessageProducer,
    OutboundMessage, TopicSpec, Transport,
};
use crate::config::StartOffset;
use crate::error::BusError;
use crate::health::HealthStatus;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Partitions given to topics created implicitly by a publish or subscribe.
const AUTO_CREATE_PARTITIONS: i32 = 1;

const BROKER_ADDRESS: &str = "memory";

/// Handle to an in-process broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    available: AtomicBool,
    next_member: AtomicU64,
}

struct Topic {
    name: String,
    log: Mutex<TopicLog>,
    appended: Notify,
}

struct TopicLog {
    partitions: Vec<Vec<StoredMessage>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Clone)]
struct StoredMessage {
    key: Bytes,
    payload: Bytes,
}

struct GroupState {
    generation: u64,
    members: Vec<u64>,
    assignment: HashMap<u64, Vec<i32>>,
    committed: Vec<i64>,
}

impl GroupState {
    fn new(start: StartOffset, partitions: &[Vec<StoredMessage>]) -> Self {
        let committed = partitions
            .iter()
            .map(|p| match start {
                StartOffset::Earliest => 0,
                StartOffset::Latest => p.len() as i64,
            })
            .collect();

        Self {
            generation: 0,
            members: Vec::new(),
            assignment: HashMap::new(),
            committed,
        }
    }

    /// Range assignment over members in join order.
    fn rebalance(&mut self) {
        self.generation += 1;
        self.assignment.clear();

        let members = self.members.len();
        if members == 0 {
            return;
        }

        let partitions = self.committed.len();
        let base = partitions / members;
        let extra = partitions % members;

        let mut next = 0usize;
        for (i, member) in self.members.iter().enumerate() {
            let count = base + usize::from(i < extra);
            let owned = (next..next + count).map(|p| p as i32).collect();
            self.assignment.insert(*member, owned);
            next += count;
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                next_member: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate the broker going down or coming back.
    ///
    /// While unavailable, publishes, joins, polls and topic operations fail.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
        if available {
            for topic in self.state.topics.lock().values() {
                topic.appended.notify_waiters();
            }
        }
    }

    /// Append raw bytes to a topic, bypassing the envelope codec.
    pub fn inject_raw(&self, topic: &str, key: &[u8], payload: impl Into<Bytes>) -> DeliveryReceipt {
        self.topic(topic, AUTO_CREATE_PARTITIONS).append(StoredMessage {
            key: Bytes::copy_from_slice(key),
            payload: payload.into(),
        })
    }

    /// Number of messages stored in a topic, across partitions.
    pub fn message_count(&self, topic: &str) -> usize {
        self.state
            .topics
            .lock()
            .get(topic)
            .map_or(0, |t| t.log.lock().partitions.iter().map(Vec::len).sum())
    }

    /// Partition count of a topic, if it exists.
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state
            .topics
            .lock()
            .get(topic)
            .map(|t| t.log.lock().partitions.len())
    }

    /// Current members of a consumer group, in join order.
    pub fn group_members(&self, topic: &str, group_id: &str) -> Vec<u64> {
        self.state
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.log.lock().groups.get(group_id).map(|g| g.members.clone()))
            .unwrap_or_default()
    }

    /// Partition a key would be written to.
    pub fn partition_for_key(&self, topic: &str, key: &[u8]) -> Option<i32> {
        self.partition_count(topic)
            .map(|count| partition_for(key, count as i32))
    }

    fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    fn topic(&self, name: &str, partitions: i32) -> Arc<Topic> {
        let mut topics = self.state.topics.lock();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %name, partitions, "Creating in-memory topic");
                Arc::new(Topic {
                    name: name.to_string(),
                    log: Mutex::new(TopicLog {
                        partitions: vec![Vec::new(); partitions.max(1) as usize],
                        groups: HashMap::new(),
                    }),
                    appended: Notify::new(),
                })
            })
            .clone()
    }

    fn unavailable(&self) -> BusError {
        BusError::ConnectionFailed {
            broker: BROKER_ADDRESS.to_string(),
            cause: "broker unavailable".to_string(),
        }
    }
}

impl Topic {
    fn append(&self, message: StoredMessage) -> DeliveryReceipt {
        let receipt = {
            let mut log = self.log.lock();
            let partition = partition_for(&message.key, log.partitions.len() as i32);
            let entries = &mut log.partitions[partition as usize];
            entries.push(message);
            DeliveryReceipt {
                partition,
                offset: entries.len() as i64 - 1,
            }
        };
        self.appended.notify_waiters();
        receipt
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    fn broker(&self) -> &str {
        BROKER_ADDRESS
    }

    async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), BusError> {
        if !self.is_available() {
            return Err(self.unavailable());
        }
        self.topic(&spec.name, spec.partitions);
        Ok(())
    }

    fn producer(&self, _publish_timeout: Duration) -> Result<Box<dyn MessageProducer>, BusError> {
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
        }))
    }

    fn consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn MessageConsumer>, BusError> {
        if !self.is_available() {
            return Err(self.unavailable());
        }

        let topic = self.topic(&spec.topic, AUTO_CREATE_PARTITIONS);
        let member_id = self.state.next_member.fetch_add(1, Ordering::Relaxed);

        {
            let mut log = topic.log.lock();
            let TopicLog { partitions, groups } = &mut *log;
            let group = groups
                .entry(spec.group_id.clone())
                .or_insert_with(|| GroupState::new(spec.start_offset, partitions));
            group.members.push(member_id);
            group.rebalance();
            debug!(
                topic = %topic.name,
                group_id = %spec.group_id,
                member_id,
                generation = group.generation,
                "Member joined group"
            );
        }
        topic.appended.notify_waiters();

        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topic,
            group_id: spec.group_id.clone(),
            member_id,
            generation: 0,
            rebalances: 0,
            assigned: Vec::new(),
            positions: HashMap::new(),
            cursor: 0,
            left: false,
        }))
    }

    async fn health(&self, topic: &str) -> Result<HealthStatus, BusError> {
        if !self.is_available() {
            return Err(self.unavailable());
        }
        Ok(HealthStatus {
            connected: true,
            brokers: 1,
            partitions: self.partition_count(topic).unwrap_or(0),
        })
    }
}

struct MemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryReceipt, BusError> {
        if !self.broker.is_available() {
            return Err(BusError::PublishFailed {
                topic: message.topic,
                cause: "broker unavailable".to_string(),
            });
        }

        let topic = self.broker.topic(&message.topic, AUTO_CREATE_PARTITIONS);
        Ok(topic.append(StoredMessage {
            key: message.key,
            payload: message.payload,
        }))
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BusError> {
        Ok(())
    }
}

struct MemoryConsumer {
    broker: InMemoryBroker,
    topic: Arc<Topic>,
    group_id: String,
    member_id: u64,
    generation: u64,
    rebalances: u64,
    assigned: Vec<i32>,
    positions: HashMap<i32, i64>,
    cursor: usize,
    left: bool,
}

impl MemoryConsumer {
    /// Take the next message from an assigned partition, rotating across
    /// partitions so one busy partition cannot starve the others.
    fn try_fetch(&mut self) -> Option<InboundMessage> {
        let log = self.topic.log.lock();
        let group = log.groups.get(&self.group_id)?;

        if group.generation != self.generation {
            self.assigned = group
                .assignment
                .get(&self.member_id)
                .cloned()
                .unwrap_or_default();
            self.positions = self
                .assigned
                .iter()
                .map(|p| (*p, group.committed[*p as usize]))
                .collect();
            self.generation = group.generation;
            self.rebalances += 1;
            self.cursor = 0;
            debug!(
                topic = %self.topic.name,
                group_id = %self.group_id,
                member_id = self.member_id,
                partitions = ?self.assigned,
                "Partitions assigned"
            );
        }

        let count = self.assigned.len();
        for step in 0..count {
            let idx = (self.cursor + step) % count;
            let partition = self.assigned[idx];
            let position = self.positions.get(&partition).copied().unwrap_or(0);

            if let Some(stored) = log.partitions[partition as usize].get(position as usize) {
                self.positions.insert(partition, position + 1);
                self.cursor = idx + 1;
                return Some(InboundMessage {
                    topic: self.topic.name.clone(),
                    partition,
                    offset: position,
                    key: Some(stored.key.clone()),
                    payload: Some(stored.payload.clone()),
                });
            }
        }

        None
    }

    fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;

        {
            let mut log = self.topic.log.lock();
            if let Some(group) = log.groups.get_mut(&self.group_id) {
                group.members.retain(|m| *m != self.member_id);
                group.rebalance();
                debug!(
                    topic = %self.topic.name,
                    group_id = %self.group_id,
                    member_id = self.member_id,
                    generation = group.generation,
                    "Member left group"
                );
            }
        }
        self.topic.appended.notify_waiters();
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, BusError> {
        let deadline = Instant::now() + timeout;
        let topic = self.topic.clone();

        loop {
            if !self.broker.is_available() {
                return Err(BusError::ConsumeFailed {
                    topic: topic.name.clone(),
                    cause: "broker unavailable".to_string(),
                });
            }

            // Registered before the check so an append in between still wakes us.
            let appended = topic.appended.notified();

            if let Some(message) = self.try_fetch() {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn commit(&mut self, message: &InboundMessage) -> Result<(), BusError> {
        let mut log = self.topic.log.lock();
        let group = log
            .groups
            .get_mut(&self.group_id)
            .ok_or_else(|| BusError::CommitFailed {
                topic: message.topic.clone(),
                partition: message.partition,
                cause: "unknown group".to_string(),
            })?;

        if group.generation != self.generation || !self.assigned.contains(&message.partition) {
            return Err(BusError::CommitFailed {
                topic: message.topic.clone(),
                partition: message.partition,
                cause: "partition revoked by rebalance".to_string(),
            });
        }

        let committed = &mut group.committed[message.partition as usize];
        *committed = (*committed).max(message.offset + 1);
        Ok(())
    }

    fn assignment_generation(&self) -> u64 {
        self.rebalances
    }

    async fn close(mut self: Box<Self>) {
        self.leave();
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Kafka default partitioner: murmur2 of the key, sign bit cleared.
fn partition_for(key: &[u8], partitions: i32) -> i32 {
    (murmur2(key) & 0x7fff_ffff) % partitions.max(1)
}

fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}
