//! Mock log client for tests.
//!
//! `MockLog` plays the broker: it assigns offsets per topic-partition and
//! remembers which records a committed-reads consumer would observe.
//! `MockProducer` and `MockImmediateProducer` write into it, with scripted
//! failure injection per operation. `MockConsumer` is fed batches by the
//! test.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;

use super::{
    CommittableConsumer, CommittableOffset, ConsumerError, EventEnvelope, ImmediateProducer,
    Partitioner, ProducerError, ProducerFactory, RecordToSend, TransactionalProducer,
};
use crate::types::{Offset, RecordMetadata};

/// Shared in-memory log: offset counters plus the committed-reads view.
#[derive(Default)]
pub struct MockLog {
    offsets: DashMap<(String, u32), Offset>,
    committed: Mutex<Vec<RecordMetadata>>,
}

impl MockLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_offset(&self, topic: &str, partition: u32) -> Offset {
        let mut entry = self
            .offsets
            .entry((topic.to_string(), partition))
            .or_insert(0);
        let offset = *entry;
        *entry += 1;
        offset
    }

    fn commit(&self, records: Vec<RecordMetadata>) {
        self.committed.lock().unwrap().extend(records);
    }

    /// Pin the next offset a partition will hand out. Tests use this to
    /// place acks at known offsets.
    pub fn set_next_offset(&self, topic: &str, partition: u32, next: Offset) {
        self.offsets.insert((topic.to_string(), partition), next);
    }

    /// Every record a consumer reading committed data would see, in commit
    /// order.
    pub fn committed_records(&self) -> Vec<RecordMetadata> {
        self.committed.lock().unwrap().clone()
    }
}

/// Deterministic key → partition mapping driven by an explicit table.
#[derive(Default)]
pub struct MockPartitioner {
    map: Mutex<HashMap<String, u32>>,
}

impl MockPartitioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn assign(&self, key: impl Into<String>, partition: u32) {
        self.map.lock().unwrap().insert(key.into(), partition);
    }
}

impl Partitioner for MockPartitioner {
    fn partition_for(&self, key: &str) -> Option<u32> {
        self.map.lock().unwrap().get(key).copied()
    }
}

/// Scripted failures for one producer operation: each call pops the next
/// entry, an empty queue means success.
#[derive(Default)]
struct FailureScript {
    queued: Mutex<VecDeque<ProducerError>>,
}

impl FailureScript {
    fn push(&self, error: ProducerError) {
        self.queued.lock().unwrap().push_back(error);
    }

    fn next(&self) -> Option<ProducerError> {
        self.queued.lock().unwrap().pop_front()
    }
}

/// Transactional producer writing into a [`MockLog`].
pub struct MockProducer {
    log: Arc<MockLog>,
    transactional_id: String,
    partitioner: Arc<MockPartitioner>,
    in_transaction: Mutex<Vec<RecordMetadata>>,
    pub init_calls: AtomicUsize,
    pub begin_calls: AtomicUsize,
    pub commit_calls: AtomicUsize,
    pub abort_calls: AtomicUsize,
    init_failures: FailureScript,
    begin_failures: FailureScript,
    send_failures: FailureScript,
    commit_failures: FailureScript,
    abort_failures: FailureScript,
}

impl MockProducer {
    pub fn new(log: Arc<MockLog>, transactional_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            log,
            transactional_id: transactional_id.into(),
            partitioner: MockPartitioner::new(),
            in_transaction: Mutex::new(Vec::new()),
            init_calls: AtomicUsize::new(0),
            begin_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            abort_calls: AtomicUsize::new(0),
            init_failures: FailureScript::default(),
            begin_failures: FailureScript::default(),
            send_failures: FailureScript::default(),
            commit_failures: FailureScript::default(),
            abort_failures: FailureScript::default(),
        })
    }

    pub fn partitioner(&self) -> Arc<MockPartitioner> {
        Arc::clone(&self.partitioner)
    }

    pub fn fail_next_init(&self, error: ProducerError) {
        self.init_failures.push(error);
    }

    pub fn fail_next_begin(&self, error: ProducerError) {
        self.begin_failures.push(error);
    }

    pub fn fail_next_send(&self, error: ProducerError) {
        self.send_failures.push(error);
    }

    pub fn fail_next_commit(&self, error: ProducerError) {
        self.commit_failures.push(error);
    }

    pub fn fail_next_abort(&self, error: ProducerError) {
        self.abort_failures.push(error);
    }
}

#[async_trait]
impl TransactionalProducer for MockProducer {
    async fn init_transactions(&self) -> Result<(), ProducerError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match self.init_failures.next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn begin_transaction(&self) -> Result<(), ProducerError> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.begin_failures.next() {
            return Err(error);
        }
        self.in_transaction.lock().unwrap().clear();
        Ok(())
    }

    async fn send_records(
        &self,
        records: Vec<RecordToSend>,
    ) -> Result<Vec<RecordMetadata>, ProducerError> {
        if let Some(error) = self.send_failures.next() {
            return Err(error);
        }
        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            let partition = record
                .partition
                .or_else(|| {
                    record
                        .key
                        .as_deref()
                        .and_then(|k| self.partitioner.partition_for(k))
                })
                .unwrap_or(0);
            let offset = self.log.next_offset(&record.topic, partition);
            acks.push(RecordMetadata {
                key: record.key,
                topic: record.topic,
                partition,
                offset,
            });
        }
        self.in_transaction.lock().unwrap().extend(acks.clone());
        Ok(acks)
    }

    async fn commit_transaction(&self) -> Result<(), ProducerError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.commit_failures.next() {
            self.in_transaction.lock().unwrap().clear();
            return Err(error);
        }
        let records = std::mem::take(&mut *self.in_transaction.lock().unwrap());
        self.log.commit(records);
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<(), ProducerError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.abort_failures.next() {
            return Err(error);
        }
        self.in_transaction.lock().unwrap().clear();
        Ok(())
    }

    fn partition_for(&self, key: &str) -> Option<u32> {
        self.partitioner.partition_for(key)
    }

    fn transactional_id(&self) -> &str {
        &self.transactional_id
    }
}

/// Factory handing out one prepared producer, then fresh ones on rebuild.
pub struct MockProducerFactory {
    log: Arc<MockLog>,
    transactional_id: String,
    prepared: Mutex<VecDeque<Arc<MockProducer>>>,
    pub created: AtomicUsize,
}

impl MockProducerFactory {
    pub fn new(log: Arc<MockLog>, transactional_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            log,
            transactional_id: transactional_id.into(),
            prepared: Mutex::new(VecDeque::new()),
            created: AtomicUsize::new(0),
        })
    }

    /// Queue a specific producer to hand out next, ahead of fresh ones.
    pub fn prepare(&self, producer: Arc<MockProducer>) {
        self.prepared.lock().unwrap().push_back(producer);
    }
}

impl ProducerFactory for MockProducerFactory {
    fn create(&self) -> Arc<dyn TransactionalProducer> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(prepared) = self.prepared.lock().unwrap().pop_front() {
            return prepared;
        }
        MockProducer::new(Arc::clone(&self.log), self.transactional_id.clone())
    }
}

/// Non-transactional producer for flush records; writes are visible
/// immediately.
pub struct MockImmediateProducer {
    log: Arc<MockLog>,
    pub sent: Mutex<Vec<RecordMetadata>>,
    failures: FailureScript,
}

impl MockImmediateProducer {
    pub fn new(log: Arc<MockLog>) -> Arc<Self> {
        Arc::new(Self {
            log,
            sent: Mutex::new(Vec::new()),
            failures: FailureScript::default(),
        })
    }

    pub fn fail_next_send(&self, error: ProducerError) {
        self.failures.push(error);
    }

    pub fn last_sent(&self) -> Option<RecordMetadata> {
        self.sent.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ImmediateProducer for MockImmediateProducer {
    async fn send(&self, record: RecordToSend) -> Result<RecordMetadata, ProducerError> {
        if let Some(error) = self.failures.next() {
            return Err(error);
        }
        let partition = record.partition.unwrap_or(0);
        let offset = self.log.next_offset(&record.topic, partition);
        let meta = RecordMetadata {
            key: record.key,
            topic: record.topic,
            partition,
            offset,
        };
        self.sent.lock().unwrap().push(meta.clone());
        self.log.commit(vec![meta.clone()]);
        Ok(meta)
    }
}

/// Consumer fed batches by the test; commits are recorded for assertion.
#[derive(Default)]
pub struct MockConsumer {
    batches: Mutex<VecDeque<Result<Vec<EventEnvelope>, ConsumerError>>>,
    notify: Notify,
    pub commits: Mutex<Vec<Vec<CommittableOffset>>>,
    commit_failures: Mutex<VecDeque<ConsumerError>>,
    metrics: Mutex<HashMap<String, f64>>,
}

impl MockConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn feed(&self, batch: Vec<EventEnvelope>) {
        self.batches.lock().unwrap().push_back(Ok(batch));
        self.notify.notify_one();
    }

    pub fn feed_error(&self, error: ConsumerError) {
        self.batches.lock().unwrap().push_back(Err(error));
        self.notify.notify_one();
    }

    pub fn fail_next_commit(&self, error: ConsumerError) {
        self.commit_failures.lock().unwrap().push_back(error);
    }

    pub fn set_metric(&self, name: impl Into<String>, value: f64) {
        self.metrics.lock().unwrap().insert(name.into(), value);
    }

    /// Every offset committed so far, flattened in commit order.
    pub fn committed_offsets(&self) -> Vec<CommittableOffset> {
        self.commits.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl CommittableConsumer for MockConsumer {
    async fn poll(&self) -> Result<Vec<EventEnvelope>, ConsumerError> {
        loop {
            if let Some(batch) = self.batches.lock().unwrap().pop_front() {
                return batch;
            }
            self.notify.notified().await;
        }
    }

    async fn commit(&self, offsets: Vec<CommittableOffset>) -> Result<(), ConsumerError> {
        if let Some(error) = self.commit_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.commits.lock().unwrap().push(offsets);
        Ok(())
    }

    fn metrics(&self) -> HashMap<String, f64> {
        self.metrics.lock().unwrap().clone()
    }
}
