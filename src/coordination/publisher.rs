//! Transactional publisher: one instance per owned partition.
//!
//! Batches pending writes, publishes events + state atomically inside one
//! producer transaction, tracks in-flight records against the projection's
//! processed-offset cursor, and answers "is entity X's state current?"
//! queries.
//!
//! # Phases
//!
//! ```text
//! Uninitialized ──▶ InitializingTx ──▶ RecoveringBacklog(E) ──▶ Processing
//!                        │ ▲                                       │
//!                        └─┘ retry (3s, rebuild on fatal)          ▼
//!                                                                Fenced
//! ```
//!
//! On startup the publisher initializes transactions, then writes one empty
//! record (the flush record) through a non-transactional producer at its
//! exact partition and remembers the returned offset `E`. Once the
//! projection's cursor reaches `E`, everything written by earlier (possibly
//! fenced) instances has been observed, so the instance can safely answer
//! state-currency queries. Until then, publishes and queries are stashed.
//!
//! `Fenced` is terminal: the instance fails its batch, reports itself, and
//! terminates; the cluster layer is expected to start a replacement.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::HealthStatus;
use super::publisher_state::{
    PendingInit, PendingWrite, PublishError, PublishPayload, PublisherState,
};
use crate::config::{CoreConfig, PublisherConfig};
use crate::constants::{FLUSH_SKIP_WARN_INTERVAL, MAILBOX_CAPACITY};
use crate::log::{ImmediateProducer, ProducerFactory, RecordToSend, TransactionalProducer};
use crate::metrics;
use crate::state_store::StateIndex;
use crate::types::{EntityKey, Offset, TopicPartition};

/// Publisher health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherHealth {
    pub status: HealthStatus,
    pub fenced: bool,
    pub in_flight: usize,
    pub pending_writes: usize,
    pub pending_inits: usize,
    /// Age of the open transaction, if one is open.
    pub current_txn_ms: Option<u64>,
    pub phase: &'static str,
}

enum PublisherMsg {
    Publish {
        entity_id: EntityKey,
        state: (EntityKey, Option<Bytes>),
        events: Vec<(String, Bytes)>,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
    IsStateCurrent {
        entity_id: EntityKey,
        deadline: Instant,
        reply: oneshot::Sender<bool>,
    },
    FlushTick,
    MetadataTick,
    InitAttempt,
    Health(oneshot::Sender<PublisherHealth>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherPhase {
    Uninitialized,
    InitializingTx,
    RecoveringBacklog { end_offset: Offset },
    Processing,
    Fenced,
}

impl PublisherPhase {
    fn name(&self) -> &'static str {
        match self {
            PublisherPhase::Uninitialized => "uninitialized",
            PublisherPhase::InitializingTx => "initializing_tx",
            PublisherPhase::RecoveringBacklog { .. } => "recovering_backlog",
            PublisherPhase::Processing => "processing",
            PublisherPhase::Fenced => "fenced",
        }
    }
}

struct PublisherShared {
    fenced: AtomicBool,
}

/// Handle to one partition's publisher.
pub struct TransactionalPublisher {
    tx: mpsc::Sender<PublisherMsg>,
    shared: Arc<PublisherShared>,
}

impl Clone for TransactionalPublisher {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// External collaborators of one publisher instance.
pub struct PublisherDeps {
    pub producer_factory: Arc<dyn ProducerFactory>,
    /// Non-transactional producer for the startup flush record.
    pub flush_producer: Arc<dyn ImmediateProducer>,
    pub state_index: Arc<dyn StateIndex>,
}

impl TransactionalPublisher {
    /// Spawn the publisher for `partition` of the configured state topic.
    pub fn spawn(config: &CoreConfig, partition: u32, deps: PublisherDeps) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let shared = Arc::new(PublisherShared {
            fenced: AtomicBool::new(false),
        });

        spawn_tick(tx.clone(), config.publisher.flush_interval, || {
            PublisherMsg::FlushTick
        });
        spawn_tick(tx.clone(), config.publisher.metadata_poll_interval, || {
            PublisherMsg::MetadataTick
        });

        let worker = PublisherWorker {
            settings: config.publisher.clone(),
            assigned: TopicPartition::new(config.state_topic.as_str(), partition),
            events_topic: config.events_topic.clone().into(),
            transactional_id: config.transactional_id(partition),
            producer: deps.producer_factory.create(),
            deps,
            state: PublisherState::new(),
            phase: PublisherPhase::Uninitialized,
            stash: VecDeque::new(),
            last_flush_skip_warn: None,
            shared: Arc::clone(&shared),
            mailbox_tx: tx.clone(),
        };
        tokio::spawn(worker.run(rx));

        // Kick off transaction initialization.
        let init_tx = tx.clone();
        tokio::spawn(async move {
            let _ = init_tx.send(PublisherMsg::InitAttempt).await;
        });

        Self { tx, shared }
    }

    /// Enqueue a write for the next flush. Resolves only after the
    /// transaction containing these records commits; an aborted flush
    /// resolves with the rejection so the caller can retry.
    pub async fn publish(
        &self,
        entity_id: EntityKey,
        state: (EntityKey, Option<Bytes>),
        events: Vec<(String, Bytes)>,
    ) -> Result<(), PublishError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PublisherMsg::Publish {
                entity_id,
                state,
                events,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PublishError::Stopped)?;
        reply_rx.await.unwrap_or(Err(PublishError::Stopped))
    }

    /// True as soon as no write for `entity_id` is in flight; false at
    /// `deadline`. Never blocks the caller beyond the deadline and never
    /// errors: an unreachable publisher answers false.
    pub async fn is_state_current(&self, entity_id: EntityKey, deadline: Instant) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(PublisherMsg::IsStateCurrent {
                entity_id,
                deadline,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Health snapshot. DOWN when fenced or when the current transaction
    /// has been open longer than the configured threshold.
    pub async fn health(&self) -> PublisherHealth {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(PublisherMsg::Health(reply_tx)).await.is_ok() {
            if let Ok(health) = reply_rx.await {
                return health;
            }
        }
        // The worker is gone; all that remains is whether fencing killed it.
        PublisherHealth {
            status: HealthStatus::Down,
            fenced: self.shared.fenced.load(Ordering::SeqCst),
            in_flight: 0,
            pending_writes: 0,
            pending_inits: 0,
            current_txn_ms: None,
            phase: "stopped",
        }
    }

    /// Stop the publisher, aborting an open transaction unless fenced.
    pub async fn stop(&self) {
        let _ = self.tx.send(PublisherMsg::Stop).await;
    }
}

fn spawn_tick<F>(tx: mpsc::Sender<PublisherMsg>, period: std::time::Duration, make: F)
where
    F: Fn() -> PublisherMsg + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    });
}

struct PublisherWorker {
    settings: PublisherConfig,
    assigned: TopicPartition,
    events_topic: Arc<str>,
    transactional_id: String,
    producer: Arc<dyn TransactionalProducer>,
    deps: PublisherDeps,
    state: PublisherState,
    phase: PublisherPhase,
    stash: VecDeque<PublisherMsg>,
    last_flush_skip_warn: Option<Instant>,
    shared: Arc<PublisherShared>,
    mailbox_tx: mpsc::Sender<PublisherMsg>,
}

impl PublisherWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<PublisherMsg>) {
        info!(
            partition = %self.assigned,
            transactional_id = %self.transactional_id,
            "Transactional publisher starting"
        );

        while let Some(msg) = rx.recv().await {
            match msg {
                PublisherMsg::Publish {
                    entity_id,
                    state,
                    events,
                    reply,
                } => match self.phase {
                    PublisherPhase::Processing => self.handle_publish(state, events, reply),
                    PublisherPhase::Fenced => {
                        let _ = reply.send(Err(PublishError::Fenced));
                    }
                    _ => {
                        debug!(entity_id = %entity_id, phase = self.phase.name(), "Stashing publish");
                        self.stash.push_back(PublisherMsg::Publish {
                            entity_id,
                            state,
                            events,
                            reply,
                        });
                    }
                },
                PublisherMsg::IsStateCurrent {
                    entity_id,
                    deadline,
                    reply,
                } => match self.phase {
                    PublisherPhase::Processing => {
                        self.handle_is_state_current(entity_id, deadline, reply)
                    }
                    PublisherPhase::Fenced => {
                        let _ = reply.send(false);
                    }
                    _ => self.stash.push_back(PublisherMsg::IsStateCurrent {
                        entity_id,
                        deadline,
                        reply,
                    }),
                },
                PublisherMsg::FlushTick => {
                    if self.phase == PublisherPhase::Processing {
                        self.flush().await;
                        if self.phase == PublisherPhase::Fenced {
                            break;
                        }
                    }
                }
                PublisherMsg::MetadataTick => self.handle_metadata_tick().await,
                PublisherMsg::InitAttempt => {
                    if matches!(
                        self.phase,
                        PublisherPhase::Uninitialized | PublisherPhase::InitializingTx
                    ) {
                        self.initialize().await;
                        if self.phase == PublisherPhase::Fenced {
                            break;
                        }
                    }
                }
                PublisherMsg::Health(reply) => {
                    let _ = reply.send(self.health_snapshot());
                }
                PublisherMsg::Stop => {
                    self.shutdown().await;
                    return;
                }
            }
        }

        // Loop exits without Stop only when fenced.
        self.state.fail_all(PublishError::Fenced);
        self.drain_stash_fenced();
    }

    // =========================================================================
    // Initialization and recovery
    // =========================================================================

    async fn initialize(&mut self) {
        self.phase = PublisherPhase::InitializingTx;
        match self.producer.init_transactions().await {
            Ok(()) => {}
            Err(e) if e.is_fenced() => {
                self.enter_fenced("init_transactions");
                return;
            }
            Err(e) if e.requires_rebuild() => {
                warn!(
                    partition = %self.assigned,
                    error = %e,
                    "Fatal producer init error, rebuilding producer"
                );
                self.producer = self.deps.producer_factory.create();
                self.schedule_init_retry();
                return;
            }
            Err(e) => {
                warn!(
                    partition = %self.assigned,
                    error = %e,
                    "Transaction init failed, will retry"
                );
                self.schedule_init_retry();
                return;
            }
        }

        // Establish the recovery watermark with one empty record at our
        // exact partition, outside any transaction.
        let marker = RecordToSend::flush_marker(
            Arc::clone(&self.assigned.topic),
            self.assigned.partition,
        );
        match self.deps.flush_producer.send(marker).await {
            Ok(meta) => {
                info!(
                    partition = %self.assigned,
                    end_offset = meta.offset,
                    "Flush record written, recovering backlog"
                );
                self.phase = PublisherPhase::RecoveringBacklog {
                    end_offset: meta.offset,
                };
            }
            Err(e) => {
                warn!(
                    partition = %self.assigned,
                    error = %e,
                    "Failed to write flush record, will retry init"
                );
                self.schedule_init_retry();
            }
        }
    }

    fn schedule_init_retry(&self) {
        let tx = self.mailbox_tx.clone();
        let backoff = self.settings.init_retry_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = tx.send(PublisherMsg::InitAttempt).await;
        });
    }

    async fn handle_metadata_tick(&mut self) {
        match self.phase {
            PublisherPhase::RecoveringBacklog { end_offset } => {
                if !self.deps.state_index.is_open() {
                    return;
                }
                let processed = self
                    .deps
                    .state_index
                    .get_meta(&self.assigned)
                    .await
                    .map(|meta| meta.offset);
                if processed.is_some_and(|offset| offset >= end_offset) {
                    info!(
                        partition = %self.assigned,
                        end_offset,
                        "Backlog recovered, entering processing"
                    );
                    self.phase = PublisherPhase::Processing;
                    self.drain_stash();
                }
            }
            PublisherPhase::Processing => {
                if let Some(meta) = self.deps.state_index.get_meta(&self.assigned).await {
                    let retired = self.state.retire(meta.offset);
                    if retired > 0 {
                        debug!(
                            partition = %self.assigned,
                            processed_offset = meta.offset,
                            retired,
                            "Retired in-flight records"
                        );
                    }
                }
                self.resolve_inits();
                self.update_gauges();
            }
            _ => {}
        }
    }

    /// Replay stashed messages in arrival order, directly through the
    /// processing handlers so nothing can overtake them.
    fn drain_stash(&mut self) {
        let stashed: Vec<PublisherMsg> = self.stash.drain(..).collect();
        for msg in stashed {
            match msg {
                PublisherMsg::Publish {
                    state,
                    events,
                    reply,
                    ..
                } => self.handle_publish(state, events, reply),
                PublisherMsg::IsStateCurrent {
                    entity_id,
                    deadline,
                    reply,
                } => self.handle_is_state_current(entity_id, deadline, reply),
                _ => {}
            }
        }
    }

    fn drain_stash_fenced(&mut self) {
        for msg in self.stash.drain(..) {
            match msg {
                PublisherMsg::Publish { reply, .. } => {
                    let _ = reply.send(Err(PublishError::Fenced));
                }
                PublisherMsg::IsStateCurrent { reply, .. } => {
                    let _ = reply.send(false);
                }
                _ => {}
            }
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    fn handle_publish(
        &mut self,
        state: (EntityKey, Option<Bytes>),
        events: Vec<(String, Bytes)>,
        reply: oneshot::Sender<Result<(), PublishError>>,
    ) {
        self.state.enqueue(PendingWrite {
            payload: PublishPayload { state, events },
            reply,
        });
        self.update_gauges();
    }

    fn handle_is_state_current(
        &mut self,
        entity_id: EntityKey,
        deadline: Instant,
        reply: oneshot::Sender<bool>,
    ) {
        if !self.state.is_in_flight(&entity_id) && !self.state.has_pending_write(&entity_id) {
            metrics::record_state_current_result(true);
            let _ = reply.send(true);
            return;
        }
        self.state.add_pending_init(PendingInit {
            entity_key: entity_id,
            expires_at: deadline,
            reply,
        });
        self.update_gauges();
    }

    fn resolve_inits(&mut self) {
        let resolved = self.state.take_resolved_inits(Instant::now());
        for init in resolved.current {
            metrics::record_state_current_result(true);
            let _ = init.reply.send(true);
        }
        for init in resolved.expired {
            metrics::record_state_current_result(false);
            let _ = init.reply.send(false);
        }
    }

    async fn flush(&mut self) {
        if self.state.transaction_in_progress() {
            let age_ms = self
                .state
                .transaction_age(Instant::now())
                .map(|age| age.as_millis() as u64)
                .unwrap_or(0);
            let now = Instant::now();
            let warn_due = self
                .last_flush_skip_warn
                .is_none_or(|last| now.duration_since(last) >= FLUSH_SKIP_WARN_INTERVAL);
            if warn_due {
                self.last_flush_skip_warn = Some(now);
                warn!(
                    partition = %self.assigned,
                    current_txn_ms = age_ms,
                    "Skipping flush, transaction still in progress"
                );
            }
            return;
        }
        if self.state.pending_write_count() == 0 {
            return;
        }

        let writes = self.state.drain_pending();
        let mut records = Vec::new();
        for write in &writes {
            for (event_key, event_value) in &write.payload.events {
                records.push(RecordToSend {
                    topic: Arc::clone(&self.events_topic),
                    partition: None,
                    key: Some(event_key.clone()),
                    value: Some(event_value.clone()),
                });
            }
            let (state_key, state_value) = &write.payload.state;
            records.push(RecordToSend {
                topic: Arc::clone(&self.assigned.topic),
                partition: Some(self.assigned.partition),
                key: Some(state_key.clone()),
                value: state_value.clone(),
            });
        }

        let started = Instant::now();
        self.state.begin_transaction(started);

        if let Err(e) = self.producer.begin_transaction().await {
            self.state.complete_transaction();
            if e.is_fenced() {
                self.fail_writes(writes, PublishError::Fenced);
                self.enter_fenced("begin_transaction");
            } else {
                error!(
                    partition = %self.assigned,
                    error = %e,
                    "Failed to begin transaction"
                );
                metrics::PUBLISH_FAILURES
                    .with_label_values(&[
                        self.assigned.topic.as_ref(),
                        &self.assigned.partition.to_string(),
                        "begin",
                    ])
                    .inc();
                self.fail_writes(writes, PublishError::Rejected(e.to_string()));
            }
            self.update_gauges();
            return;
        }

        let record_count = records.len();
        let outcome = match self.producer.send_records(records).await {
            Ok(acks) => match self.producer.commit_transaction().await {
                Ok(()) => Ok(acks),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(acks) => {
                self.state.complete_transaction();
                let state_topic = Arc::clone(&self.assigned.topic);
                self.state.record_in_flight(
                    acks.into_iter()
                        .filter(|ack| ack.topic == state_topic),
                );
                for write in writes {
                    let _ = write.reply.send(Ok(()));
                }
                let partition_label = self.assigned.partition.to_string();
                metrics::TRANSACTION_DURATION
                    .with_label_values(&[self.assigned.topic.as_ref(), &partition_label])
                    .observe(started.elapsed().as_secs_f64());
                metrics::FLUSH_BATCH_SIZE
                    .with_label_values(&[self.assigned.topic.as_ref(), &partition_label])
                    .observe(record_count as f64);
            }
            Err(e) if e.is_fenced() => {
                self.state.complete_transaction();
                self.fail_writes(writes, PublishError::Fenced);
                self.enter_fenced("commit_transaction");
            }
            Err(e) => {
                error!(
                    partition = %self.assigned,
                    error = %e,
                    "Transaction failed, aborting"
                );
                metrics::PUBLISH_FAILURES
                    .with_label_values(&[
                        self.assigned.topic.as_ref(),
                        &self.assigned.partition.to_string(),
                        "commit",
                    ])
                    .inc();
                if let Err(abort_err) = self.producer.abort_transaction().await {
                    if abort_err.is_fenced() {
                        self.state.complete_transaction();
                        self.fail_writes(writes, PublishError::Fenced);
                        self.enter_fenced("abort_transaction");
                        self.update_gauges();
                        return;
                    }
                    warn!(
                        partition = %self.assigned,
                        error = %abort_err,
                        "Abort failed after transaction error"
                    );
                }
                self.state.complete_transaction();
                // Surface the failure so senders retry; the batch is not
                // silently requeued.
                self.fail_writes(writes, PublishError::Rejected(e.to_string()));
            }
        }
        self.update_gauges();
    }

    fn fail_writes(&self, writes: Vec<PendingWrite>, error: PublishError) {
        for write in writes {
            let _ = write.reply.send(Err(error.clone()));
        }
    }

    fn enter_fenced(&mut self, during: &'static str) {
        error!(
            partition = %self.assigned,
            transactional_id = %self.transactional_id,
            during,
            "Producer fenced by a newer instance, terminating publisher"
        );
        self.shared.fenced.store(true, Ordering::SeqCst);
        self.phase = PublisherPhase::Fenced;
    }

    // =========================================================================
    // Health and shutdown
    // =========================================================================

    fn health_snapshot(&self) -> PublisherHealth {
        let current_txn_ms = self
            .state
            .transaction_age(Instant::now())
            .map(|age| age.as_millis() as u64);
        let txn_too_old = current_txn_ms
            .is_some_and(|ms| ms > self.settings.transaction_unhealthy_after.as_millis() as u64);
        let fenced = self.phase == PublisherPhase::Fenced;
        PublisherHealth {
            status: if fenced || txn_too_old {
                HealthStatus::Down
            } else {
                HealthStatus::Up
            },
            fenced,
            in_flight: self.state.in_flight_count(),
            pending_writes: self.state.pending_write_count(),
            pending_inits: self.state.pending_init_count(),
            current_txn_ms,
            phase: self.phase.name(),
        }
    }

    async fn shutdown(&mut self) {
        info!(partition = %self.assigned, "Publisher stopping");
        // One last abort for an open transaction; fencing already
        // invalidated it, so the fenced path skips this.
        if self.state.transaction_in_progress() && self.phase != PublisherPhase::Fenced {
            if let Err(e) = self.producer.abort_transaction().await {
                warn!(partition = %self.assigned, error = %e, "Abort on shutdown failed");
            }
            self.state.complete_transaction();
        }
        self.state.fail_all(PublishError::Stopped);
        self.drain_stash_stopped();
    }

    fn drain_stash_stopped(&mut self) {
        for msg in self.stash.drain(..) {
            match msg {
                PublisherMsg::Publish { reply, .. } => {
                    let _ = reply.send(Err(PublishError::Stopped));
                }
                PublisherMsg::IsStateCurrent { reply, .. } => {
                    let _ = reply.send(false);
                }
                _ => {}
            }
        }
    }

    fn update_gauges(&self) {
        let partition = self.assigned.partition.to_string();
        let topic = self.assigned.topic.as_ref();
        metrics::IN_FLIGHT_RECORDS
            .with_label_values(&[topic, &partition])
            .set(self.state.in_flight_count() as i64);
        metrics::PENDING_WRITES
            .with_label_values(&[topic, &partition])
            .set(self.state.pending_write_count() as i64);
        metrics::PENDING_STATE_QUERIES
            .with_label_values(&[topic, &partition])
            .set(self.state.pending_init_count() as i64);
    }
}
