//! Pure state machine for the transactional publisher.
//!
//! Holds everything the publisher tracks between messages: the FIFO queue
//! of pending writes, the in-flight map, outstanding is-state-current
//! queries and the transaction timer. No IO happens here; the publisher
//! agent drives these transitions and performs the producer calls.
//!
//! Invariants maintained by every transition:
//! - `transaction_in_progress() ⇔ transaction_started_at.is_some()`
//! - at most one in-flight record per key, the one with the largest offset
//! - `pending_writes` is FIFO and drained completely per flush
//! - a pending init resolves `true` only once its key has no in-flight
//!   entry, `false` once its deadline passes

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::types::{EntityKey, Offset, RecordMetadata};

/// Why a publish did not commit. Surfaced to the sender so it can retry;
/// failed writes are never silently requeued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The flush containing this write failed and was aborted.
    #[error("publish rejected: {0}")]
    Rejected(String),
    /// The publisher was fenced by a newer instance.
    #[error("publisher fenced")]
    Fenced,
    /// The publisher stopped before this write entered a transaction.
    #[error("publisher stopped")]
    Stopped,
}

/// State and event payload of one publish call.
#[derive(Debug, Clone)]
pub struct PublishPayload {
    /// Entity state to upsert; `None` bytes publish a tombstone.
    pub state: (EntityKey, Option<Bytes>),
    /// Domain events, keyed for the events topic.
    pub events: Vec<(String, Bytes)>,
}

/// One write waiting for the next flush.
pub struct PendingWrite {
    pub payload: PublishPayload,
    pub reply: oneshot::Sender<Result<(), PublishError>>,
}

/// One outstanding is-state-current query.
pub struct PendingInit {
    pub entity_key: EntityKey,
    pub expires_at: Instant,
    pub reply: oneshot::Sender<bool>,
}

/// Pending-init resolutions produced by one state advance.
pub struct ResolvedInits {
    /// Keys with no remaining in-flight entry: answer `true`.
    pub current: Vec<PendingInit>,
    /// Deadline passed first: answer `false`.
    pub expired: Vec<PendingInit>,
}

/// Mutable state of one publisher instance.
#[derive(Default)]
pub struct PublisherState {
    pending_writes: VecDeque<PendingWrite>,
    inflight: HashMap<EntityKey, RecordMetadata>,
    pending_inits: Vec<PendingInit>,
    transaction_started_at: Option<Instant>,
}

impl PublisherState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_in_progress(&self) -> bool {
        self.transaction_started_at.is_some()
    }

    /// Age of the open transaction, if one is open.
    pub fn transaction_age(&self, now: Instant) -> Option<Duration> {
        self.transaction_started_at
            .map(|started| now.saturating_duration_since(started))
    }

    pub fn begin_transaction(&mut self, now: Instant) {
        debug_assert!(
            self.transaction_started_at.is_none(),
            "flush must not begin while a transaction is open"
        );
        self.transaction_started_at = Some(now);
    }

    /// Clear the transaction marker. Called on commit, abort and failure
    /// paths alike.
    pub fn complete_transaction(&mut self) {
        self.transaction_started_at = None;
    }

    pub fn enqueue(&mut self, write: PendingWrite) {
        self.pending_writes.push_back(write);
    }

    /// Drain every pending write, oldest first. A flush takes the whole
    /// queue in one attempt.
    pub fn drain_pending(&mut self) -> Vec<PendingWrite> {
        self.pending_writes.drain(..).collect()
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn pending_init_count(&self) -> usize {
        self.pending_inits.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Whether a write for this key is still queued for the next flush.
    /// A state-currency query must not resolve `true` ahead of it.
    pub fn has_pending_write(&self, key: &str) -> bool {
        self.pending_writes
            .iter()
            .any(|write| write.payload.state.0 == key)
    }

    /// Offset of the in-flight record for a key, if any.
    pub fn in_flight_offset(&self, key: &str) -> Option<Offset> {
        self.inflight.get(key).map(|m| m.offset)
    }

    /// Record committed state-topic acks as in-flight. Superseded writes
    /// collapse: only the largest offset per key survives.
    pub fn record_in_flight(&mut self, acks: impl IntoIterator<Item = RecordMetadata>) {
        for ack in acks {
            let Some(key) = ack.key.clone() else {
                continue;
            };
            match self.inflight.get(&key) {
                Some(existing) if existing.offset >= ack.offset => {}
                _ => {
                    self.inflight.insert(key, ack);
                }
            }
        }
    }

    /// Retire every in-flight record at or below the projection cursor.
    /// Returns how many were removed.
    pub fn retire(&mut self, processed_offset: Offset) -> usize {
        let before = self.inflight.len();
        self.inflight.retain(|_, meta| meta.offset > processed_offset);
        before - self.inflight.len()
    }

    pub fn add_pending_init(&mut self, init: PendingInit) {
        self.pending_inits.push(init);
    }

    /// Split off every pending init that can be answered now: resolved
    /// (key no longer in flight) or expired. Remaining inits stay queued
    /// in arrival order.
    pub fn take_resolved_inits(&mut self, now: Instant) -> ResolvedInits {
        let mut current = Vec::new();
        let mut expired = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending_inits.len());
        for init in self.pending_inits.drain(..) {
            let outstanding = self.inflight.contains_key(&init.entity_key)
                || self
                    .pending_writes
                    .iter()
                    .any(|w| w.payload.state.0 == init.entity_key);
            if !outstanding {
                current.push(init);
            } else if init.expires_at <= now {
                expired.push(init);
            } else {
                remaining.push(init);
            }
        }
        self.pending_inits = remaining;
        ResolvedInits { current, expired }
    }

    /// Fail every queued write and query. Used at shutdown.
    pub fn fail_all(&mut self, error: PublishError) {
        for write in self.pending_writes.drain(..) {
            let _ = write.reply.send(Err(error.clone()));
        }
        for init in self.pending_inits.drain(..) {
            let _ = init.reply.send(false);
        }
    }
}
