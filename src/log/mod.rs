//! Contracts for the partitioned-log client.
//!
//! The core never talks to the log directly; it drives these traits. A real
//! deployment backs them with a Kafka-compatible client, tests back them
//! with the mocks in [`mock`].
//!
//! # Fencing Detection
//!
//! Fencing errors mean another producer with the same transactional id has
//! taken over the partition. They are critical for split-brain prevention,
//! so detection is layered:
//!
//! 1. **Typed** (highest confidence): the client surfaced
//!    [`ProducerError::Fenced`].
//! 2. **Pattern matching** (medium confidence): known fencing phrases in a
//!    stringly error from the client, see [`classify_error_message`].
//!
//! Unknown stringly errors are treated as transient, not as fencing: a
//! wrongly-fenced publisher drops its partition, which is worse here than
//! one extra failed flush.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::{Offset, RecordMetadata};

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

/// Consumer property naming this node's advertised host, recognized by a
/// host-aware partition assignor.
pub const HOST_AWARENESS_HOST: &str = "host.awareness.host";

/// Consumer property naming this node's advertised port.
pub const HOST_AWARENESS_PORT: &str = "host.awareness.port";

/// Errors surfaced by the log producer.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    /// Another producer with the same transactional id took over.
    /// Fatal to the publisher instance.
    #[error("producer fenced by a newer instance")]
    Fenced,

    /// Broker rejected the client version. Retryable after a producer rebuild.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// Authorization failed. Retryable after a producer rebuild.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The client reported itself fatally broken. Retryable after rebuild.
    #[error("fatal log client error: {0}")]
    LogFatal(String),

    /// Anything else; retryable with the same producer.
    #[error("log error: {0}")]
    Generic(String),
}

impl ProducerError {
    /// Build a producer error from a stringly client error, promoting known
    /// fencing phrases to the typed variant.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match classify_error_message(&msg) {
            ErrorCategory::Fenced => ProducerError::Fenced,
            ErrorCategory::Other => ProducerError::Generic(msg),
        }
    }

    /// True when this error invalidates the producer's transactional session.
    pub fn is_fenced(&self) -> bool {
        matches!(self, ProducerError::Fenced)
    }

    /// True when retrying requires constructing a fresh producer first.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            ProducerError::UnsupportedVersion(_)
                | ProducerError::Authorization(_)
                | ProducerError::LogFatal(_)
        )
    }
}

/// Category assigned to a stringly client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCategory {
    Fenced,
    Other,
}

/// Classify an error message by known fencing phrases.
fn classify_error_message(msg: &str) -> ErrorCategory {
    const FENCING_PATTERNS: &[&str] = &[
        "fenced",
        "fence",
        "producer epoch",
        "epoch mismatch",
        "invalid_producer_epoch",
        "transactional_id_authorization",
        "newer instance",
        "zombie",
    ];

    let msg_lower = msg.to_lowercase();
    if FENCING_PATTERNS.iter().any(|p| msg_lower.contains(p)) {
        ErrorCategory::Fenced
    } else {
        ErrorCategory::Other
    }
}

/// One record handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordToSend {
    pub topic: Arc<str>,
    /// Explicit target partition; `None` lets the partitioner decide by key.
    pub partition: Option<u32>,
    pub key: Option<String>,
    /// `None` publishes a tombstone.
    pub value: Option<Bytes>,
}

impl RecordToSend {
    /// The empty marker record the publisher writes at startup to establish
    /// its recovery watermark.
    pub fn flush_marker(topic: Arc<str>, partition: u32) -> Self {
        Self {
            topic,
            partition: Some(partition),
            key: None,
            value: None,
        }
    }
}

/// Deterministic entity-key → partition mapping for one topic.
///
/// Must agree with the partitioner every producer on the write path uses,
/// or commands will be routed to a node that does not own the entity's
/// partition.
pub trait Partitioner: Send + Sync {
    fn partition_for(&self, key: &str) -> Option<u32>;
}

/// Transactional producer owned exclusively by one publisher instance.
///
/// `send_records` submits every record concurrently and resolves once all
/// of them are acknowledged, mirroring how transactional clients pipeline
/// within one transaction.
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn init_transactions(&self) -> Result<(), ProducerError>;

    async fn begin_transaction(&self) -> Result<(), ProducerError>;

    async fn send_records(
        &self,
        records: Vec<RecordToSend>,
    ) -> Result<Vec<RecordMetadata>, ProducerError>;

    async fn commit_transaction(&self) -> Result<(), ProducerError>;

    async fn abort_transaction(&self) -> Result<(), ProducerError>;

    /// Deterministic entity-key → partition mapping for the tracked topic.
    /// Must match the partitioner used by every producer on the write path.
    fn partition_for(&self, key: &str) -> Option<u32>;

    /// The transactional id this producer was created with.
    fn transactional_id(&self) -> &str;
}

/// Builds (and rebuilds, after fatal init errors) transactional producers.
pub trait ProducerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn TransactionalProducer>;
}

/// Non-transactional producer used only for the startup flush record.
#[async_trait]
pub trait ImmediateProducer: Send + Sync {
    async fn send(&self, record: RecordToSend) -> Result<RecordMetadata, ProducerError>;
}

/// Position of one consumed record, committable back to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittableOffset {
    pub topic: Arc<str>,
    pub partition: u32,
    pub offset: Offset,
}

/// One consumed record plus the offset to commit once it is processed.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub key: Option<String>,
    pub value: Bytes,
    pub offset: CommittableOffset,
}

/// Errors surfaced by the log consumer.
#[derive(Debug, Clone, Error)]
#[error("consumer error: {0}")]
pub struct ConsumerError(pub String);

/// Committable consumer source.
///
/// Implementations use interior mutability (the usual shape for log
/// consumers), so one instance can be polled by the pipeline task while the
/// manager reads `metrics()`.
#[async_trait]
pub trait CommittableConsumer: Send + Sync {
    /// Await the next batch of records. An empty batch is a valid outcome
    /// (poll timeout); an error restarts the pipeline.
    async fn poll(&self) -> Result<Vec<EventEnvelope>, ConsumerError>;

    /// Commit processed offsets back to the group.
    async fn commit(&self, offsets: Vec<CommittableOffset>) -> Result<(), ConsumerError>;

    /// Live metric snapshot from the underlying client.
    fn metrics(&self) -> HashMap<String, f64>;
}

/// Creates consumers configured with the given properties (including the
/// host-awareness pair when configured).
pub trait ConsumerFactory: Send + Sync {
    fn create(&self, properties: &HashMap<String, String>) -> Arc<dyn CommittableConsumer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fencing_phrases_promote_to_typed_variant() {
        assert!(ProducerError::from_message("Producer was fenced out").is_fenced());
        assert!(ProducerError::from_message("INVALID_PRODUCER_EPOCH: stale").is_fenced());
        assert!(ProducerError::from_message("epoch mismatch on commit").is_fenced());
        assert!(ProducerError::from_message("superseded by a newer instance").is_fenced());
    }

    #[test]
    fn non_fencing_messages_stay_generic() {
        let err = ProducerError::from_message("request timed out");
        assert!(!err.is_fenced());
        assert!(matches!(err, ProducerError::Generic(_)));
    }

    #[test]
    fn rebuild_classification() {
        assert!(ProducerError::UnsupportedVersion("v99".into()).requires_rebuild());
        assert!(ProducerError::Authorization("denied".into()).requires_rebuild());
        assert!(ProducerError::LogFatal("broker gone".into()).requires_rebuild());
        assert!(!ProducerError::Generic("timeout".into()).requires_rebuild());
        assert!(!ProducerError::Fenced.requires_rebuild());
    }

    #[test]
    fn flush_marker_is_empty_and_pinned() {
        let marker = RecordToSend::flush_marker("state".into(), 4);
        assert_eq!(marker.partition, Some(4));
        assert!(marker.key.is_none());
        assert!(marker.value.is_none());
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(
            classify_error_message("PRODUCER FENCED"),
            ErrorCategory::Fenced
        );
        assert_eq!(
            classify_error_message("connection refused"),
            ErrorCategory::Other
        );
    }
}
