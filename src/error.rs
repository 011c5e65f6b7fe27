//! Error types for the coordination core.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used, chosen by operation criticality:
//!
//! ## Fail-fast (propagate)
//!
//! - Transaction begin/commit on the publish path
//! - Configuration validation at startup
//! - Replay orchestration
//!
//! ## Absorb and retry (log, never surface to domain callers)
//!
//! - Producer initialization (rebuild + retry with backoff)
//! - Consumer pipeline failures (restart supervisor)
//! - Transient transaction errors (abort, keep the publisher alive)
//!
//! Domain callers only ever observe success, an explicit publish rejection,
//! or their own ask-timeout. Fencing and unroutable conditions surface to
//! operators through health snapshots and logs.

use thiserror::Error;

use crate::log::ProducerError;

/// Result type for coordination-core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the coordination core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Another producer with the same transactional id took over this
    /// partition. Fatal to the publisher instance.
    #[error("producer fenced for transactional id {transactional_id}")]
    Fenced { transactional_id: String },

    /// A begin/submit/commit failed without fencing. The transaction is
    /// aborted and the failure surfaced to the senders of that flush.
    #[error("transient log error: {0}")]
    TransientLog(String),

    /// The producer could not be created or initialized (authorization,
    /// unsupported version, broker-fatal). Handled by rebuild + retry.
    #[error("producer initialization failed: {0}")]
    InitFatal(String),

    /// The consumer pipeline died. Handled by the restart supervisor.
    #[error("consumer pipeline failure: {0}")]
    ConsumerFailure(String),

    /// Entity-id extraction failed or the partition has no assignment.
    /// The message goes to dead letters; the caller observes a timeout.
    #[error("unroutable message: {reason}")]
    Unroutable { reason: String },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Replay orchestration failed or timed out.
    #[error("replay failed: {0}")]
    Replay(String),

    /// A reply did not arrive before the caller's deadline. Not a fault;
    /// callers decide whether to retry.
    #[error("{what} timed out")]
    Timeout { what: &'static str },

    /// The component's mailbox is gone; it has stopped or is stopping.
    #[error("{component} is not running")]
    NotRunning { component: &'static str },
}

impl CoreError {
    /// True when the operation may be retried against the same instance.
    ///
    /// Fenced publishers must be replaced, not retried; configuration
    /// problems need manual intervention.
    pub fn is_retriable(&self) -> bool {
        match self {
            CoreError::TransientLog(_) => true,
            CoreError::InitFatal(_) => true,
            CoreError::ConsumerFailure(_) => true,
            CoreError::Replay(_) => true,
            CoreError::Timeout { .. } => true,
            CoreError::Fenced { .. } => false,
            CoreError::Unroutable { .. } => false,
            CoreError::Config(_) => false,
            CoreError::NotRunning { .. } => false,
        }
    }

    /// True when this error means the publisher instance must terminate.
    pub fn is_fenced(&self) -> bool {
        matches!(self, CoreError::Fenced { .. })
    }
}

impl CoreError {
    /// Map a producer error observed under `transactional_id` into the core
    /// taxonomy.
    pub fn from_producer(err: ProducerError, transactional_id: &str) -> Self {
        if err.is_fenced() {
            CoreError::Fenced {
                transactional_id: transactional_id.to_string(),
            }
        } else if err.requires_rebuild() {
            CoreError::InitFatal(err.to_string())
        } else {
            CoreError::TransientLog(err.to_string())
        }
    }
}
