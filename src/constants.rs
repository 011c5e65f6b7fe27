//! Centralized timing and sizing defaults.
//!
//! Every interval and threshold used by the coordination core lives here so
//! the relationships between them stay visible: the metadata poll must be
//! much shorter than the pending-init deadlines it resolves, and the flush
//! interval bounds how long a publish waits before entering a transaction.

use std::time::Duration;

// =============================================================================
// Publisher timing
// =============================================================================

/// How often the publisher drains pending writes into one transaction.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// How often the publisher polls the state-store metadata cursor to retire
/// in-flight records (and, during recovery, to detect the flush record).
pub const METADATA_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Backoff between transaction-initialization attempts, both with a rebuilt
/// producer (fatal init errors) and with the same producer (transient ones).
pub const INIT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// An open transaction older than this marks the publisher DOWN.
pub const TRANSACTION_UNHEALTHY_AFTER: Duration = Duration::from_secs(120);

/// Minimum spacing between "flush skipped, transaction still open" warnings.
pub const FLUSH_SKIP_WARN_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Router timing
// =============================================================================

/// Interval at which the router re-sends its tracker registration until the
/// first assignments snapshot arrives.
pub const REGISTRATION_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// How long a local region gets to answer a health probe before the router
/// reports DOWN.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// =============================================================================
// Consumer restart backoff
// =============================================================================

/// First delay after a consumer pipeline failure.
pub const RESTART_BACKOFF_MIN: Duration = Duration::from_secs(1);

/// Ceiling for the consumer restart backoff.
pub const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Fractional jitter applied to each restart delay (+/- 10%).
pub const RESTART_BACKOFF_JITTER: f64 = 0.10;

// =============================================================================
// Committer defaults
// =============================================================================

/// Offsets accumulated before the committer flushes a commit batch.
pub const DEFAULT_COMMITTER_MAX_BATCH: usize = 100;

/// Longest an offset waits in the committer before being committed.
pub const DEFAULT_COMMITTER_MAX_INTERVAL: Duration = Duration::from_secs(1);

/// Concurrent business-flow invocations feeding the committer.
pub const DEFAULT_COMMITTER_PARALLELISM: usize = 4;

// =============================================================================
// Replay
// =============================================================================

/// Upper bound on one entire stop-rewind-restart replay cycle.
pub const DEFAULT_ENTIRE_REPLAY_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Mailboxes
// =============================================================================

/// Bound for every agent mailbox. Deep enough to absorb a flush interval of
/// bursty traffic; small enough that backpressure reaches callers quickly.
pub const MAILBOX_CAPACITY: usize = 1024;
