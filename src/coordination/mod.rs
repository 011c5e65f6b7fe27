//! Coordination core: shard routing, transactional publishing and the
//! consumed-stream lifecycle.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────┐   assignments   ┌──────────────────┐
//!   commands──▶│  ShardRouter │◀────────────────│ PartitionTracker │
//!              └──────┬───────┘                 └──────────────────┘
//!            local    │    remote
//!        ┌────────────┴──────────────┐
//!        ▼                           ▼
//!  ┌───────────┐              ┌─────────────┐
//!  │  Region   │              │ Peer router │
//!  └─────┬─────┘              └─────────────┘
//!        ▼
//!  ┌──────────────────────────┐   transactions   ┌───────────┐
//!  │ TransactionalPublisher   │─────────────────▶│    Log    │
//!  └────────────┬─────────────┘                  └─────┬─────┘
//!               │ processed-offset cursor              │ events
//!               ▼                                      ▼
//!  ┌──────────────────────────┐   committed    ┌───────────────┐
//!  │    State-store index     │◀───────────────│ StreamManager │
//!  └──────────────────────────┘                └───────────────┘
//! ```
//!
//! Each component is a message-driven agent owning its state exclusively
//! and processing one message at a time; every cross-component interaction
//! is an asynchronous message or a log-client await. Ordering is promised
//! within a partition only.

pub mod assignments;
pub mod publisher;
pub mod publisher_state;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod router;
pub mod stream_manager;
pub mod tracker;

pub use assignments::{AssignmentDiff, PartitionAssignments};
pub use publisher::{PublisherDeps, PublisherHealth, TransactionalPublisher};
pub use publisher_state::{PublishError, PublishPayload, PublisherState};
pub use registry::{
    PartitionRegistry, RegionFactory, RegionHandle, RegionKind, RegionMessage, RegionSink,
    RemoteSelector, RemoteTransport, TransportError,
};
pub use replay::{ReplayCoordinator, ReplayResult, ReplayStrategy};
pub use router::{
    DeadLetter, DeadLetterReason, EntityExtractor, RouterDeps, RouterHealth, RouterSettings,
    ShardRouter,
};
pub use stream_manager::{EventFlow, StreamManager, StreamManagerDeps};
pub use tracker::{AssignmentFeed, PartitionTracker};

/// Binary health of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Up => write!(f, "up"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}
