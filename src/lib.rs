//! # Logshard
//! Coordination core for event-sourced command/state services over a
//! partitioned log.
//!
//! Per-entity state is maintained by replaying an event log into a
//! per-partition state store. This crate provides the triad that keeps
//! commands, events and state consistent around that store:
//!
//! - [`ShardRouter`](coordination::ShardRouter) maps an entity id to the
//!   node currently owning its partition, forwards commands there, and
//!   reacts to rebalances.
//! - [`TransactionalPublisher`](coordination::TransactionalPublisher),
//!   one per owned partition, batches writes, publishes events + state
//!   atomically with producer transactions, and answers "is this entity's
//!   state current?" against the projection's processed-offset cursor.
//! - [`StreamManager`](coordination::StreamManager) owns the committable
//!   consumer pipeline: start/stop/drain, restart with backoff, replay
//!   coordination and metrics.
//!
//! The log client itself, the domain codecs and cluster membership stay
//! outside; they plug in through the traits in [`log`], [`state_store`]
//! and [`coordination`].
//!
//! # Example
//!
//! ```rust,no_run
//! use logshard::config::CoreConfig;
//! use logshard::coordination::{
//!     PublisherDeps, TransactionalPublisher,
//! };
//! # fn collaborators() -> PublisherDeps { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CoreConfig::from_env().expect("valid configuration");
//!     let publisher = TransactionalPublisher::spawn(&config, 0, collaborators());
//!
//!     publisher
//!         .publish(
//!             "order-42".to_string(),
//!             ("order-42".to_string(), Some("state-bytes".into())),
//!             vec![("order-42".to_string(), "event-bytes".into())],
//!         )
//!         .await
//!         .expect("committed");
//! }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod coordination;
pub mod error;
pub mod log;
pub mod metrics;
pub mod state_store;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! The types an embedding service touches day to day.
    pub use crate::config::CoreConfig;
    pub use crate::coordination::{
        HealthStatus, PartitionAssignments, PublishError, PublisherDeps, ReplayResult,
        RouterDeps, RouterSettings, ShardRouter, StreamManager, StreamManagerDeps,
        TransactionalPublisher,
    };
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::types::{EntityKey, HostPort, Offset, RecordMetadata, TopicPartition};
}
