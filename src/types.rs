//! Core value types shared across the routing and publishing layers.
//!
//! These are plain value types compared by value. `TopicPartition` uses an
//! `Arc<str>` topic name so that the keys cloned on every routing decision,
//! in-flight upsert and metadata poll are O(1) to copy.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Offset of a record within one partition's log.
pub type Offset = u64;

/// Key identifying one entity (aggregate). The partitioner maps this key to
/// exactly one partition of the tracked topic.
pub type EntityKey = String;

/// Network identity of one node of the service, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One ordered shard of a topic; the unit of assignment and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: Arc<str>,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// The `topic:partition` form used as the state-store metadata key.
    pub fn meta_key(&self) -> String {
        format!("{}:{}", self.topic, self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Metadata for one acknowledged producer write. Only used to track
/// in-flight records against the projection's processed-offset cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub key: Option<String>,
    pub topic: Arc<str>,
    pub partition: u32,
    pub offset: Offset,
}

impl RecordMetadata {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: Arc::clone(&self.topic),
            partition: self.partition,
        }
    }
}

impl fmt::Display for RecordMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}
