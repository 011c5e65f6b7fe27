//! Read contract for the per-partition state-store metadata index.
//!
//! The projection that replays events into queryable state maintains, per
//! partition, the offset of the last record it has processed. The publisher
//! polls this cursor to retire in-flight writes and to detect when its
//! startup flush record has been consumed. Only the read side matters here;
//! the write side belongs to the projection pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Offset, TopicPartition};

/// Metadata row for one partition of the state topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIndexMeta {
    pub topic: String,
    pub partition: u32,
    /// Offset of the last record the projection has processed.
    pub offset: Offset,
    /// The `topic:partition` key this row is stored under.
    pub key: String,
}

/// Read interface of the state-store global metadata index.
#[async_trait]
pub trait StateIndex: Send + Sync {
    /// False while the store is still opening or has been closed.
    fn is_open(&self) -> bool;

    /// Processed-offset row for one partition, if the projection has
    /// recorded any progress for it.
    async fn get_meta(&self, tp: &TopicPartition) -> Option<StateIndexMeta>;
}

/// In-memory index keyed by `topic:partition`. Backs local runs and tests;
/// a deployment points [`StateIndex`] at the projection's real store.
#[derive(Debug)]
pub struct InMemoryStateIndex {
    rows: DashMap<String, StateIndexMeta>,
    open: std::sync::atomic::AtomicBool,
}

impl Default for InMemoryStateIndex {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
            open: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

impl InMemoryStateIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record projection progress for a partition. Offsets only move
    /// forward; a stale update is ignored.
    pub fn advance(&self, tp: &TopicPartition, offset: Offset) {
        let key = tp.meta_key();
        let mut entry = self.rows.entry(key.clone()).or_insert_with(|| StateIndexMeta {
            topic: tp.topic.to_string(),
            partition: tp.partition,
            offset,
            key,
        });
        if entry.offset < offset {
            entry.offset = offset;
        }
    }

    pub fn close(&self) {
        self.open.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl StateIndex for InMemoryStateIndex {
    fn is_open(&self) -> bool {
        self.open.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn get_meta(&self, tp: &TopicPartition) -> Option<StateIndexMeta> {
        self.rows.get(&tp.meta_key()).map(|r| r.clone())
    }
}
