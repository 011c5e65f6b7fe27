//! Partition-tracker contract: the push-based feed of assignment snapshots.
//!
//! Cluster membership is external; whatever watches it implements
//! [`PartitionTracker`] and pushes whole [`PartitionAssignments`] snapshots
//! to registered subscribers on every change and on registration. The
//! router re-sends its registration on a timer until the first snapshot
//! arrives, so a tracker restart loses nothing.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use super::assignments::PartitionAssignments;

/// Push-based feed of partition assignments.
pub trait PartitionTracker: Send + Sync {
    /// Register a subscriber. Implementations send the current snapshot
    /// immediately when one exists, then every subsequent snapshot.
    /// Registering the same subscriber twice must be harmless.
    fn register(&self, subscriber: mpsc::Sender<PartitionAssignments>);
}

/// Tracker backed by explicit `publish` calls.
///
/// The bridge from any membership system: push a fresh snapshot whenever
/// ownership changes and every subscriber sees it. Subscribers whose
/// channels are gone are dropped on the next publish.
#[derive(Default)]
pub struct AssignmentFeed {
    inner: Mutex<FeedInner>,
}

#[derive(Default)]
struct FeedInner {
    subscribers: Vec<mpsc::Sender<PartitionAssignments>>,
    latest: Option<PartitionAssignments>,
}

impl AssignmentFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new snapshot to every live subscriber.
    pub fn publish(&self, snapshot: PartitionAssignments) {
        let mut inner = self.inner.lock().expect("assignment feed lock");
        inner
            .subscribers
            .retain(|sub| match sub.try_send(snapshot.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Assignment subscriber mailbox full, keeping subscriber");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        inner.latest = Some(snapshot);
    }

    /// The most recently published snapshot, if any.
    pub fn latest(&self) -> Option<PartitionAssignments> {
        self.inner.lock().expect("assignment feed lock").latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("assignment feed lock")
            .subscribers
            .len()
    }
}

impl PartitionTracker for AssignmentFeed {
    fn register(&self, subscriber: mpsc::Sender<PartitionAssignments>) {
        let mut inner = self.inner.lock().expect("assignment feed lock");
        if let Some(latest) = &inner.latest {
            let _ = subscriber.try_send(latest.clone());
        }
        if !inner
            .subscribers
            .iter()
            .any(|existing| existing.same_channel(&subscriber))
        {
            inner.subscribers.push(subscriber);
        }
    }
}
