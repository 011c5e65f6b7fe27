//! Local table of partition → region handle.
//!
//! A region is the handler for one partition. On the owning node it is a
//! local mailbox created by a caller-supplied factory; on every other node
//! it is a logical remote address that the transport layer resolves when a
//! command must be forwarded. The registry itself is plain data owned by
//! the router agent; all mutation happens on the router's message loop.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::types::HostPort;

/// Messages a local region handler must accept.
#[derive(Debug)]
pub enum RegionMessage<M, R> {
    /// A routed command, wrapped with its partition. The region replies on
    /// `reply`; the router never manufactures a reply itself.
    Command {
        partition: u32,
        message: M,
        reply: oneshot::Sender<R>,
    },
    /// Liveness probe for router health checks.
    HealthProbe { reply: oneshot::Sender<bool> },
    /// The partition was revoked or the router is shutting down.
    Stop,
}

/// Sending half of a local region's mailbox.
pub type RegionSink<M, R> = mpsc::Sender<RegionMessage<M, R>>;

/// Creates local region handlers for partitions this node owns.
pub trait RegionFactory<M, R>: Send + Sync {
    fn create(&self, partition: u32) -> RegionSink<M, R>;
}

impl<M, R, F> RegionFactory<M, R> for F
where
    F: Fn(u32) -> RegionSink<M, R> + Send + Sync,
{
    fn create(&self, partition: u32) -> RegionSink<M, R> {
        self(partition)
    }
}

/// Logical address of a region on a peer node. Constructing one performs no
/// network call; delivery is the transport's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSelector {
    pub peer: HostPort,
    pub path: String,
}

impl RemoteSelector {
    pub fn new(peer: HostPort, partition: u32) -> Self {
        Self {
            peer,
            path: format!("shard-router/partition-{partition}"),
        }
    }
}

/// Failure delivering a forwarded command.
#[derive(Debug, Clone, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Delivers commands to peer routers and returns their replies.
#[async_trait]
pub trait RemoteTransport<M, R>: Send + Sync {
    async fn forward(
        &self,
        selector: &RemoteSelector,
        partition: u32,
        message: M,
    ) -> Result<R, TransportError>;
}

/// Where a region lives; the diagnostic view of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Local,
    Remote(HostPort),
}

/// Handle to the region responsible for one partition.
pub enum RegionHandle<M, R> {
    Local(RegionSink<M, R>),
    Remote(RemoteSelector),
}

impl<M, R> Clone for RegionHandle<M, R> {
    fn clone(&self) -> Self {
        match self {
            RegionHandle::Local(sink) => RegionHandle::Local(sink.clone()),
            RegionHandle::Remote(selector) => RegionHandle::Remote(selector.clone()),
        }
    }
}

impl<M, R> RegionHandle<M, R> {
    pub fn kind(&self) -> RegionKind {
        match self {
            RegionHandle::Local(_) => RegionKind::Local,
            RegionHandle::Remote(selector) => RegionKind::Remote(selector.peer.clone()),
        }
    }
}

/// One registered region.
pub struct PartitionRegion<M, R> {
    pub partition: u32,
    pub handle: RegionHandle<M, R>,
    pub assigned_since: Instant,
}

impl<M, R> PartitionRegion<M, R> {
    pub fn is_local(&self) -> bool {
        matches!(self.handle, RegionHandle::Local(_))
    }
}

/// Table of partition → region for this node.
pub struct PartitionRegistry<M, R> {
    regions: HashMap<u32, PartitionRegion<M, R>>,
}

impl<M, R> Default for PartitionRegistry<M, R> {
    fn default() -> Self {
        Self {
            regions: HashMap::new(),
        }
    }
}

impl<M, R> PartitionRegistry<M, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: u32) -> Option<&PartitionRegion<M, R>> {
        self.regions.get(&partition)
    }

    pub fn insert_local(&mut self, partition: u32, sink: RegionSink<M, R>) {
        self.regions.insert(
            partition,
            PartitionRegion {
                partition,
                handle: RegionHandle::Local(sink),
                assigned_since: Instant::now(),
            },
        );
    }

    pub fn insert_remote(&mut self, partition: u32, selector: RemoteSelector) {
        self.regions.insert(
            partition,
            PartitionRegion {
                partition,
                handle: RegionHandle::Remote(selector),
                assigned_since: Instant::now(),
            },
        );
    }

    /// Drop one region, returning its local sink if it had one so the
    /// caller can signal it to stop.
    pub fn remove(&mut self, partition: u32) -> Option<RegionSink<M, R>> {
        match self.regions.remove(&partition) {
            Some(PartitionRegion {
                handle: RegionHandle::Local(sink),
                ..
            }) => Some(sink),
            _ => None,
        }
    }

    /// Drop every local region, returning their sinks. Used when entering
    /// standby and on shutdown.
    pub fn evict_local(&mut self) -> Vec<(u32, RegionSink<M, R>)> {
        let local: Vec<u32> = self
            .regions
            .values()
            .filter(|r| r.is_local())
            .map(|r| r.partition)
            .collect();
        local
            .into_iter()
            .filter_map(|p| self.remove(p).map(|sink| (p, sink)))
            .collect()
    }

    pub fn local_partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self
            .regions
            .values()
            .filter(|r| r.is_local())
            .map(|r| r.partition)
            .collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self.regions.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    pub fn local_sinks(&self) -> Vec<(u32, RegionSink<M, R>)> {
        self.regions
            .values()
            .filter_map(|r| match &r.handle {
                RegionHandle::Local(sink) => Some((r.partition, sink.clone())),
                RegionHandle::Remote(_) => None,
            })
            .collect()
    }

    /// Diagnostic snapshot of the table.
    pub fn snapshot(&self) -> HashMap<u32, RegionKind> {
        self.regions
            .iter()
            .map(|(p, r)| (*p, r.handle.kind()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
