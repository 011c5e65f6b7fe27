//! Shard router: resolves entity → partition → region and forwards commands.
//!
//! The router is a message-driven agent owning a [`PartitionRegistry`] and
//! the current [`PartitionAssignments`] snapshot. It moves through an
//! explicit phase machine:
//!
//! ```text
//! Uninitialized ──first assignments──▶ Active
//!       │                               ▲
//!       │ (dr_standby_enabled)          │ first routable command
//!       └──first assignments──▶ Standby ┘
//! ```
//!
//! Commands arriving before the first assignments snapshot are stashed and
//! drained verbatim, in order, on the transition out of `Uninitialized`.
//! Registration with the partition tracker is re-sent on a timer until the
//! first snapshot arrives, so the router survives tracker restarts.
//!
//! Local regions are created lazily on first demand, except for the
//! pre-warm pass when the router becomes `Active`, which amortizes region
//! startup latency across all currently-owned partitions. Terminated local
//! regions are pruned from the registry and recreated by the next command.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::HealthStatus;
use super::assignments::PartitionAssignments;
use super::registry::{
    PartitionRegistry, RegionFactory, RegionHandle, RegionKind, RegionMessage, RegionSink,
    RemoteSelector, RemoteTransport,
};
use super::tracker::PartitionTracker;
use crate::constants::{HEALTH_PROBE_TIMEOUT, MAILBOX_CAPACITY, REGISTRATION_RETRY_INTERVAL};
use crate::error::{CoreError, CoreResult};
use crate::log::Partitioner;
use crate::metrics;
use crate::types::{EntityKey, HostPort};

/// Extracts the entity id a message addresses. `None` means the message is
/// not routable and goes to dead letters.
pub trait EntityExtractor<M>: Send + Sync {
    fn entity_id(&self, message: &M) -> Option<EntityKey>;
}

impl<M, F> EntityExtractor<M> for F
where
    F: Fn(&M) -> Option<EntityKey> + Send + Sync,
{
    fn entity_id(&self, message: &M) -> Option<EntityKey> {
        self(message)
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The entity extractor returned nothing for this message.
    ExtractionFailed,
    /// The partitioner produced no partition for the entity id.
    NoPartition,
    /// The partition currently has no assignment (mid-rebalance).
    NoAssignment,
}

impl DeadLetterReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            DeadLetterReason::ExtractionFailed => "extraction_failed",
            DeadLetterReason::NoPartition => "no_partition",
            DeadLetterReason::NoAssignment => "no_assignment",
        }
    }
}

/// An unroutable message, preserved whole. The reply handle is kept alive
/// so the original sender observes its own ask-timeout rather than an
/// immediate error, matching how forwarded commands fail.
pub struct DeadLetter<M, R> {
    pub message: M,
    pub reply: oneshot::Sender<R>,
    pub reason: DeadLetterReason,
}

/// Router health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterHealth {
    pub status: HealthStatus,
    /// Whether the first assignments snapshot has arrived.
    pub tracker_up: bool,
    pub local_regions: usize,
    pub remote_regions: usize,
}

/// Router tuning; every field has a sensible default.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// This node's advertised identity, matched against assignment hosts.
    pub self_host: HostPort,
    /// Start passive: track assignments, create no local regions until a
    /// routable command arrives.
    pub dr_standby: bool,
    /// Topic whose assignments this router tracks.
    pub tracked_topic: String,
    pub registration_retry: Duration,
    pub health_probe_timeout: Duration,
}

impl RouterSettings {
    pub fn new(self_host: HostPort, tracked_topic: impl Into<String>) -> Self {
        Self {
            self_host,
            dr_standby: false,
            tracked_topic: tracked_topic.into(),
            registration_retry: REGISTRATION_RETRY_INTERVAL,
            health_probe_timeout: HEALTH_PROBE_TIMEOUT,
        }
    }

    pub fn with_dr_standby(mut self, enabled: bool) -> Self {
        self.dr_standby = enabled;
        self
    }
}

enum RouterMsg<M, R> {
    Route {
        message: M,
        reply: oneshot::Sender<R>,
    },
    Assignments(PartitionAssignments),
    GetRegionMap(oneshot::Sender<HashMap<u32, RegionKind>>),
    Health(oneshot::Sender<RouterHealth>),
    RegionTerminated(u32),
    Stop,
}

/// Router phase. The router never returns to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouterPhase {
    Uninitialized,
    Standby,
    Active,
}

/// Handle to a running shard router.
pub struct ShardRouter<M, R> {
    tx: mpsc::Sender<RouterMsg<M, R>>,
}

impl<M, R> Clone for ShardRouter<M, R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Everything a router needs besides its settings.
pub struct RouterDeps<M, R> {
    pub partitioner: Arc<dyn Partitioner>,
    pub extractor: Arc<dyn EntityExtractor<M>>,
    pub region_factory: Arc<dyn RegionFactory<M, R>>,
    pub transport: Arc<dyn RemoteTransport<M, R>>,
    pub tracker: Arc<dyn PartitionTracker>,
    /// Sink for unroutable messages. When absent they are dropped after
    /// logging.
    pub dead_letters: Option<mpsc::Sender<DeadLetter<M, R>>>,
}

impl<M: Send + 'static, R: Send + 'static> ShardRouter<M, R> {
    /// Spawn the router agent. It registers with the tracker immediately
    /// and buffers every command until the first assignments arrive.
    pub fn spawn(settings: RouterSettings, deps: RouterDeps<M, R>) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        // Assignments flow through a dedicated channel so the tracker never
        // blocks on a busy router mailbox.
        let (assign_tx, mut assign_rx) = mpsc::channel::<PartitionAssignments>(16);
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = assign_rx.recv().await {
                if forward_tx
                    .send(RouterMsg::Assignments(snapshot))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let registered = Arc::new(AtomicBool::new(false));
        deps.tracker.register(assign_tx.clone());
        {
            // Re-send the registration until the first snapshot lands.
            let registered = Arc::clone(&registered);
            let tracker = Arc::clone(&deps.tracker);
            let retry = settings.registration_retry;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(retry).await;
                    if registered.load(Ordering::SeqCst) || assign_tx.is_closed() {
                        break;
                    }
                    debug!("Re-sending tracker registration");
                    tracker.register(assign_tx.clone());
                }
            });
        }

        let worker = RouterWorker {
            settings,
            deps,
            mailbox_tx: tx.clone(),
            phase: RouterPhase::Uninitialized,
            assignments: None,
            registry: PartitionRegistry::new(),
            stash: VecDeque::new(),
            registered,
        };
        tokio::spawn(worker.run(rx));

        Self { tx }
    }

    /// Enqueue a command and return the receiver for the region's reply.
    /// The reply never arrives for dead-lettered messages; callers bound
    /// the wait themselves (or use [`ask`](Self::ask)).
    pub async fn route(&self, message: M) -> CoreResult<oneshot::Receiver<R>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouterMsg::Route {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoreError::NotRunning {
                component: "shard router",
            })?;
        Ok(reply_rx)
    }

    /// Route a command and await its reply, bounded by `deadline`.
    pub async fn ask(&self, message: M, deadline: Duration) -> CoreResult<R> {
        let reply = self.route(message).await?;
        match tokio::time::timeout(deadline, reply).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => Err(CoreError::Timeout {
                what: "routed command",
            }),
        }
    }

    /// Diagnostic read of the region table.
    pub async fn region_map(&self) -> CoreResult<HashMap<u32, RegionKind>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RouterMsg::GetRegionMap(tx))
            .await
            .map_err(|_| CoreError::NotRunning {
                component: "shard router",
            })?;
        rx.await.map_err(|_| CoreError::NotRunning {
            component: "shard router",
        })
    }

    /// UP when the tracker has reported assignments and every local region
    /// answers its probe within the health deadline.
    pub async fn health(&self) -> CoreResult<RouterHealth> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RouterMsg::Health(tx))
            .await
            .map_err(|_| CoreError::NotRunning {
                component: "shard router",
            })?;
        rx.await.map_err(|_| CoreError::NotRunning {
            component: "shard router",
        })
    }

    /// Stop the router, signalling every local region.
    pub async fn stop(&self) {
        let _ = self.tx.send(RouterMsg::Stop).await;
    }
}

struct RouterWorker<M, R> {
    settings: RouterSettings,
    deps: RouterDeps<M, R>,
    mailbox_tx: mpsc::Sender<RouterMsg<M, R>>,
    phase: RouterPhase,
    assignments: Option<PartitionAssignments>,
    registry: PartitionRegistry<M, R>,
    stash: VecDeque<RouterMsg<M, R>>,
    registered: Arc<AtomicBool>,
}

impl<M: Send + 'static, R: Send + 'static> RouterWorker<M, R> {
    async fn run(mut self, mut rx: mpsc::Receiver<RouterMsg<M, R>>) {
        info!(
            host = %self.settings.self_host,
            topic = %self.settings.tracked_topic,
            dr_standby = self.settings.dr_standby,
            "Shard router starting"
        );

        while let Some(msg) = rx.recv().await {
            match msg {
                RouterMsg::Route { message, reply } => match self.phase {
                    RouterPhase::Uninitialized => {
                        debug!("Stashing command until first assignments arrive");
                        self.stash.push_back(RouterMsg::Route { message, reply });
                    }
                    RouterPhase::Standby => {
                        info!("First routable command received, leaving standby");
                        self.phase = RouterPhase::Active;
                        self.prewarm_local_regions();
                        self.deliver(message, reply).await;
                    }
                    RouterPhase::Active => self.deliver(message, reply).await,
                },
                RouterMsg::Assignments(snapshot) => self.apply_assignments(snapshot).await,
                RouterMsg::GetRegionMap(reply) => {
                    let _ = reply.send(self.registry.snapshot());
                }
                RouterMsg::Health(reply) => self.answer_health(reply),
                RouterMsg::RegionTerminated(partition) => {
                    if self.registry.remove(partition).is_some() {
                        warn!(partition, "Local region terminated, removed from registry");
                    }
                }
                RouterMsg::Stop => break,
            }
        }

        for (partition, sink) in self.registry.evict_local() {
            debug!(partition, "Signalling local region to stop");
            let _ = sink.try_send(RegionMessage::Stop);
        }
        info!("Shard router stopped");
    }

    async fn apply_assignments(&mut self, snapshot: PartitionAssignments) {
        let previous = self
            .assignments
            .take()
            .unwrap_or_else(|| PartitionAssignments::empty(&self.settings.tracked_topic));
        let diff = snapshot.diff(&previous);
        if !diff.is_empty() {
            info!(
                added = diff.added.values().map(|s| s.len()).sum::<usize>(),
                revoked = diff.revoked.values().map(|s| s.len()).sum::<usize>(),
                "Applying assignment update"
            );
        }

        // Drop every region the new snapshot no longer supports, stopping
        // local ones. The surviving set is a subset of the new assignments.
        for partition in self.registry.partitions() {
            let region_is_local = self
                .registry
                .get(partition)
                .map(|r| r.is_local())
                .unwrap_or(false);
            let keep = match snapshot.owner_of(partition) {
                Some(owner) if owner == &self.settings.self_host => region_is_local,
                Some(owner) => match self.registry.get(partition) {
                    Some(region) => match &region.handle {
                        RegionHandle::Remote(selector) => &selector.peer == owner,
                        RegionHandle::Local(_) => false,
                    },
                    None => false,
                },
                None => false,
            };
            if !keep {
                if let Some(sink) = self.registry.remove(partition) {
                    debug!(partition, "Stopping revoked local region");
                    let _ = sink.try_send(RegionMessage::Stop);
                }
            }
        }

        self.assignments = Some(snapshot);
        self.registered.store(true, Ordering::SeqCst);

        if self.phase == RouterPhase::Uninitialized {
            self.phase = if self.settings.dr_standby {
                info!("First assignments received, entering standby");
                RouterPhase::Standby
            } else {
                info!("First assignments received, entering active");
                RouterPhase::Active
            };
            if self.phase == RouterPhase::Active {
                self.prewarm_local_regions();
            }
            // Drain the stash in arrival order, straight through delivery so
            // nothing arriving later can overtake a stashed command. A
            // stashed command counts as the routable command that ends
            // standby.
            let stashed: Vec<RouterMsg<M, R>> = self.stash.drain(..).collect();
            for msg in stashed {
                if let RouterMsg::Route { message, reply } = msg {
                    if self.phase == RouterPhase::Standby {
                        info!("Stashed command ends standby");
                        self.phase = RouterPhase::Active;
                        self.prewarm_local_regions();
                    }
                    self.deliver(message, reply).await;
                }
            }
        }
    }

    /// Create a local region for every owned partition that lacks one.
    /// Only runs on the transition into `Active`; later additions are
    /// created lazily on first demand.
    fn prewarm_local_regions(&mut self) {
        let Some(assignments) = &self.assignments else {
            return;
        };
        let owned = assignments.partitions_for(&self.settings.self_host);
        for partition in owned {
            if self.registry.get(partition).is_none() {
                self.create_local_region(partition);
            }
        }
    }

    fn create_local_region(&mut self, partition: u32) {
        let sink = self.deps.region_factory.create(partition);
        self.watch_termination(partition, sink.clone());
        self.registry.insert_local(partition, sink);
        debug!(partition, "Created local region");
    }

    fn watch_termination(&self, partition: u32, sink: RegionSink<M, R>) {
        let mailbox = self.mailbox_tx.clone();
        tokio::spawn(async move {
            sink.closed().await;
            let _ = mailbox.send(RouterMsg::RegionTerminated(partition)).await;
        });
    }

    /// Resolve (or create) the region for a partition. `None` means the
    /// partition has no assignment right now.
    fn region_for(&mut self, partition: u32) -> Option<RegionHandle<M, R>> {
        if let Some(region) = self.registry.get(partition) {
            return Some(region.handle.clone());
        }
        let owner = self.assignments.as_ref()?.owner_of(partition)?.clone();
        if owner == self.settings.self_host {
            self.create_local_region(partition);
        } else {
            self.registry
                .insert_remote(partition, RemoteSelector::new(owner, partition));
        }
        self.registry.get(partition).map(|r| r.handle.clone())
    }

    async fn deliver(&mut self, message: M, reply: oneshot::Sender<R>) {
        let Some(entity_id) = self.deps.extractor.entity_id(&message) else {
            warn!(
                message_class = std::any::type_name::<M>(),
                "Entity extraction failed, dead-lettering"
            );
            self.dead_letter(message, reply, DeadLetterReason::ExtractionFailed);
            return;
        };
        let Some(partition) = self.deps.partitioner.partition_for(&entity_id) else {
            warn!(
                message_class = std::any::type_name::<M>(),
                entity_id = %entity_id,
                "Partitioner produced no partition, dropping message"
            );
            self.dead_letter(message, reply, DeadLetterReason::NoPartition);
            return;
        };
        let Some(handle) = self.region_for(partition) else {
            warn!(
                partition,
                entity_id = %entity_id,
                "Partition has no assignment, dead-lettering"
            );
            self.dead_letter(message, reply, DeadLetterReason::NoAssignment);
            return;
        };

        match handle {
            RegionHandle::Local(sink) => {
                metrics::ROUTED_COMMANDS.with_label_values(&["local"]).inc();
                if let Err(send_err) = sink
                    .send(RegionMessage::Command {
                        partition,
                        message,
                        reply,
                    })
                    .await
                {
                    // The region died between lookup and delivery. Recreate
                    // once; the command is not lost.
                    warn!(partition, "Local region gone, recreating");
                    self.registry.remove(partition);
                    self.create_local_region(partition);
                    if let (
                        Some(region),
                        RegionMessage::Command {
                            partition,
                            message,
                            reply,
                        },
                    ) = (self.registry.get(partition), send_err.0)
                    {
                        if let RegionHandle::Local(fresh) = region.handle.clone() {
                            let _ = fresh
                                .send(RegionMessage::Command {
                                    partition,
                                    message,
                                    reply,
                                })
                                .await;
                        }
                    }
                }
            }
            RegionHandle::Remote(selector) => {
                metrics::ROUTED_COMMANDS.with_label_values(&["remote"]).inc();
                let transport = Arc::clone(&self.deps.transport);
                tokio::spawn(async move {
                    match transport.forward(&selector, partition, message).await {
                        Ok(response) => {
                            let _ = reply.send(response);
                        }
                        Err(e) => {
                            // The original sender observes its own timeout;
                            // no synthetic reply is manufactured here.
                            error!(
                                partition,
                                entity_id = %entity_id,
                                peer = %selector.peer,
                                error = %e,
                                "Forwarded command failed"
                            );
                        }
                    }
                });
            }
        }
    }

    fn dead_letter(&self, message: M, reply: oneshot::Sender<R>, reason: DeadLetterReason) {
        metrics::DEAD_LETTERS
            .with_label_values(&[reason.as_label()])
            .inc();
        if let Some(sink) = &self.deps.dead_letters {
            let _ = sink.try_send(DeadLetter {
                message,
                reply,
                reason,
            });
        }
    }

    fn answer_health(&self, reply: oneshot::Sender<RouterHealth>) {
        let tracker_up = self.registered.load(Ordering::SeqCst);
        let local = self.registry.local_sinks();
        let local_regions = local.len();
        let remote_regions = self.registry.len() - local_regions;
        let probe_timeout = self.settings.health_probe_timeout;

        // Probes run off the router loop so a slow region cannot stall
        // routing.
        tokio::spawn(async move {
            let mut all_up = tracker_up;
            if all_up {
                for (partition, sink) in local {
                    let (probe_tx, probe_rx) = oneshot::channel();
                    let sent = sink
                        .send(RegionMessage::HealthProbe { reply: probe_tx })
                        .await
                        .is_ok();
                    let up = sent
                        && matches!(
                            tokio::time::timeout(probe_timeout, probe_rx).await,
                            Ok(Ok(true))
                        );
                    if !up {
                        warn!(partition, "Local region failed health probe");
                        all_up = false;
                        break;
                    }
                }
            }
            let _ = reply.send(RouterHealth {
                status: if all_up {
                    HealthStatus::Up
                } else {
                    HealthStatus::Down
                },
                tracker_up,
                local_regions,
                remote_regions,
            });
        });
    }
}
