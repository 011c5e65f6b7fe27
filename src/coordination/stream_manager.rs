//! Consumed-stream manager: lifecycle of the committable consumer pipeline.
//!
//! The manager is a message-driven agent with three phases:
//!
//! ```text
//! Stopped ──start──▶ Consuming ──stop──▶ Stopping ──drained──▶ Stopped
//! ```
//!
//! `stop` is accepted in every phase and is idempotent; requests arriving
//! during `Stopping` are stashed and replayed once the drain completes.
//!
//! While consuming, the pipeline task polls the consumer, runs each record
//! through the user-supplied business flow (bounded by the committer's
//! parallelism) and feeds the returned offsets to the committer, which
//! flushes by batch size and by interval. The pipeline runs under a
//! restart supervisor with bounded exponential backoff, so a consumer
//! failure never surfaces to callers. The committer is the sole
//! backpressure source: when commits lag, polling lags with them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::replay::{ReplayCoordinator, ReplayResult, ReplayStrategy};
use super::retry::{RestartBackoff, commit_policy};
use crate::config::{CommitterConfig, CoreConfig};
use crate::constants::{MAILBOX_CAPACITY, RESTART_BACKOFF_MAX};
use crate::error::{CoreError, CoreResult};
use crate::log::{
    CommittableConsumer, CommittableOffset, ConsumerError, ConsumerFactory, EventEnvelope,
};
use crate::metrics;

/// User-supplied business flow: consume one record, return the offset to
/// commit once its effect is durable.
#[async_trait]
pub trait EventFlow: Send + Sync {
    async fn process(&self, event: EventEnvelope) -> CommittableOffset;
}

enum StreamMsg {
    Start(oneshot::Sender<CoreResult<()>>),
    Stop(oneshot::Sender<()>),
    Metrics(oneshot::Sender<HashMap<String, f64>>),
    Replay(oneshot::Sender<ReplayResult>),
    PipelineExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerPhase {
    Stopped,
    Consuming,
    Stopping,
}

/// External collaborators of the stream manager.
pub struct StreamManagerDeps {
    pub consumer_factory: Arc<dyn ConsumerFactory>,
    pub flow: Arc<dyn EventFlow>,
    pub replay_strategy: Arc<dyn ReplayStrategy>,
}

/// Handle to the consumed-stream manager.
pub struct StreamManager {
    tx: mpsc::Sender<StreamMsg>,
}

impl Clone for StreamManager {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl StreamManager {
    pub fn spawn(config: &CoreConfig, deps: StreamManagerDeps) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = Self { tx: tx.clone() };

        let coordinator = Arc::new(ReplayCoordinator::new(
            Arc::clone(&deps.replay_strategy),
            config.replay.entire_replay_timeout,
        ));
        let worker = StreamWorker {
            committer: config.committer.clone(),
            consumer_properties: config.consumer_properties(),
            topic: config.events_topic.clone(),
            deps,
            coordinator,
            phase: ManagerPhase::Stopped,
            stash: VecDeque::new(),
            consumer: None,
            shutdown: None,
            supervisor: None,
            stop_waiters: Vec::new(),
            mailbox_tx: tx,
            handle: handle.clone(),
        };
        tokio::spawn(worker.run(rx));
        handle
    }

    /// Start consuming. Idempotent: starting a consuming manager is a
    /// no-op success.
    pub async fn start(&self) -> CoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StreamMsg::Start(reply_tx))
            .await
            .map_err(|_| CoreError::NotRunning {
                component: "stream manager",
            })?;
        reply_rx.await.map_err(|_| CoreError::NotRunning {
            component: "stream manager",
        })?
    }

    /// Stop consuming: drain in-progress records, commit their offsets,
    /// release the consumer. Idempotent; resolves once fully stopped.
    pub async fn stop(&self) -> CoreResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StreamMsg::Stop(reply_tx))
            .await
            .map_err(|_| CoreError::NotRunning {
                component: "stream manager",
            })?;
        reply_rx.await.map_err(|_| CoreError::NotRunning {
            component: "stream manager",
        })
    }

    /// Live metric snapshot from the underlying consumer. Empty when
    /// stopped.
    pub async fn metrics(&self) -> CoreResult<HashMap<String, f64>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StreamMsg::Metrics(reply_tx))
            .await
            .map_err(|_| CoreError::NotRunning {
                component: "stream manager",
            })?;
        reply_rx.await.map_err(|_| CoreError::NotRunning {
            component: "stream manager",
        })
    }

    /// Run one replay cycle: stop the group, run the replay strategy,
    /// restart. On failure the consumers are left stopped.
    pub async fn replay(&self) -> ReplayResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(StreamMsg::Replay(reply_tx)).await.is_err() {
            return ReplayResult::ReplayFailed("stream manager is not running".into());
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ReplayResult::ReplayFailed("stream manager is not running".into()))
    }
}

struct StreamWorker {
    committer: CommitterConfig,
    consumer_properties: HashMap<String, String>,
    topic: String,
    deps: StreamManagerDeps,
    coordinator: Arc<ReplayCoordinator>,
    phase: ManagerPhase,
    stash: VecDeque<StreamMsg>,
    consumer: Option<Arc<dyn CommittableConsumer>>,
    shutdown: Option<watch::Sender<bool>>,
    supervisor: Option<JoinHandle<()>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    mailbox_tx: mpsc::Sender<StreamMsg>,
    handle: StreamManager,
}

impl StreamWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<StreamMsg>) {
        info!(topic = %self.topic, "Stream manager starting");
        while let Some(msg) = rx.recv().await {
            match msg {
                StreamMsg::Start(reply) => match self.phase {
                    ManagerPhase::Stopped => {
                        self.start_pipeline();
                        let _ = reply.send(Ok(()));
                    }
                    ManagerPhase::Consuming => {
                        debug!("Start requested while consuming, no-op");
                        let _ = reply.send(Ok(()));
                    }
                    ManagerPhase::Stopping => self.stash.push_back(StreamMsg::Start(reply)),
                },
                StreamMsg::Stop(reply) => match self.phase {
                    ManagerPhase::Stopped => {
                        let _ = reply.send(());
                    }
                    ManagerPhase::Consuming => {
                        self.phase = ManagerPhase::Stopping;
                        self.stop_waiters.push(reply);
                        self.begin_drain();
                    }
                    ManagerPhase::Stopping => self.stop_waiters.push(reply),
                },
                StreamMsg::Metrics(reply) => match self.phase {
                    ManagerPhase::Consuming => {
                        let snapshot = self
                            .consumer
                            .as_ref()
                            .map(|c| c.metrics())
                            .unwrap_or_default();
                        let _ = reply.send(snapshot);
                    }
                    ManagerPhase::Stopped => {
                        let _ = reply.send(HashMap::new());
                    }
                    ManagerPhase::Stopping => self.stash.push_back(StreamMsg::Metrics(reply)),
                },
                StreamMsg::Replay(reply) => {
                    // The cycle drives this same agent through its handle,
                    // so it must run off the message loop.
                    let coordinator = Arc::clone(&self.coordinator);
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        let stop_handle = handle.clone();
                        let start_handle = handle.clone();
                        let result = coordinator
                            .run(
                                move || async move { stop_handle.stop().await },
                                move || async move { start_handle.start().await },
                            )
                            .await;
                        if matches!(result, ReplayResult::ReplayFailed(_)) {
                            // Leave the group stopped rather than consuming
                            // from unrewound positions.
                            let _ = handle.stop().await;
                        }
                        let _ = reply.send(result);
                    });
                }
                StreamMsg::PipelineExited => {
                    if self.phase == ManagerPhase::Stopping {
                        self.finish_stop().await;
                    }
                }
            }
        }
    }

    fn start_pipeline(&mut self) {
        let consumer = self.deps.consumer_factory.create(&self.consumer_properties);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise_pipeline(
            Arc::clone(&consumer),
            Arc::clone(&self.deps.flow),
            self.committer.clone(),
            self.topic.clone(),
            shutdown_rx,
        ));
        self.consumer = Some(consumer);
        self.shutdown = Some(shutdown_tx);
        self.supervisor = Some(supervisor);
        self.phase = ManagerPhase::Consuming;
        info!(topic = %self.topic, "Consumer pipeline started");
    }

    fn begin_drain(&mut self) {
        info!(topic = %self.topic, "Draining consumer pipeline");
        if let Some(shutdown) = &self.shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(supervisor) = self.supervisor.take() {
            let mailbox = self.mailbox_tx.clone();
            tokio::spawn(async move {
                let _ = supervisor.await;
                let _ = mailbox.send(StreamMsg::PipelineExited).await;
            });
        }
    }

    async fn finish_stop(&mut self) {
        self.consumer = None;
        self.shutdown = None;
        self.phase = ManagerPhase::Stopped;
        info!(topic = %self.topic, "Consumer pipeline stopped");
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        // Replay stashed requests in arrival order now that the phase is
        // settled.
        let stashed: Vec<StreamMsg> = self.stash.drain(..).collect();
        for msg in stashed {
            if self.mailbox_tx.send(msg).await.is_err() {
                break;
            }
        }
    }
}

enum PipelineExit {
    Drained,
    Failed(String),
}

/// Restart-on-failure wrapper around [`run_pipeline`].
async fn supervise_pipeline(
    consumer: Arc<dyn CommittableConsumer>,
    flow: Arc<dyn EventFlow>,
    committer: CommitterConfig,
    topic: String,
    shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RestartBackoff::default();
    loop {
        let started = Instant::now();
        match run_pipeline(
            Arc::clone(&consumer),
            Arc::clone(&flow),
            committer.clone(),
            shutdown.clone(),
        )
        .await
        {
            PipelineExit::Drained => break,
            PipelineExit::Failed(reason) => {
                metrics::CONSUMER_RESTARTS.with_label_values(&[&topic]).inc();
                if started.elapsed() > RESTART_BACKOFF_MAX {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                warn!(
                    topic = %topic,
                    error = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Consumer pipeline failed, restarting after backoff"
                );
                let mut shutdown_wait = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_wait.wait_for(|stop| *stop) => break,
                }
            }
        }
    }
}

/// One pipeline incarnation: poll, process, commit, until failure or drain.
async fn run_pipeline(
    consumer: Arc<dyn CommittableConsumer>,
    flow: Arc<dyn EventFlow>,
    committer: CommitterConfig,
    mut shutdown: watch::Receiver<bool>,
) -> PipelineExit {
    let mut batch: Vec<CommittableOffset> = Vec::new();
    let mut interval = tokio::time::interval(committer.max_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.reset();

    loop {
        let step = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => PipelineStep::Shutdown,
            _ = interval.tick() => PipelineStep::IntervalTick,
            polled = consumer.poll() => PipelineStep::Polled(polled),
        };

        match step {
            PipelineStep::Shutdown => {
                if !batch.is_empty() {
                    if let Err(e) = commit_with_retry(&consumer, std::mem::take(&mut batch)).await {
                        warn!(error = %e, "Final offset commit during drain failed");
                    }
                }
                return PipelineExit::Drained;
            }
            PipelineStep::IntervalTick => {
                if !batch.is_empty() {
                    if let Err(e) = commit_with_retry(&consumer, std::mem::take(&mut batch)).await {
                        return PipelineExit::Failed(e.to_string());
                    }
                }
            }
            PipelineStep::Polled(polled) => match polled {
                Ok(events) => {
                    if events.is_empty() {
                        continue;
                    }
                    let offsets: Vec<CommittableOffset> = futures::stream::iter(
                        events.into_iter().map(|event| {
                            let flow = Arc::clone(&flow);
                            async move { flow.process(event).await }
                        }),
                    )
                    .buffer_unordered(committer.parallelism)
                    .collect()
                    .await;
                    batch.extend(offsets);
                    if batch.len() >= committer.max_batch {
                        if let Err(e) = commit_with_retry(&consumer, std::mem::take(&mut batch)).await {
                            return PipelineExit::Failed(e.to_string());
                        }
                    }
                }
                Err(e) => return PipelineExit::Failed(e.to_string()),
            },
        }
    }
}

enum PipelineStep {
    Shutdown,
    IntervalTick,
    Polled(Result<Vec<EventEnvelope>, ConsumerError>),
}

async fn commit_with_retry(
    consumer: &Arc<dyn CommittableConsumer>,
    offsets: Vec<CommittableOffset>,
) -> Result<(), ConsumerError> {
    let attempt = || {
        let offsets = offsets.clone();
        async move { consumer.commit(offsets).await }
    };
    attempt.retry(commit_policy()).await
}
