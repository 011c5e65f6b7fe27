//! Replay coordination: stop the group, rewind, restart.
//!
//! The strategy itself (where to rewind, which offsets) is the caller's;
//! the coordinator only sequences stop → strategy → restart and bounds the
//! whole cycle with one timeout. On any failure it leaves the consumers
//! stopped rather than consuming from unrewound positions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{CoreError, CoreResult};
use crate::metrics;

/// User-supplied replay preparation, typically rewinding group offsets.
#[async_trait]
pub trait ReplayStrategy: Send + Sync {
    async fn prepare_replay(&self) -> CoreResult<()>;
}

/// Outcome of a replay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayResult {
    ReplaySuccessfullyStarted,
    ReplayFailed(String),
}

/// Sequences one stop → rewind → restart cycle.
pub struct ReplayCoordinator {
    strategy: Arc<dyn ReplayStrategy>,
    entire_replay_timeout: Duration,
}

impl ReplayCoordinator {
    pub fn new(strategy: Arc<dyn ReplayStrategy>, entire_replay_timeout: Duration) -> Self {
        Self {
            strategy,
            entire_replay_timeout,
        }
    }

    /// Run one replay cycle. `stop_all` must drain and release every
    /// consumer in the group; `restart_all` brings them back once the
    /// strategy has rewound.
    pub async fn run<S, SF, R, RF>(&self, stop_all: S, restart_all: R) -> ReplayResult
    where
        S: FnOnce() -> SF,
        SF: Future<Output = CoreResult<()>>,
        R: FnOnce() -> RF,
        RF: Future<Output = CoreResult<()>>,
    {
        let cycle = async {
            info!("Replay starting, stopping consumers");
            stop_all().await?;
            self.strategy.prepare_replay().await?;
            info!("Replay prepared, restarting consumers");
            restart_all().await?;
            Ok::<(), CoreError>(())
        };

        let outcome = match tokio::time::timeout(self.entire_replay_timeout, cycle).await {
            Ok(Ok(())) => ReplayResult::ReplaySuccessfullyStarted,
            Ok(Err(e)) => ReplayResult::ReplayFailed(e.to_string()),
            Err(_) => ReplayResult::ReplayFailed(format!(
                "replay did not complete within {:?}",
                self.entire_replay_timeout
            )),
        };

        match &outcome {
            ReplayResult::ReplaySuccessfullyStarted => {
                metrics::REPLAY_OPERATIONS
                    .with_label_values(&["started"])
                    .inc();
                info!("Replay successfully started");
            }
            ReplayResult::ReplayFailed(reason) => {
                metrics::REPLAY_OPERATIONS
                    .with_label_values(&["failed"])
                    .inc();
                error!(reason = %reason, "Replay failed, consumers left stopped");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct OkStrategy;

    #[async_trait]
    impl ReplayStrategy for OkStrategy {
        async fn prepare_replay(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    struct FailingStrategy;

    #[async_trait]
    impl ReplayStrategy for FailingStrategy {
        async fn prepare_replay(&self) -> CoreResult<()> {
            Err(CoreError::Replay("rewind rejected".into()))
        }
    }

    struct SlowStrategy;

    #[async_trait]
    impl ReplayStrategy for SlowStrategy {
        async fn prepare_replay(&self) -> CoreResult<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_cycle_runs_all_three_steps() {
        let coordinator =
            ReplayCoordinator::new(Arc::new(OkStrategy), Duration::from_secs(5));
        let stopped = AtomicBool::new(false);
        let restarted = AtomicBool::new(false);

        let result = coordinator
            .run(
                || async {
                    stopped.store(true, Ordering::SeqCst);
                    Ok(())
                },
                || async {
                    restarted.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;

        assert_eq!(result, ReplayResult::ReplaySuccessfullyStarted);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(restarted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn strategy_failure_leaves_consumers_stopped() {
        let coordinator =
            ReplayCoordinator::new(Arc::new(FailingStrategy), Duration::from_secs(5));
        let restarts = AtomicUsize::new(0);

        let result = coordinator
            .run(
                || async { Ok(()) },
                || async {
                    restarts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;

        match result {
            ReplayResult::ReplayFailed(reason) => assert!(reason.contains("rewind rejected")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_is_bounded_by_timeout() {
        let coordinator =
            ReplayCoordinator::new(Arc::new(SlowStrategy), Duration::from_secs(2));

        let result = coordinator
            .run(|| async { Ok(()) }, || async { Ok(()) })
            .await;

        match result {
            ReplayResult::ReplayFailed(reason) => assert!(reason.contains("did not complete")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_failure_skips_strategy() {
        struct PanickyStrategy;

        #[async_trait]
        impl ReplayStrategy for PanickyStrategy {
            async fn prepare_replay(&self) -> CoreResult<()> {
                panic!("strategy must not run when stop fails");
            }
        }

        let coordinator =
            ReplayCoordinator::new(Arc::new(PanickyStrategy), Duration::from_secs(5));
        let result = coordinator
            .run(
                || async { Err(CoreError::ConsumerFailure("drain failed".into())) },
                || async { Ok(()) },
            )
            .await;

        assert!(matches!(result, ReplayResult::ReplayFailed(_)));
    }
}
