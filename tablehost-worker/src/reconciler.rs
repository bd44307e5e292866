/// Stalled provisioning reconciler
///
/// Provisioning attempts normally reach a terminal state on the task that
/// started them. When that process dies mid-saga the ledger row stays in a
/// non-terminal status; this loop finds such rows once they have been idle
/// for `stale_after` and hands them to [`Engine::reconcile`], which either
/// completes them or compensates.
///
/// # Architecture
///
/// ```text
/// Reconciler
///   ├─> Ledger: list non-terminal requests idle since now - stale_after
///   ├─> Engine::reconcile (concurrently, one per request)
///   │     └─> claim, then complete / fail / compensate
///   └─> sleep poll_interval (or stop on shutdown)
/// ```
///
/// Several workers can sweep at once: `reconcile` claims a row before
/// touching it and skips rows another sweeper already took.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tablehost_shared::provisioning::Engine;
/// use tablehost_worker::reconciler::{Reconciler, ReconcilerConfig};
///
/// # async fn example(engine: Arc<Engine>) -> anyhow::Result<()> {
/// let reconciler = Reconciler::new(engine, ReconcilerConfig::default());
/// let token = reconciler.shutdown_token();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     token.cancel();
/// });
/// reconciler.run().await?;
/// # Ok(())
/// # }
/// ```

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tablehost_shared::error::ProvisioningError;
use tablehost_shared::models::ProvisioningStatus;
use tablehost_shared::provisioning::Engine;
use tokio_util::sync::CancellationToken;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Pause between sweeps
    pub poll_interval: Duration,

    /// Maximum stalled requests handled per sweep
    pub batch_size: i64,

    /// Idle time after which a non-terminal request counts as stalled
    pub stale_after: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            stale_after: chrono::Duration::minutes(5),
        }
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stalled requests found
    pub found: usize,

    /// Requests driven to a terminal state, by status
    pub completed: usize,
    pub failed: usize,
    pub rolled_back: usize,

    /// Requests another sweeper claimed first, or that are still rolling back
    pub skipped: usize,

    /// Requests whose reconciliation returned an error
    pub errors: usize,
}

pub struct Reconciler {
    engine: Arc<Engine>,
    config: ReconcilerConfig,
    shutdown_token: CancellationToken,
}

impl Reconciler {
    pub fn new(engine: Arc<Engine>, config: ReconcilerConfig) -> Self {
        Reconciler {
            engine,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Gets shutdown token
    ///
    /// Cancelling it stops [`Reconciler::run`] after the current sweep.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Finds stalled requests and reconciles them concurrently
    pub async fn sweep(&self) -> Result<SweepReport, ProvisioningError> {
        let stale_before = Utc::now() - self.config.stale_after;
        let stalled = self
            .engine
            .ledger()
            .list_stalled(stale_before, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            found: stalled.len(),
            ..Default::default()
        };
        if stalled.is_empty() {
            return Ok(report);
        }

        tracing::info!(count = stalled.len(), "Reconciling stalled provisioning requests");

        let outcomes = join_all(
            stalled
                .iter()
                .map(|record| self.engine.reconcile(record, stale_before)),
        )
        .await;

        for (record, outcome) in stalled.iter().zip(outcomes) {
            match outcome {
                Ok(Some(ProvisioningStatus::Completed)) => report.completed += 1,
                Ok(Some(ProvisioningStatus::Failed)) => report.failed += 1,
                Ok(Some(ProvisioningStatus::RolledBack)) => report.rolled_back += 1,
                Ok(status) => {
                    tracing::debug!(
                        idempotency_key = %record.idempotency_key,
                        status = ?status,
                        "Stalled request left for a later sweep"
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(
                        request_id = %record.request_id,
                        idempotency_key = %record.idempotency_key,
                        error = %e,
                        "Failed to reconcile provisioning request"
                    );
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            found = report.found,
            completed = report.completed,
            failed = report.failed,
            rolled_back = report.rolled_back,
            skipped = report.skipped,
            errors = report.errors,
            "Sweep finished"
        );

        Ok(report)
    }

    /// Sweeps every `poll_interval` until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            stale_after_secs = self.config.stale_after.num_seconds(),
            "Reconciler starting"
        );

        loop {
            if self.shutdown_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Failed to list stalled provisioning requests");
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("Reconciler shut down");
        Ok(())
    }
}
