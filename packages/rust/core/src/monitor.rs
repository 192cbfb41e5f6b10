//! Stuck-process monitor.
//!
//! A periodic sweep over PROCESSING jobs that made no progress within the
//! staleness threshold. For each, it re-derives per entity what is in flight
//! or pending from status fields alone, re-enqueues only that, and leaves
//! terminal stages untouched. Every write is compare-and-set, so the sweep is
//! idempotent and may race with itself or with live workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_shared::{JobStatus, MonitorConfig, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::{Dispatcher, Fill};
use crate::queue::{WorkQueue, WorkUnit};
use crate::state;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale PROCESSING jobs found.
    pub jobs_restarted: usize,
    /// Stalled in-progress stages re-enqueued.
    pub stages_restarted: usize,
    /// Stalled stages failed for good after the last allowed retry.
    pub stages_failed: usize,
    /// Pending stages that had lost their dispatch and were started.
    pub units_dispatched: usize,
    /// Jobs that turned out to have nothing left in flight.
    pub jobs_finalized: usize,
}

pub struct Monitor<Q: WorkQueue> {
    dispatcher: Arc<Dispatcher<Q>>,
    config: MonitorConfig,
}

impl<Q: WorkQueue> Monitor<Q> {
    pub fn new(dispatcher: Arc<Dispatcher<Q>>, config: MonitorConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Sweep on every interval tick until cancelled. The first tick fires
    /// immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.config.interval.as_secs(), "monitor starting");
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "monitor sweep failed");
                    }
                }
            }
        }
        info!("monitor stopped");
    }

    /// One pass over jobs whose last progress is older than the threshold
    /// as seen from `now`.
    #[instrument(skip_all)]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::zero());
        let cutoff = now - stale_after;
        let storage = self.dispatcher.storage();
        let mut report = SweepReport::default();

        for job in storage.stale_jobs(cutoff).await? {
            let tx = storage.begin().await?;
            // Re-check under the write lock: another sweep or a result may
            // have moved the job since the scan.
            let Some(current) = tx.get_job(&job.id).await? else {
                continue;
            };
            if current.status != JobStatus::Processing || current.updated_at != job.updated_at {
                debug!(job = %job.id, "job moved since scan, skipping");
                continue;
            }
            info!(job = %job.id, last_progress = %current.updated_at, "restarting stale job");
            report.jobs_restarted += 1;

            for entity in tx.list_entities(&job.id).await? {
                let Some(stage) = state::in_flight_stage(&entity) else {
                    continue;
                };
                if entity.last_attempt_at.is_some_and(|t| t >= cutoff) {
                    continue;
                }
                let Some(retries) = tx.bump_retry(&entity.id, stage, Some(cutoff)).await? else {
                    continue;
                };

                if retries >= self.config.max_retries {
                    let reason = format!("{stage} stalled {retries} times");
                    tx.fail_stage(&entity.id, stage, &reason).await?;
                    warn!(entity = %entity.id, %stage, retries, "stalled stage failed");
                    report.stages_failed += 1;
                    continue;
                }

                let message_type = &self.dispatcher.config().message_type;
                match WorkUnit::for_entity(&entity, stage, message_type) {
                    Ok(unit) => {
                        self.dispatcher.queue().publish(&tx, &unit).await?;
                        info!(entity = %entity.id, %stage, retries, "stalled stage re-enqueued");
                        report.stages_restarted += 1;
                    }
                    Err(rejection) => {
                        tx.fail_stage(&entity.id, stage, &rejection.to_string())
                            .await?;
                        warn!(entity = %entity.id, %stage, %rejection, "stalled stage cannot be rebuilt");
                        report.stages_failed += 1;
                    }
                }
            }

            let fill = Fill {
                limit: self.dispatcher.config().dispatch_batch_size,
                ..Fill::ALL
            };
            report.units_dispatched += self.dispatcher.dispatch_ready(&tx, &job.id, fill).await?;
            if self.dispatcher.settle_job(&tx, &job.id).await?.is_some() {
                report.jobs_finalized += 1;
            }
            tx.commit().await?;
        }

        if report.jobs_restarted > 0 {
            info!(
                jobs = report.jobs_restarted,
                restarted = report.stages_restarted,
                failed = report.stages_failed,
                dispatched = report.units_dispatched,
                finalized = report.jobs_finalized,
                "monitor sweep complete"
            );
        }
        Ok(report)
    }
}
