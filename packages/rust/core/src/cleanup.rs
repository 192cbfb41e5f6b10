//! Retention cleanup of failed jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_shared::{CleanupConfig, JobStatus, Result};
use outreach_storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Counts of what a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub jobs_deleted: usize,
    pub entities_deleted: u64,
    pub units_deleted: u64,
}

/// Delete FAILED jobs that finished more than `retention_days` before `now`,
/// together with their entities and outstanding work units.
///
/// Each job is removed in its own transaction, and only if it is still FAILED
/// at that point.
#[instrument(skip_all, fields(retention_days = retention_days))]
pub async fn run_cleanup(
    storage: &Storage,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<CleanupReport> {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let mut report = CleanupReport::default();

    for job_id in storage.expired_failed_jobs(cutoff).await? {
        let tx = storage.begin().await?;
        let still_failed = tx
            .get_job(&job_id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Failed);
        if !still_failed {
            debug!(job = %job_id, "job changed since scan, keeping it");
            continue;
        }

        let units = tx.delete_work_units_for_job(&job_id).await?;
        let entities = tx.delete_entities(&job_id).await?;
        if !tx.delete_job(&job_id, JobStatus::Failed).await? {
            continue;
        }
        tx.commit().await?;

        debug!(job = %job_id, entities, units, "expired job deleted");
        report.jobs_deleted += 1;
        report.entities_deleted += entities;
        report.units_deleted += units;
    }

    info!(
        jobs = report.jobs_deleted,
        entities = report.entities_deleted,
        units = report.units_deleted,
        "retention cleanup complete"
    );
    Ok(report)
}

/// Run [`run_cleanup`] on every interval tick until cancelled.
pub async fn run_cleanup_loop(
    storage: Arc<Storage>,
    config: CleanupConfig,
    shutdown: CancellationToken,
) {
    info!(
        interval_secs = config.interval.as_secs(),
        retention_days = config.retention_days,
        "retention cleanup starting"
    );
    let mut interval = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = run_cleanup(&storage, config.retention_days, Utc::now()).await {
                    error!(error = %e, "retention cleanup failed");
                }
            }
        }
    }
    info!("retention cleanup stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Harness, pipeline_config};
    use crate::workers::StageResult;
    use outreach_shared::{ScrapeResult, Stage};

    async fn failed_job(h: &Harness) -> outreach_shared::JobId {
        let (job, entities) = h
            .storage
            .create_job("owner", &["https://a.test".to_string()])
            .await
            .unwrap();
        h.dispatcher.start_job(&job.id).await.unwrap();
        h.dispatcher
            .advance(
                &entities[0].id,
                Stage::Scrape,
                StageResult::Scrape(ScrapeResult::failed("unsupported site")),
            )
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn deletes_only_expired_failed_jobs() {
        let h = Harness::new(pipeline_config()).await;
        let failed = failed_job(&h).await;
        let (running, _) = h
            .storage
            .create_job("owner", &["https://b.test".to_string()])
            .await
            .unwrap();
        h.dispatcher.start_job(&running.id).await.unwrap();

        // Within retention: kept
        let report = run_cleanup(&h.storage, 7, Utc::now()).await.unwrap();
        assert_eq!(report, CleanupReport::default());

        // Eight days later: the failed job and its rows go, the running one stays
        let later = Utc::now() + chrono::Duration::days(8);
        let report = run_cleanup(&h.storage, 7, later).await.unwrap();
        assert_eq!(report.jobs_deleted, 1);
        assert_eq!(report.entities_deleted, 1);
        assert_eq!(report.units_deleted, 1);
        assert!(h.storage.get_job(&failed).await.unwrap().is_none());
        assert!(h.storage.list_entities(&failed).await.unwrap().is_empty());
        assert!(h.storage.get_job(&running.id).await.unwrap().is_some());
        assert_eq!(h.queued(Stage::Scrape).await, 1);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let h = Harness::new(pipeline_config()).await;
        failed_job(&h).await;
        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(run_cleanup(&h.storage, 7, later).await.unwrap().jobs_deleted, 1);
        assert_eq!(run_cleanup(&h.storage, 7, later).await.unwrap(), CleanupReport::default());
    }
}
