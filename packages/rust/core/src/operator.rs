//! Operator API: batch intake, status reporting and manual overrides.

use std::sync::Arc;

use outreach_shared::{Entity, EntityId, Job, JobId, JobStatus, OutreachError, Result, Stage};
use serde::Serialize;
use tracing::{info, instrument};

use crate::dispatcher::{Dispatcher, Fill};
use crate::queue::WorkQueue;
use crate::state::{self, Phase};

/// Per-phase entity counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub pending: u32,
    pub in_progress: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl StageCounts {
    fn add(&mut self, phase: Phase) {
        match phase {
            Phase::Pending => self.pending += 1,
            Phase::InProgress => self.in_progress += 1,
            Phase::Succeeded => self.succeeded += 1,
            Phase::Failed => self.failed += 1,
            Phase::Skipped => self.skipped += 1,
        }
    }

    /// Entities whose stage reached a terminal state.
    pub fn finished(&self) -> u32 {
        self.succeeded + self.failed + self.skipped
    }
}

/// A job with its entities and a per-stage breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: Job,
    pub scrape: StageCounts,
    pub message: StageCounts,
    pub submit: StageCounts,
    pub entities: Vec<Entity>,
}

impl JobReport {
    fn new(job: Job, entities: Vec<Entity>) -> Self {
        let mut counts = [StageCounts::default(); 3];
        for entity in &entities {
            for (slot, stage) in counts.iter_mut().zip(Stage::ALL) {
                slot.add(state::phase(entity, stage));
            }
        }
        let [scrape, message, submit] = counts;
        Self {
            job,
            scrape,
            message,
            submit,
            entities,
        }
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        match stage {
            Stage::Scrape => self.scrape,
            Stage::Message => self.message,
            Stage::Submit => self.submit,
        }
    }
}

pub struct Operator<Q: WorkQueue> {
    dispatcher: Arc<Dispatcher<Q>>,
}

impl<Q: WorkQueue> Operator<Q> {
    pub fn new(dispatcher: Arc<Dispatcher<Q>>) -> Self {
        Self { dispatcher }
    }

    /// Create a job with one entity per URL, started unless `start` is false.
    /// A held job stays PENDING until [`Operator::start_pending`] or a
    /// trigger picks it up.
    ///
    /// Blank entries are dropped; an empty batch is rejected.
    #[instrument(skip_all, fields(owner = %owner_id))]
    pub async fn submit_batch(&self, owner_id: &str, urls: &[String], start: bool) -> Result<Job> {
        let urls: Vec<String> = urls
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            return Err(OutreachError::validation("batch contains no URLs"));
        }

        let storage = self.dispatcher.storage();
        let (job, _) = storage.create_job(owner_id, &urls).await?;
        info!(job = %job.id, entities = urls.len(), start, "batch submitted");
        if start {
            self.dispatcher.start_job(&job.id).await?;
        }

        storage
            .get_job(&job.id)
            .await?
            .ok_or_else(|| OutreachError::not_found("job", &job.id))
    }

    /// Start every PENDING job. Returns how many were started.
    pub async fn start_pending(&self) -> Result<usize> {
        let pending = self
            .dispatcher
            .storage()
            .list_jobs(Some(JobStatus::Pending), u32::MAX)
            .await?;
        let mut started = 0;
        for job in pending {
            if self.dispatcher.start_job(&job.id).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    pub async fn get_status(&self, job_id: &JobId) -> Result<JobReport> {
        let storage = self.dispatcher.storage();
        let job = storage
            .get_job(job_id)
            .await?
            .ok_or_else(|| OutreachError::not_found("job", job_id))?;
        let entities = storage.list_entities(job_id).await?;
        Ok(JobReport::new(job, entities))
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>> {
        self.dispatcher.storage().list_jobs(status, limit).await
    }

    pub async fn trigger_stage(&self, job_id: &JobId, stage: Stage) -> Result<usize> {
        self.dispatcher.trigger_stage(job_id, stage).await
    }

    /// PENDING or PROCESSING → CANCELLED. Units already queued still run and
    /// their results apply; nothing new is dispatched.
    ///
    /// Returns `false` if the job had already finished.
    #[instrument(skip_all, fields(job = %job_id))]
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool> {
        let tx = self.dispatcher.storage().begin().await?;
        if tx.get_job(job_id).await?.is_none() {
            return Err(OutreachError::not_found("job", job_id));
        }
        let cancelled = tx
            .set_job_status(
                job_id,
                &[JobStatus::Pending, JobStatus::Processing],
                JobStatus::Cancelled,
            )
            .await?;
        tx.commit().await?;

        if cancelled {
            info!("job cancelled");
        }
        Ok(cancelled)
    }

    /// Put `from_stage` and every later stage of an entity back to PENDING
    /// and dispatch it again. A finished job is reopened.
    ///
    /// Returns the number of units dispatched.
    #[instrument(skip_all, fields(entity = %entity_id, from = %from_stage))]
    pub async fn reset_entity(&self, entity_id: &EntityId, from_stage: Stage) -> Result<usize> {
        let tx = self.dispatcher.storage().begin().await?;
        let entity = tx
            .get_entity(entity_id)
            .await?
            .ok_or_else(|| OutreachError::not_found("entity", entity_id))?;
        let job = tx
            .get_job(&entity.job_id)
            .await?
            .ok_or_else(|| OutreachError::not_found("job", &entity.job_id))?;
        if job.status == JobStatus::Cancelled {
            return Err(OutreachError::validation(format!(
                "job {} is cancelled",
                job.id
            )));
        }

        tx.reset_stages(entity_id, from_stage).await?;
        let dropped = tx.delete_work_units_for_entity(entity_id).await?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            tx.set_job_status(&job.id, &[job.status], JobStatus::Processing)
                .await?;
            info!(job = %job.id, previous = %job.status, "job reopened");
        }

        let dispatched = self.dispatcher.dispatch_ready(&tx, &job.id, Fill::ALL).await?;
        self.dispatcher.settle_job(&tx, &job.id).await?;
        tx.commit().await?;

        info!(dropped_units = dropped, dispatched, "entity reset");
        Ok(dispatched)
    }
}
