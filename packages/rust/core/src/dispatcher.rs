//! Applies stage results and moves entities and jobs forward.
//!
//! Every method runs in one store transaction: the terminal write for the
//! finished stage, the in-progress mark for the next one, the published unit
//! and the recomputed job aggregates commit together. A result whose
//! compare-and-set matches no row is a duplicate delivery and changes nothing.

use std::sync::Arc;

use outreach_shared::{
    Entity, EntityId, JobId, JobStatus, MessageDispatch, MessageResult, MessageStatus, OutreachError,
    PipelineConfig, Result, ScrapingStatus, Stage,
};
use outreach_storage::{Storage, StoreTx};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::queue::{WorkQueue, WorkUnit};
use crate::state::{self, Phase};
use crate::workers::StageResult;

const NO_COMPANY_NAME: &str = "no usable company name";

/// What `advance()` did with a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The result was recorded; `dispatched` units were started as a consequence.
    Applied { dispatched: usize },
    /// The stage had already left its in-progress state (redelivery).
    Duplicate,
    /// The result does not fit the entity's state. Logged, never retried.
    Rejected(String),
}

/// Which pending stages a dispatch pass may start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fill {
    /// Start message generation even while scrapes are still running.
    pub force_messages: bool,
    pub only: Option<Stage>,
    /// Upper bound on units started in this pass.
    pub limit: usize,
}

impl Fill {
    pub(crate) const ALL: Fill = Fill {
        force_messages: false,
        only: None,
        limit: usize::MAX,
    };
}

/// Advances entities through their stages and derives job status.
pub struct Dispatcher<Q: WorkQueue> {
    storage: Arc<Storage>,
    queue: Arc<Q>,
    config: PipelineConfig,
}

impl<Q: WorkQueue> Dispatcher<Q> {
    pub fn new(storage: Arc<Storage>, queue: Arc<Q>, config: PipelineConfig) -> Self {
        Self {
            storage,
            queue,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// PENDING → PROCESSING and enqueue the first window of scrape units.
    ///
    /// Returns `false` if the job was not PENDING.
    #[instrument(skip_all, fields(job = %job_id))]
    pub async fn start_job(&self, job_id: &JobId) -> Result<bool> {
        let tx = self.storage.begin().await?;
        if !tx
            .set_job_status(job_id, &[JobStatus::Pending], JobStatus::Processing)
            .await?
        {
            debug!("job is not pending, not starting");
            return Ok(false);
        }
        let started = self.dispatch_ready(&tx, job_id, Fill::ALL).await?;
        let finished = self.settle_job(&tx, job_id).await?;
        tx.commit().await?;

        info!(units = started, "job started");
        if let Some(status) = finished {
            info!(%status, "job finished without dispatching");
        }
        Ok(true)
    }

    /// Record a worker's final result for `(entity_id, stage)`.
    #[instrument(skip_all, fields(entity = %entity_id, stage = %stage))]
    pub async fn advance(
        &self,
        entity_id: &EntityId,
        stage: Stage,
        result: StageResult,
    ) -> Result<Advance> {
        if result.stage() != stage {
            let reason = format!("{} result delivered for {stage} stage", result.stage());
            warn!(%reason, "rejected result");
            return Ok(Advance::Rejected(reason));
        }

        let tx = self.storage.begin().await?;
        let Some(entity) = tx.get_entity(entity_id).await? else {
            warn!("result for unknown entity");
            return Ok(Advance::Rejected("unknown entity".into()));
        };
        match state::phase(&entity, stage) {
            Phase::InProgress => {}
            Phase::Pending => {
                let reason = format!("{stage} stage was never started");
                warn!(%reason, "rejected result");
                return Ok(Advance::Rejected(reason));
            }
            _ => {
                debug!("stage already terminal, duplicate result");
                return Ok(Advance::Duplicate);
            }
        }

        let success = result.is_success();
        let applied = match result {
            StageResult::Scrape(mut r) => {
                r.has_contact_form &= r.contact_form.is_some();
                tx.complete_scrape(entity_id, &r).await?
            }
            StageResult::Message(r) => {
                let blank = r.status == MessageStatus::Generated
                    && r.message.as_deref().is_none_or(|m| m.trim().is_empty());
                let r = if blank {
                    MessageResult::failed("generator returned an empty message")
                } else {
                    r
                };
                tx.complete_message(entity_id, &r).await?
            }
            StageResult::Submit(r) => tx.complete_submission(entity_id, &r).await?,
        };
        if !applied {
            debug!("compare-and-set matched nothing, duplicate result");
            return Ok(Advance::Duplicate);
        }

        let dispatched = self.dispatch_ready(&tx, &entity.job_id, Fill::ALL).await?;
        let finished = self.settle_job(&tx, &entity.job_id).await?;
        tx.commit().await?;

        info!(job = %entity.job_id, success, dispatched, "stage result applied");
        if let Some(status) = finished {
            info!(job = %entity.job_id, %status, "job finished");
        }
        Ok(Advance::Applied { dispatched })
    }

    /// Count a failed attempt of an in-progress stage.
    ///
    /// Returns the persisted count, or `None` if the stage already moved on.
    pub async fn record_attempt(&self, entity_id: &EntityId, stage: Stage) -> Result<Option<u32>> {
        let tx = self.storage.begin().await?;
        let count = tx.bump_retry(entity_id, stage, None).await?;
        tx.commit().await?;
        Ok(count)
    }

    /// Operator override: start every eligible entity's `stage` now.
    ///
    /// A PENDING job is started first. For the message stage this ignores
    /// whether scraping is still running, but stays within the batch window.
    /// Terminal or cancelled jobs are left alone.
    #[instrument(skip_all, fields(job = %job_id, stage = %stage))]
    pub async fn trigger_stage(&self, job_id: &JobId, stage: Stage) -> Result<usize> {
        let tx = self.storage.begin().await?;
        let job = tx
            .get_job(job_id)
            .await?
            .ok_or_else(|| OutreachError::not_found("job", job_id))?;
        match job.status {
            JobStatus::Pending => {
                tx.set_job_status(job_id, &[JobStatus::Pending], JobStatus::Processing)
                    .await?;
            }
            JobStatus::Processing => {}
            status => {
                info!(%status, "job is not running, nothing to trigger");
                return Ok(0);
            }
        }

        let fill = Fill {
            force_messages: stage == Stage::Message,
            only: Some(stage),
            limit: usize::MAX,
        };
        let started = self.dispatch_ready(&tx, job_id, fill).await?;
        self.settle_job(&tx, job_id).await?;
        tx.commit().await?;

        info!(units = started, "stage triggered");
        Ok(started)
    }

    // -----------------------------------------------------------------------
    // Transaction-scoped helpers (shared with the monitor and operator API)
    // -----------------------------------------------------------------------

    /// Start eligible pending stages of a job's entities.
    ///
    /// Nothing is started unless the job is PROCESSING. Each stage has its own
    /// batch window: at most `dispatch_batch_size` of the job's entities are
    /// in that stage's in-progress state at once, and finished units free
    /// their slot for the next pass. Message generation also waits until
    /// every scrape is terminal (unless dispatch is immediate or forced).
    pub(crate) async fn dispatch_ready(
        &self,
        tx: &StoreTx,
        job_id: &JobId,
        fill: Fill,
    ) -> Result<usize> {
        let Some(job) = tx.get_job(job_id).await? else {
            return Ok(0);
        };
        if job.status != JobStatus::Processing {
            debug!(job = %job_id, status = %job.status, "job not accepting work");
            return Ok(0);
        }

        let entities = tx.list_entities(job_id).await?;
        let scraping_open = entities.iter().any(|e| {
            matches!(
                e.scraping_status,
                ScrapingStatus::Pending | ScrapingStatus::InProgress
            )
        });
        let messages_open = fill.force_messages
            || self.config.message_dispatch == MessageDispatch::Immediate
            || !scraping_open;
        let mut windows = Stage::ALL.map(|stage| {
            let busy = entities
                .iter()
                .filter(|e| state::phase(e, stage) == Phase::InProgress)
                .count();
            self.config.dispatch_batch_size.saturating_sub(busy)
        });
        let mut started = 0;

        for entity in &entities {
            if started >= fill.limit {
                break;
            }
            let Some(stage) = state::pending_stage(entity) else {
                continue;
            };
            if fill.only.is_some_and(|only| only != stage) {
                continue;
            }
            match stage {
                Stage::Message if !messages_open => continue,
                Stage::Message if entity.usable_company_name().is_none() => {
                    tx.fail_stage(&entity.id, Stage::Message, NO_COMPANY_NAME)
                        .await?;
                    info!(entity = %entity.id, reason = NO_COMPANY_NAME, "message stage failed");
                    continue;
                }
                Stage::Submit if !entity.has_contact_form => {
                    tx.close_without_form(&entity.id).await?;
                    debug!(entity = %entity.id, "no contact form, closed without submitting");
                    continue;
                }
                _ => {}
            }
            let window = &mut windows[stage as usize];
            if *window == 0 {
                continue;
            }
            if self.start_stage(tx, entity, stage).await? {
                started += 1;
                *window -= 1;
            }
        }
        Ok(started)
    }

    /// Mark `stage` in progress and publish its unit, if preconditions hold.
    async fn start_stage(
        &self,
        tx: &StoreTx,
        entity: &Entity,
        stage: Stage,
    ) -> Result<bool> {
        if let Err(rejection) = state::check_start(entity, stage) {
            debug!(entity = %entity.id, %stage, %rejection, "stage not startable");
            return Ok(false);
        }
        if stage == Stage::Scrape {
            if let Err(reason) = validate_url(&entity.url) {
                tx.fail_stage(&entity.id, Stage::Scrape, &reason).await?;
                info!(entity = %entity.id, url = %entity.url, %reason, "scrape failed before dispatch");
                return Ok(false);
            }
        }
        let unit = match WorkUnit::for_entity(entity, stage, &self.config.message_type) {
            Ok(unit) => unit,
            Err(rejection) => {
                warn!(entity = %entity.id, %stage, %rejection, "cannot build work unit");
                return Ok(false);
            }
        };
        if !tx.begin_stage(&entity.id, stage).await? {
            return Ok(false);
        }
        self.queue.publish(tx, &unit).await?;
        Ok(true)
    }

    /// Recompute job aggregates and finalize the job once nothing is in flight.
    ///
    /// Returns the final status if this call finished the job.
    pub(crate) async fn settle_job(&self, tx: &StoreTx, job_id: &JobId) -> Result<Option<JobStatus>> {
        let Some(job) = tx.get_job(job_id).await? else {
            return Ok(None);
        };
        let entities = tx.list_entities(job_id).await?;
        let tally = state::tally(&entities);
        tx.set_job_counts(job_id, tally.processed, tally.failed)
            .await?;

        if job.status != JobStatus::Processing {
            return Ok(None);
        }
        match tally.verdict() {
            Some(verdict)
                if tx
                    .set_job_status(job_id, &[JobStatus::Processing], verdict)
                    .await? =>
            {
                Ok(Some(verdict))
            }
            _ => Ok(None),
        }
    }
}

/// Only absolute http(s) URLs with a host are scraped.
fn validate_url(raw: &str) -> std::result::Result<(), String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("malformed URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("malformed URL: unsupported scheme '{}'", url.scheme()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("malformed URL: missing host".into());
    }
    Ok(())
}
