//! Stage runner: claims units, invokes workers, feeds results to the dispatcher.
//!
//! One claim loop per stage, each bounded by that stage's concurrency. A unit
//! is acknowledged only after `advance()` has durably recorded its result;
//! anything else releases it for redelivery.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use outreach_shared::{Result, Stage, StageError, SubmitResult};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::{Advance, Dispatcher};
use crate::forms::{FormRejection, plan_submission};
use crate::queue::{Delivery, UnitPayload, WorkQueue, WorkUnit};
use crate::retry::{self, RetryStep};
use crate::state::{self, Phase};
use crate::workers::{FormSubmitter, MessageGenerator, Scraper, StageResult};

/// Redelivery delay for a unit whose processing hit a store error.
const STORE_ERROR_DELAY: Duration = Duration::from_secs(5);

/// Outcome of running a worker once.
enum Attempt {
    /// The stage is no longer in progress; the unit is a leftover.
    Stale,
    Done(StageResult),
    Error(StageError),
}

pub struct StageRunner<Q, S, G, F>
where
    Q: WorkQueue,
    S: Scraper,
    G: MessageGenerator,
    F: FormSubmitter,
{
    dispatcher: Arc<Dispatcher<Q>>,
    scraper: Arc<S>,
    generator: Arc<G>,
    submitter: Arc<F>,
    worker_id: String,
}

impl<Q, S, G, F> StageRunner<Q, S, G, F>
where
    Q: WorkQueue,
    S: Scraper,
    G: MessageGenerator,
    F: FormSubmitter,
{
    pub fn new(
        dispatcher: Arc<Dispatcher<Q>>,
        scraper: Arc<S>,
        generator: Arc<G>,
        submitter: Arc<F>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            scraper,
            generator,
            submitter,
            worker_id: worker_id.into(),
        }
    }

    /// Run all three stage pools until `shutdown` fires, then wait for
    /// in-flight units to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let config = self.dispatcher.config();
        let pools = [
            (Stage::Scrape, config.scrape_concurrency),
            (Stage::Message, config.message_concurrency),
            (Stage::Submit, config.submit_concurrency),
        ];
        let handles: Vec<_> = pools
            .into_iter()
            .map(|(stage, concurrency)| {
                let runner = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { runner.run_stage(stage, concurrency, shutdown).await })
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "stage pool panicked");
            }
        }
    }

    async fn run_stage(self: Arc<Self>, stage: Stage, concurrency: usize, shutdown: CancellationToken) {
        let worker = format!("{}-{stage}", self.worker_id);
        let poll = self.dispatcher.config().poll_interval;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(%stage, concurrency, %worker, "stage pool starting");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self.dispatcher.queue().claim(stage, &worker).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => continue,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(%stage, error = %e, "failed to claim unit");
                    tokio::time::sleep(poll).await;
                    continue;
                }
            };

            let runner = self.clone();
            let worker = worker.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = runner.process(delivery, &worker).await {
                    error!(%stage, error = %e, "unit processing failed");
                }
            });
        }

        // Wait for in-flight units before reporting the pool as stopped
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!(%stage, "stage pool stopped");
    }

    /// Claim and fully process one unit of `stage`, if one is available.
    pub async fn process_next(&self, stage: Stage) -> Result<bool> {
        let worker = format!("{}-{stage}", self.worker_id);
        match self.dispatcher.queue().claim(stage, &worker).await? {
            Some(delivery) => {
                self.process(delivery, &worker).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process one claimed unit. On a store error the unit is released for a
    /// short delay instead of sitting out its lease.
    #[instrument(skip_all, fields(unit = %delivery.id, entity = %delivery.unit.entity_id, stage = %delivery.unit.stage(), attempt = delivery.attempt))]
    async fn process(&self, delivery: Delivery, worker: &str) -> Result<()> {
        let outcome = self.handle(&delivery, worker).await;
        if outcome.is_err() {
            if let Err(e) = self
                .dispatcher
                .queue()
                .release(&delivery, worker, STORE_ERROR_DELAY)
                .await
            {
                warn!(error = %e, "could not release unit, waiting for lease expiry");
            }
        }
        outcome
    }

    async fn handle(&self, delivery: &Delivery, worker: &str) -> Result<()> {
        let stage = delivery.unit.stage();
        let unit_timeout = self.dispatcher.config().unit_timeout;

        let attempt = match tokio::time::timeout(unit_timeout, self.attempt(&delivery.unit)).await {
            Ok(attempt) => attempt?,
            Err(_) => Attempt::Error(StageError::transient(format!(
                "unit timed out after {}s",
                unit_timeout.as_secs()
            ))),
        };

        match attempt {
            Attempt::Stale => {
                debug!("stage no longer in progress, dropping unit");
                self.dispatcher.queue().ack(delivery).await?;
                Ok(())
            }
            Attempt::Done(result) => self.finish(delivery, result).await,
            Attempt::Error(err) if !err.is_retryable() => {
                info!(error = %err, "permanent failure");
                self.finish(delivery, StageResult::failed(stage, err.reason()))
                    .await
            }
            Attempt::Error(err) => self.retry_or_fail(delivery, worker, err).await,
        }
    }

    /// Run the unit's worker once under the per-call timeout.
    async fn attempt(&self, unit: &WorkUnit) -> Result<Attempt> {
        let stage = unit.stage();
        let Some(entity) = self.dispatcher.storage().get_entity(&unit.entity_id).await? else {
            return Ok(Attempt::Stale);
        };
        if state::phase(&entity, stage) != Phase::InProgress {
            return Ok(Attempt::Stale);
        }

        let config = self.dispatcher.config();
        let call = config.call_timeout;
        let outcome = match &unit.payload {
            UnitPayload::Scrape { url } => with_timeout(call, self.scraper.scrape(url))
                .await
                .map(StageResult::Scrape),
            UnitPayload::Message { input } => with_timeout(call, self.generator.generate(input))
                .await
                .map(StageResult::Message),
            UnitPayload::Submit { form, message } => {
                match plan_submission(form, message, &config.sender) {
                    Ok(plan) => with_timeout(call, self.submitter.submit(&plan))
                        .await
                        .map(|receipt| StageResult::Submit(receipt.into_result(&plan))),
                    Err(FormRejection::NotContactForm(reason)) => {
                        info!(reason, "form is not a contact form");
                        Ok(StageResult::Submit(SubmitResult::no_form()))
                    }
                    Err(rejection) => Ok(StageResult::Submit(SubmitResult::failed(
                        rejection.to_string(),
                    ))),
                }
            }
        };

        Ok(match outcome {
            Ok(result) => Attempt::Done(result),
            Err(err) => Attempt::Error(err),
        })
    }

    /// Count the failed attempt, then either schedule redelivery or record
    /// the stage as FAILED.
    async fn retry_or_fail(&self, delivery: &Delivery, worker: &str, err: StageError) -> Result<()> {
        let stage = delivery.unit.stage();
        let queue = self.dispatcher.queue();
        let Some(attempts) = self
            .dispatcher
            .record_attempt(&delivery.unit.entity_id, stage)
            .await?
        else {
            debug!("stage moved on while the attempt ran, dropping unit");
            queue.ack(delivery).await?;
            return Ok(());
        };

        match retry::next_step(&self.dispatcher.config().retry, &err, attempts) {
            RetryStep::Retry(delay) => {
                warn!(
                    attempts,
                    kind = err.kind(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
                );
                queue.release(delivery, worker, delay).await?;
                Ok(())
            }
            RetryStep::GiveUp => {
                warn!(attempts, kind = err.kind(), error = %err, "attempts exhausted");
                let reason = format!("{} (after {attempts} attempts)", err.reason());
                self.finish(delivery, StageResult::failed(stage, reason))
                    .await
            }
        }
    }

    /// Hand the final result to the dispatcher; ack only once it is recorded.
    async fn finish(&self, delivery: &Delivery, result: StageResult) -> Result<()> {
        let stage = delivery.unit.stage();
        let advance = self
            .dispatcher
            .advance(&delivery.unit.entity_id, stage, result)
            .await?;
        if let Advance::Rejected(reason) = &advance {
            warn!(%reason, "dispatcher rejected result");
        }
        self.dispatcher.queue().ack(delivery).await?;
        Ok(())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = std::result::Result<T, StageError>>,
) -> std::result::Result<T, StageError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StageError::transient(format!(
            "call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
