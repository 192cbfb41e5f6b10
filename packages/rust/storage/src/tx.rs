//! Transaction-scoped, compare-and-set writes.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use outreach_shared::{
    Entity, EntityId, Job, JobId, JobStatus, MessageResult, MessageStatus, OutreachError, Result,
    ScrapeResult, ScrapingStatus, Stage, SubmissionStatus, SubmitResult,
};

use crate::{db_err, new_unit_id, now_ts, rows, timestamp};

/// Column names and in-flight values for one stage.
struct StageColumns {
    status: &'static str,
    retries: &'static str,
    error: &'static str,
    in_progress: &'static str,
    /// Extra precondition for leaving PENDING.
    precondition: &'static str,
    /// Output columns cleared on reset.
    outputs: &'static str,
}

fn columns(stage: Stage) -> StageColumns {
    match stage {
        Stage::Scrape => StageColumns {
            status: "scraping_status",
            retries: "scrape_retry_count",
            error: "scrape_error",
            in_progress: "IN_PROGRESS",
            precondition: "1 = 1",
            outputs: "company_name = NULL, industry = NULL, business_type = NULL, \
                      about_content = NULL, contact_form_url = NULL, has_contact_form = 0, \
                      contact_form_json = NULL, scrape_error = NULL",
        },
        Stage::Message => StageColumns {
            status: "message_status",
            retries: "message_retry_count",
            error: "message_error",
            in_progress: "GENERATING",
            precondition: "scraping_status = 'COMPLETED'",
            outputs: "generated_message = NULL, message_confidence = NULL, message_error = NULL",
        },
        Stage::Submit => StageColumns {
            status: "submission_status",
            retries: "submit_retry_count",
            error: "submission_error",
            in_progress: "SUBMITTING",
            precondition: "message_status = 'GENERATED' AND has_contact_form = 1",
            outputs: "submitted_form_fields = NULL, submission_response = NULL, \
                      submission_error = NULL",
        },
    }
}

/// An open `BEGIN IMMEDIATE` transaction on its own connection.
pub struct StoreTx {
    conn: Connection,
}

impl StoreTx {
    pub(crate) async fn begin(conn: Connection) -> Result<Self> {
        conn.execute_batch("BEGIN IMMEDIATE")
            .await
            .map_err(db_err)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Make every write of this transaction durable.
    pub async fn commit(self) -> Result<()> {
        self.conn.execute_batch("COMMIT").await.map_err(db_err)?;
        Ok(())
    }

    /// Discard every write of this transaction.
    pub async fn rollback(self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK").await.map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads (consistent with this transaction's writes)
    // -----------------------------------------------------------------------

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        rows::fetch_job(&self.conn, id).await
    }

    pub async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        rows::fetch_entity(&self.conn, id).await
    }

    pub async fn list_entities(&self, job_id: &JobId) -> Result<Vec<Entity>> {
        rows::fetch_entities(&self.conn, job_id).await
    }

    // -----------------------------------------------------------------------
    // Job writes
    // -----------------------------------------------------------------------

    /// Move a job from any of `from` to `to`, stamping processing timestamps.
    pub async fn set_job_status(&self, id: &JobId, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        let sql = format!(
            "UPDATE jobs SET status = ?1, updated_at = ?2,
               processing_started_at = CASE WHEN ?1 = 'PROCESSING'
                 THEN COALESCE(processing_started_at, ?2) ELSE processing_started_at END,
               processing_completed_at = CASE
                 WHEN ?1 IN ('COMPLETED', 'FAILED', 'CANCELLED') THEN ?2
                 WHEN ?1 = 'PROCESSING' THEN NULL
                 ELSE processing_completed_at END
             WHERE id = ?3 AND status IN ({})",
            in_list(from.iter().map(|s| s.as_str()))
        );
        let changed = self
            .conn
            .execute(&sql, params![to.as_str(), now_ts(), id.to_string()])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Store recomputed aggregates. Also counts as job progress for the monitor.
    pub async fn set_job_counts(&self, id: &JobId, processed: u32, failed: u32) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET processed_count = ?1, failed_count = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![processed as i64, failed as i64, now_ts(), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Bump `updated_at` without changing anything else.
    pub async fn touch_job(&self, id: &JobId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
                params![now_ts(), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Delete a job only if it is still in `expected` status.
    pub async fn delete_job(&self, id: &JobId, expected: JobStatus) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND status = ?2",
                params![id.to_string(), expected.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub async fn delete_entities(&self, job_id: &JobId) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM entities WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Entity stage writes
    // -----------------------------------------------------------------------

    /// PENDING → in-progress, only if the stage's preconditions hold.
    pub async fn begin_stage(&self, id: &EntityId, stage: Stage) -> Result<bool> {
        let c = columns(stage);
        let sql = format!(
            "UPDATE entities SET {status} = '{in_progress}', last_attempt_at = ?1, updated_at = ?1
             WHERE id = ?2 AND {status} = 'PENDING' AND {precondition}",
            status = c.status,
            in_progress = c.in_progress,
            precondition = c.precondition,
        );
        let changed = self
            .conn
            .execute(&sql, params![now_ts(), id.to_string()])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// IN_PROGRESS → COMPLETED/FAILED with the scraper's output.
    pub async fn complete_scrape(&self, id: &EntityId, result: &ScrapeResult) -> Result<bool> {
        if !matches!(
            result.status,
            ScrapingStatus::Completed | ScrapingStatus::Failed
        ) {
            return Err(OutreachError::validation(format!(
                "scrape result must be terminal, got {}",
                result.status
            )));
        }
        let form_json = result
            .contact_form
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| OutreachError::Storage(e.to_string()))?;

        let changed = self
            .conn
            .execute(
                "UPDATE entities SET scraping_status = ?1, company_name = ?2, industry = ?3,
                   business_type = ?4, about_content = ?5, contact_form_url = ?6,
                   has_contact_form = ?7, contact_form_json = ?8, scrape_error = ?9,
                   updated_at = ?10
                 WHERE id = ?11 AND scraping_status = 'IN_PROGRESS'",
                params![
                    result.status.as_str(),
                    result.company_name.as_deref(),
                    result.industry.as_deref(),
                    result.business_type.as_deref(),
                    result.about_content.as_deref(),
                    result.contact_form_url.as_deref(),
                    result.has_contact_form as i64,
                    form_json,
                    result.error_message.as_deref(),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// GENERATING → GENERATED/FAILED with the generator's output.
    pub async fn complete_message(&self, id: &EntityId, result: &MessageResult) -> Result<bool> {
        if !matches!(
            result.status,
            MessageStatus::Generated | MessageStatus::Failed
        ) {
            return Err(OutreachError::validation(format!(
                "message result must be terminal, got {}",
                result.status
            )));
        }
        let changed = self
            .conn
            .execute(
                "UPDATE entities SET message_status = ?1, generated_message = ?2,
                   message_confidence = ?3, message_error = ?4, updated_at = ?5
                 WHERE id = ?6 AND message_status = 'GENERATING'",
                params![
                    result.status.as_str(),
                    result.message.as_deref(),
                    result.confidence,
                    result.error.as_deref(),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// SUBMITTING → SUCCESS/FAILED/NO_FORM_FOUND with the submission outcome.
    pub async fn complete_submission(&self, id: &EntityId, result: &SubmitResult) -> Result<bool> {
        if !matches!(
            result.status,
            SubmissionStatus::Success | SubmissionStatus::Failed | SubmissionStatus::NoFormFound
        ) {
            return Err(OutreachError::validation(format!(
                "submission result must be terminal, got {}",
                result.status
            )));
        }
        let fields = result
            .submitted_fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| OutreachError::Storage(e.to_string()))?;
        let response = result
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| OutreachError::Storage(e.to_string()))?;

        let changed = self
            .conn
            .execute(
                "UPDATE entities SET submission_status = ?1, submitted_form_fields = ?2,
                   submission_response = ?3, submission_error = ?4, updated_at = ?5
                 WHERE id = ?6 AND submission_status = 'SUBMITTING'",
                params![
                    result.status.as_str(),
                    fields,
                    response,
                    result.error.as_deref(),
                    now_ts(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// PENDING → NO_FORM_FOUND for a generated entity that has no contact form.
    pub async fn close_without_form(&self, id: &EntityId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE entities SET submission_status = 'NO_FORM_FOUND', updated_at = ?1
                 WHERE id = ?2 AND submission_status = 'PENDING'
                   AND message_status = 'GENERATED' AND has_contact_form = 0",
                params![now_ts(), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Fail a stage that has not reached a terminal status yet.
    pub async fn fail_stage(&self, id: &EntityId, stage: Stage, reason: &str) -> Result<bool> {
        let c = columns(stage);
        let sql = format!(
            "UPDATE entities SET {status} = 'FAILED', {error} = ?1, updated_at = ?2
             WHERE id = ?3 AND {status} IN ('PENDING', '{in_progress}')",
            status = c.status,
            error = c.error,
            in_progress = c.in_progress,
        );
        let changed = self
            .conn
            .execute(&sql, params![reason, now_ts(), id.to_string()])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Count one more attempt of an in-progress stage and return the new count.
    ///
    /// With `stalled_before`, only counts if the last attempt started before
    /// that instant. Returns `None` if the stage is no longer in progress (or
    /// not stalled), meaning someone else already moved it.
    pub async fn bump_retry(
        &self,
        id: &EntityId,
        stage: Stage,
        stalled_before: Option<DateTime<Utc>>,
    ) -> Result<Option<u32>> {
        let c = columns(stage);
        let stall_clause = if stalled_before.is_some() {
            "AND (last_attempt_at IS NULL OR last_attempt_at < ?3)"
        } else {
            "AND ?3 IS NULL"
        };
        let sql = format!(
            "UPDATE entities SET {retries} = {retries} + 1, last_attempt_at = ?1, updated_at = ?1
             WHERE id = ?2 AND {status} = '{in_progress}' {stall_clause}",
            retries = c.retries,
            status = c.status,
            in_progress = c.in_progress,
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![
                    now_ts(),
                    id.to_string(),
                    stalled_before.map(timestamp)
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            return Ok(None);
        }

        let entity = self
            .get_entity(id)
            .await?
            .ok_or_else(|| OutreachError::not_found("entity", id))?;
        Ok(Some(entity.retry_count(stage)))
    }

    /// Put `from` and every later stage back to PENDING with cleared outputs
    /// and retry counters. Operator override: ignores the current status.
    pub async fn reset_stages(&self, id: &EntityId, from: Stage) -> Result<bool> {
        let sets: Vec<String> = Stage::ALL
            .iter()
            .filter(|s| **s >= from)
            .map(|s| {
                let c = columns(*s);
                format!(
                    "{} = 'PENDING', {} = 0, {}",
                    c.status, c.retries, c.outputs
                )
            })
            .collect();
        let sql = format!(
            "UPDATE entities SET {}, last_attempt_at = NULL, updated_at = ?1 WHERE id = ?2",
            sets.join(", ")
        );
        let changed = self
            .conn
            .execute(&sql, params![now_ts(), id.to_string()])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Work unit writes
    // -----------------------------------------------------------------------

    /// Enqueue a unit; an outstanding unit for the same entity and queue is
    /// replaced (new id, lease cleared). Returns the new unit id.
    pub async fn insert_work_unit(
        &self,
        queue: &str,
        entity_id: &EntityId,
        payload: &str,
    ) -> Result<String> {
        let id = new_unit_id();
        self.conn
            .execute(
                "INSERT INTO work_units (id, queue, entity_id, payload, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(entity_id, queue) DO UPDATE SET
                   id = excluded.id,
                   payload = excluded.payload,
                   enqueued_at = excluded.enqueued_at,
                   lease_owner = NULL,
                   lease_expires_at = NULL,
                   deliveries = 0",
                params![
                    id.as_str(),
                    queue,
                    entity_id.to_string(),
                    payload,
                    now_ts()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    pub async fn delete_work_units_for_entity(&self, entity_id: &EntityId) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM work_units WHERE entity_id = ?1",
                params![entity_id.to_string()],
            )
            .await
            .map_err(db_err)
    }

    pub async fn delete_work_units_for_job(&self, job_id: &JobId) -> Result<u64> {
        self.conn
            .execute(
                "DELETE FROM work_units
                 WHERE entity_id IN (SELECT id FROM entities WHERE job_id = ?1)",
                params![job_id.to_string()],
            )
            .await
            .map_err(db_err)
    }
}

/// `'A', 'B'` for a SQL `IN (...)` over closed-set enum values.
fn in_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
