//! Turso Embedded / libSQL storage layer for jobs, entities and work units.
//!
//! The [`Storage`] struct wraps a libSQL database. Plain reads go through its
//! shared connection; every mutation that must be atomic goes through a
//! [`StoreTx`] opened with [`Storage::begin`].
//!
//! **Write rules:**
//! - All status changes are compare-and-set: the `WHERE` clause names the
//!   status the caller expects, and the returned `bool` says whether the row
//!   actually moved. `false` means another writer got there first.
//! - Each transaction runs on its own connection with `BEGIN IMMEDIATE`, so
//!   concurrent writers serialize on the database lock instead of racing.

mod migrations;
mod rows;
mod tx;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use outreach_shared::{Entity, EntityId, Job, JobId, JobStatus, OutreachError, Result};
use uuid::Uuid;

pub use tx::StoreTx;

use rows::{ENTITY_COLUMNS, JOB_COLUMNS, WORK_UNIT_COLUMNS};

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT_MS: u64 = 10_000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// A persisted work unit as stored in the `work_units` table.
#[derive(Debug, Clone)]
pub struct WorkUnitRow {
    pub id: String,
    pub queue: String,
    pub entity_id: EntityId,
    /// Serialized unit body, opaque to the storage layer.
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub deliveries: u32,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| OutreachError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .await
            .map_err(db_err)?;
        configure(&conn).await?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (status inspection).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        configure(&conn).await?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    OutreachError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(OutreachError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Start an immediate transaction on a dedicated connection.
    ///
    /// Dropping the returned [`StoreTx`] without committing closes its
    /// connection, which rolls the transaction back.
    pub async fn begin(&self) -> Result<StoreTx> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(db_err)?;
        configure(&conn).await?;
        StoreTx::begin(conn).await
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    /// Create a PENDING job with one PENDING entity per URL.
    pub async fn create_job(&self, owner_id: &str, urls: &[String]) -> Result<(Job, Vec<Entity>)> {
        let tx = self.begin().await?;
        let job_id = JobId::new();
        let now = now_ts();
        tx.conn()
            .execute(
                "INSERT INTO jobs (id, owner_id, status, total_entities, created_at, updated_at)
                 VALUES (?1, ?2, 'PENDING', ?3, ?4, ?4)",
                params![
                    job_id.to_string(),
                    owner_id,
                    urls.len() as i64,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;

        for url in urls {
            tx.conn()
                .execute(
                    "INSERT INTO entities (id, job_id, url, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![
                        EntityId::new().to_string(),
                        job_id.to_string(),
                        url.as_str(),
                        now.as_str()
                    ],
                )
                .await
                .map_err(db_err)?;
        }

        let job = tx
            .get_job(&job_id)
            .await?
            .ok_or_else(|| OutreachError::Storage("job vanished after insert".into()))?;
        let entities = tx.list_entities(&job_id).await?;
        tx.commit().await?;
        Ok((job, entities))
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        rows::fetch_job(&self.conn, id).await
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>> {
        let mut rows = match status {
            Some(status) => self
                .conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit as i64],
                )
                .await
                .map_err(db_err)?,
            None => self
                .conn
                .query(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"),
                    params![limit as i64],
                )
                .await
                .map_err(db_err)?,
        };

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(rows::row_to_job(&row)?);
        }
        Ok(results)
    }

    /// PROCESSING jobs whose last progress is older than `before`.
    pub async fn stale_jobs(&self, before: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status = 'PROCESSING' AND updated_at < ?1
                     ORDER BY updated_at"
                ),
                params![timestamp(before)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(rows::row_to_job(&row)?);
        }
        Ok(results)
    }

    /// IDs of FAILED jobs that finished before `before`.
    pub async fn expired_failed_jobs(&self, before: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM jobs
                 WHERE status = 'FAILED' AND processing_completed_at IS NOT NULL
                   AND processing_completed_at < ?1
                 ORDER BY processing_completed_at",
                params![timestamp(before)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let id: String = row.get(0).map_err(db_err)?;
            results.push(rows::parse_id(&id)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Entity operations
    // -----------------------------------------------------------------------

    /// Get an entity by ID.
    pub async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        rows::fetch_entity(&self.conn, id).await
    }

    /// List all entities of a job in insertion order.
    pub async fn list_entities(&self, job_id: &JobId) -> Result<Vec<Entity>> {
        rows::fetch_entities(&self.conn, job_id).await
    }

    // -----------------------------------------------------------------------
    // Work unit operations
    // -----------------------------------------------------------------------

    /// Lease the oldest available unit on `queue` to `owner` for `lease`.
    ///
    /// Units whose previous lease expired are handed out again, which is what
    /// makes delivery at-least-once.
    pub async fn claim_work_unit(
        &self,
        queue: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<WorkUnitRow>> {
        let tx = self.begin().await?;
        let now = Utc::now();
        let until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());

        let mut rows = tx
            .conn()
            .query(
                "SELECT id FROM work_units
                 WHERE queue = ?1 AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)
                 ORDER BY enqueued_at LIMIT 1",
                params![queue, timestamp(now)],
            )
            .await
            .map_err(db_err)?;

        let id: String = match rows.next().await.map_err(db_err)? {
            Some(row) => row.get(0).map_err(db_err)?,
            None => return Ok(None),
        };
        drop(rows);

        tx.conn()
            .execute(
                "UPDATE work_units
                 SET lease_owner = ?1, lease_expires_at = ?2, deliveries = deliveries + 1
                 WHERE id = ?3",
                params![owner, timestamp(until), id.as_str()],
            )
            .await
            .map_err(db_err)?;

        let unit = rows::fetch_work_unit(tx.conn(), &id).await?;
        tx.commit().await?;
        Ok(unit)
    }

    /// Remove a delivered unit. Returns `false` if it was already replaced or removed.
    pub async fn ack_work_unit(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute("DELETE FROM work_units WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Give a leased unit back, claimable again after `delay`.
    pub async fn release_work_unit(&self, id: &str, owner: &str, delay: Duration) -> Result<bool> {
        self.check_writable()?;
        let available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let changed = self
            .conn
            .execute(
                "UPDATE work_units SET lease_owner = NULL, lease_expires_at = ?1
                 WHERE id = ?2 AND lease_owner = ?3",
                params![timestamp(available_at), id, owner],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// List outstanding units, optionally for one queue.
    pub async fn list_work_units(&self, queue: Option<&str>) -> Result<Vec<WorkUnitRow>> {
        let mut rows = match queue {
            Some(queue) => self
                .conn
                .query(
                    &format!(
                        "SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE queue = ?1
                         ORDER BY enqueued_at"
                    ),
                    params![queue],
                )
                .await
                .map_err(db_err)?,
            None => self
                .conn
                .query(
                    &format!("SELECT {WORK_UNIT_COLUMNS} FROM work_units ORDER BY enqueued_at"),
                    params![],
                )
                .await
                .map_err(db_err)?,
        };

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(rows::row_to_work_unit(&row)?);
        }
        Ok(results)
    }
}

/// Per-connection settings applied to every connection we open.
async fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}; PRAGMA foreign_keys = ON;"
    ))
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Map a libSQL error into the storage variant.
pub(crate) fn db_err(e: libsql::Error) -> OutreachError {
    OutreachError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 UTC timestamp; lexical order equals time order.
pub fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    timestamp(Utc::now())
}

/// Fresh opaque identifier for a work unit.
pub(crate) fn new_unit_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_shared::{
        FieldKind, FormDescriptor, FormField, MessageResult, MessageStatus, ScrapeResult,
        ScrapingStatus, Stage, SubmissionStatus, SubmitResult,
    };
    use std::collections::BTreeMap;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("outreach_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://site{i}.example.com")).collect()
    }

    fn sample_form() -> FormDescriptor {
        FormDescriptor {
            page_url: "https://site0.example.com/contact".into(),
            action: Some("/send".into()),
            method: "POST".into(),
            id: Some("contact".into()),
            class: None,
            caption: None,
            fields: vec![FormField {
                name: "email".into(),
                id: None,
                placeholder: None,
                kind: FieldKind::Email,
                required: true,
                options: vec![],
                value: None,
            }],
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("outreach_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn create_job_with_entities() {
        let storage = test_storage().await;
        let (job, entities) = storage.create_job("owner-1", &urls(3)).await.expect("create");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_entities, 3);
        assert_eq!(job.processed_count + job.failed_count, 0);
        assert_eq!(entities.len(), 3);
        assert!(entities.iter().all(|e| e.scraping_status == ScrapingStatus::Pending
            && e.message_status == MessageStatus::Pending
            && e.submission_status == SubmissionStatus::Pending));

        let found = storage.get_job(&job.id).await.unwrap().expect("job exists");
        assert_eq!(found.owner_id, "owner-1");

        let pending = storage.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let processing = storage.list_jobs(Some(JobStatus::Processing), 10).await.unwrap();
        assert!(processing.is_empty());
    }

    #[tokio::test]
    async fn begin_stage_enforces_preconditions() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let id = &entities[0].id;

        let tx = storage.begin().await.unwrap();
        // Message cannot start before scraping completed
        assert!(!tx.begin_stage(id, Stage::Message).await.unwrap());
        assert!(tx.begin_stage(id, Stage::Scrape).await.unwrap());
        // Already in progress
        assert!(!tx.begin_stage(id, Stage::Scrape).await.unwrap());

        let scraped = ScrapeResult {
            company_name: Some("Acme".into()),
            ..ScrapeResult::completed()
        };
        assert!(tx.complete_scrape(id, &scraped).await.unwrap());
        assert!(tx.begin_stage(id, Stage::Message).await.unwrap());
        assert!(tx.complete_message(id, &MessageResult::generated("Hi", 0.9)).await.unwrap());

        // No contact form: submission can never enter SUBMITTING
        assert!(!tx.begin_stage(id, Stage::Submit).await.unwrap());
        assert!(tx.close_without_form(id).await.unwrap());
        tx.commit().await.unwrap();

        let entity = storage.get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.submission_status, SubmissionStatus::NoFormFound);
        assert_eq!(entity.generated_message.as_deref(), Some("Hi"));
        assert_eq!(entity.company_name.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn completion_is_compare_and_set() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let id = &entities[0].id;

        let tx = storage.begin().await.unwrap();
        tx.begin_stage(id, Stage::Scrape).await.unwrap();
        let result = ScrapeResult {
            has_contact_form: true,
            contact_form: Some(sample_form()),
            ..ScrapeResult::completed()
        };
        assert!(tx.complete_scrape(id, &result).await.unwrap());
        // Duplicate delivery of the same result moves nothing
        assert!(!tx.complete_scrape(id, &ScrapeResult::failed("late")).await.unwrap());
        tx.commit().await.unwrap();

        let entity = storage.get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.scraping_status, ScrapingStatus::Completed);
        assert!(entity.has_contact_form);
        assert_eq!(entity.contact_form, Some(sample_form()));
        assert!(entity.scrape_error.is_none());
    }

    #[tokio::test]
    async fn submitted_fields_roundtrip() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let id = &entities[0].id;

        let tx = storage.begin().await.unwrap();
        tx.begin_stage(id, Stage::Scrape).await.unwrap();
        let scraped = ScrapeResult {
            has_contact_form: true,
            contact_form: Some(sample_form()),
            ..ScrapeResult::completed()
        };
        tx.complete_scrape(id, &scraped).await.unwrap();
        tx.begin_stage(id, Stage::Message).await.unwrap();
        tx.complete_message(id, &MessageResult::generated("Hello", 0.8)).await.unwrap();
        assert!(tx.begin_stage(id, Stage::Submit).await.unwrap());

        let payload: BTreeMap<String, String> = [
            ("email".to_string(), "me@example.com".to_string()),
            ("message".to_string(), "Hello".to_string()),
        ]
        .into_iter()
        .collect();
        let result = SubmitResult {
            status: SubmissionStatus::Success,
            submitted_fields: Some(payload.clone()),
            response: None,
            error: None,
        };
        assert!(tx.complete_submission(id, &result).await.unwrap());
        tx.commit().await.unwrap();

        let entity = storage.get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.submitted_form_fields, Some(payload));
    }

    #[tokio::test]
    async fn non_terminal_result_is_rejected() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let tx = storage.begin().await.unwrap();
        let bogus = ScrapeResult {
            status: ScrapingStatus::InProgress,
            ..ScrapeResult::completed()
        };
        assert!(tx.complete_scrape(&entities[0].id, &bogus).await.is_err());
    }

    #[tokio::test]
    async fn bump_retry_respects_stall_cutoff() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let id = &entities[0].id;

        let tx = storage.begin().await.unwrap();
        // Not in progress yet
        assert_eq!(tx.bump_retry(id, Stage::Scrape, None).await.unwrap(), None);
        tx.begin_stage(id, Stage::Scrape).await.unwrap();
        assert_eq!(tx.bump_retry(id, Stage::Scrape, None).await.unwrap(), Some(1));

        // Last attempt just happened: not stalled relative to an old cutoff
        let old_cutoff = Utc::now() - chrono::Duration::minutes(10);
        assert_eq!(tx.bump_retry(id, Stage::Scrape, Some(old_cutoff)).await.unwrap(), None);

        let future_cutoff = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(
            tx.bump_retry(id, Stage::Scrape, Some(future_cutoff)).await.unwrap(),
            Some(2)
        );

        assert!(tx.fail_stage(id, Stage::Scrape, "retries exhausted").await.unwrap());
        assert!(!tx.fail_stage(id, Stage::Scrape, "again").await.unwrap());
        tx.commit().await.unwrap();

        let entity = storage.get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.scraping_status, ScrapingStatus::Failed);
        assert_eq!(entity.scrape_retry_count, 2);
        assert_eq!(entity.scrape_error.as_deref(), Some("retries exhausted"));
    }

    #[tokio::test]
    async fn job_status_transitions_stamp_timestamps() {
        let storage = test_storage().await;
        let (job, _) = storage.create_job("o", &urls(2)).await.unwrap();

        let tx = storage.begin().await.unwrap();
        assert!(tx
            .set_job_status(&job.id, &[JobStatus::Pending], JobStatus::Processing)
            .await
            .unwrap());
        // CAS: no longer pending
        assert!(!tx
            .set_job_status(&job.id, &[JobStatus::Pending], JobStatus::Processing)
            .await
            .unwrap());
        assert!(tx.set_job_counts(&job.id, 1, 1).await.unwrap());
        assert!(tx
            .set_job_status(&job.id, &[JobStatus::Processing], JobStatus::Completed)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let job = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processing_started_at.is_some());
        assert!(job.processing_completed_at.is_some());
        assert_eq!((job.processed_count, job.failed_count), (1, 1));
    }

    #[tokio::test]
    async fn counts_cannot_exceed_total() {
        let storage = test_storage().await;
        let (job, _) = storage.create_job("o", &urls(1)).await.unwrap();
        let tx = storage.begin().await.unwrap();
        assert!(tx.set_job_counts(&job.id, 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        {
            let tx = storage.begin().await.unwrap();
            tx.begin_stage(&entities[0].id, Stage::Scrape).await.unwrap();
        }
        let entity = storage.get_entity(&entities[0].id).await.unwrap().unwrap();
        assert_eq!(entity.scraping_status, ScrapingStatus::Pending);
    }

    #[tokio::test]
    async fn reset_stages_clears_downstream() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let id = &entities[0].id;

        let tx = storage.begin().await.unwrap();
        tx.begin_stage(id, Stage::Scrape).await.unwrap();
        tx.complete_scrape(id, &ScrapeResult {
            company_name: Some("Acme".into()),
            ..ScrapeResult::completed()
        })
        .await
        .unwrap();
        tx.begin_stage(id, Stage::Message).await.unwrap();
        tx.bump_retry(id, Stage::Message, None).await.unwrap();
        tx.complete_message(id, &MessageResult::failed("model refused")).await.unwrap();
        assert!(tx.reset_stages(id, Stage::Message).await.unwrap());
        tx.commit().await.unwrap();

        let entity = storage.get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.scraping_status, ScrapingStatus::Completed);
        assert_eq!(entity.company_name.as_deref(), Some("Acme"));
        assert_eq!(entity.message_status, MessageStatus::Pending);
        assert_eq!(entity.message_retry_count, 0);
        assert!(entity.message_error.is_none());
    }

    #[tokio::test]
    async fn work_unit_lease_lifecycle() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let id = &entities[0].id;

        let tx = storage.begin().await.unwrap();
        let first = tx.insert_work_unit("outreach.scrape", id, "{}").await.unwrap();
        // Republishing replaces the outstanding unit
        let second = tx.insert_work_unit("outreach.scrape", id, r#"{"v":2}"#).await.unwrap();
        tx.commit().await.unwrap();
        assert_ne!(first, second);
        let units = storage.list_work_units(Some("outreach.scrape")).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].payload, r#"{"v":2}"#);

        let lease = Duration::from_secs(60);
        let claimed = storage
            .claim_work_unit("outreach.scrape", "w1", lease)
            .await
            .unwrap()
            .expect("unit available");
        assert_eq!(claimed.id, second);
        assert_eq!(claimed.deliveries, 1);
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));

        // Leased: nothing else to claim
        assert!(storage.claim_work_unit("outreach.scrape", "w2", lease).await.unwrap().is_none());

        // Only the lease owner can release
        assert!(!storage.release_work_unit(&claimed.id, "w2", Duration::ZERO).await.unwrap());
        assert!(storage.release_work_unit(&claimed.id, "w1", Duration::ZERO).await.unwrap());
        let again = storage
            .claim_work_unit("outreach.scrape", "w2", lease)
            .await
            .unwrap()
            .expect("released unit is claimable");
        assert_eq!(again.deliveries, 2);

        // Stale ack of a replaced id is harmless
        assert!(!storage.ack_work_unit(&first).await.unwrap());
        assert!(storage.ack_work_unit(&again.id).await.unwrap());
        assert!(storage.list_work_units(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delayed_release_hides_unit() {
        let storage = test_storage().await;
        let (_, entities) = storage.create_job("o", &urls(1)).await.unwrap();
        let tx = storage.begin().await.unwrap();
        tx.insert_work_unit("outreach.message", &entities[0].id, "{}").await.unwrap();
        tx.commit().await.unwrap();

        let lease = Duration::from_secs(60);
        let unit = storage.claim_work_unit("outreach.message", "w", lease).await.unwrap().unwrap();
        storage.release_work_unit(&unit.id, "w", Duration::from_secs(3600)).await.unwrap();
        assert!(storage.claim_work_unit("outreach.message", "w", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_job_deletion_is_guarded() {
        let storage = test_storage().await;
        let (job, _) = storage.create_job("o", &urls(2)).await.unwrap();

        let tx = storage.begin().await.unwrap();
        tx.set_job_status(&job.id, &[JobStatus::Pending], JobStatus::Failed).await.unwrap();
        tx.commit().await.unwrap();

        let later = Utc::now() + chrono::Duration::days(8);
        let expired = storage.expired_failed_jobs(later).await.unwrap();
        assert_eq!(expired, vec![job.id.clone()]);
        assert!(storage.expired_failed_jobs(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap()
            .is_empty());

        let tx = storage.begin().await.unwrap();
        assert!(!tx.delete_job(&job.id, JobStatus::Processing).await.unwrap());
        assert_eq!(tx.delete_entities(&job.id).await.unwrap(), 2);
        assert!(tx.delete_job(&job.id, JobStatus::Failed).await.unwrap());
        tx.commit().await.unwrap();
        assert!(storage.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_jobs_only_returns_processing() {
        let storage = test_storage().await;
        let (a, _) = storage.create_job("o", &urls(1)).await.unwrap();
        let (_b, _) = storage.create_job("o", &urls(1)).await.unwrap();
        let tx = storage.begin().await.unwrap();
        tx.set_job_status(&a.id, &[JobStatus::Pending], JobStatus::Processing).await.unwrap();
        tx.commit().await.unwrap();

        let future = Utc::now() + chrono::Duration::minutes(15);
        let stale = storage.stale_jobs(future).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, a.id);
        assert!(storage.stale_jobs(Utc::now() - chrono::Duration::minutes(15))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("outreach_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.create_job("o", &urls(1)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_jobs(None, 10).await.unwrap().len(), 1);
        let result = ro.create_job("o", &urls(1)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
