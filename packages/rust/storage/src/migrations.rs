//! SQL migration definitions for the outreach database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: jobs, entities, work_units",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per submitted batch
CREATE TABLE IF NOT EXISTS jobs (
    id                      TEXT PRIMARY KEY,
    owner_id                TEXT NOT NULL,
    status                  TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED', 'CANCELLED')),
    total_entities          INTEGER NOT NULL DEFAULT 0 CHECK (total_entities >= 0),
    processed_count         INTEGER NOT NULL DEFAULT 0 CHECK (processed_count >= 0),
    failed_count            INTEGER NOT NULL DEFAULT 0 CHECK (failed_count >= 0),
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,
    processing_started_at   TEXT,
    processing_completed_at TEXT,
    CHECK (processed_count + failed_count <= total_entities)
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_updated ON jobs(status, updated_at);

-- One row per target website
CREATE TABLE IF NOT EXISTS entities (
    id                    TEXT PRIMARY KEY,
    job_id                TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    url                   TEXT NOT NULL,
    scraping_status       TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (scraping_status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED', 'FAILED')),
    message_status        TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (message_status IN ('PENDING', 'GENERATING', 'GENERATED', 'FAILED')),
    submission_status     TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (submission_status IN ('PENDING', 'SUBMITTING', 'SUCCESS', 'FAILED', 'NO_FORM_FOUND')),
    company_name          TEXT,
    industry              TEXT,
    business_type         TEXT,
    about_content         TEXT,
    contact_form_url      TEXT,
    has_contact_form      INTEGER NOT NULL DEFAULT 0,
    contact_form_json     TEXT,
    scrape_error          TEXT,
    generated_message     TEXT,
    message_confidence    REAL,
    message_error         TEXT,
    submitted_form_fields TEXT,
    submission_response   TEXT,
    submission_error      TEXT,
    scrape_retry_count    INTEGER NOT NULL DEFAULT 0,
    message_retry_count   INTEGER NOT NULL DEFAULT 0,
    submit_retry_count    INTEGER NOT NULL DEFAULT 0,
    last_attempt_at       TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_job_id ON entities(job_id);

-- Outstanding stage work units (durable broker)
CREATE TABLE IF NOT EXISTS work_units (
    id               TEXT PRIMARY KEY,
    queue            TEXT NOT NULL,
    entity_id        TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    payload          TEXT NOT NULL,
    enqueued_at      TEXT NOT NULL,
    lease_owner      TEXT,
    lease_expires_at TEXT,
    deliveries       INTEGER NOT NULL DEFAULT 0,
    UNIQUE(entity_id, queue)
);

CREATE INDEX IF NOT EXISTS idx_work_units_queue ON work_units(queue, lease_expires_at, enqueued_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
