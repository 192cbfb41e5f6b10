//! Row decoding shared by [`crate::Storage`] and [`crate::StoreTx`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use outreach_shared::{Entity, EntityId, Job, JobId, OutreachError, Result};

use crate::{WorkUnitRow, db_err};

pub(crate) const JOB_COLUMNS: &str = "id, owner_id, status, total_entities, processed_count, \
     failed_count, created_at, updated_at, processing_started_at, processing_completed_at";

pub(crate) const ENTITY_COLUMNS: &str = "id, job_id, url, scraping_status, message_status, \
     submission_status, company_name, industry, business_type, about_content, contact_form_url, \
     has_contact_form, contact_form_json, scrape_error, generated_message, message_confidence, \
     message_error, submitted_form_fields, submission_response, submission_error, \
     scrape_retry_count, message_retry_count, submit_retry_count, last_attempt_at, created_at, \
     updated_at";

pub(crate) const WORK_UNIT_COLUMNS: &str =
    "id, queue, entity_id, payload, enqueued_at, lease_owner, lease_expires_at, deliveries";

// ---------------------------------------------------------------------------
// Fetch helpers
// ---------------------------------------------------------------------------

pub(crate) async fn fetch_job(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_job(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn fetch_entity(conn: &Connection, id: &EntityId) -> Result<Option<Entity>> {
    let mut rows = conn
        .query(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_entity(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn fetch_entities(conn: &Connection, job_id: &JobId) -> Result<Vec<Entity>> {
    let mut rows = conn
        .query(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE job_id = ?1 ORDER BY id"),
            params![job_id.to_string()],
        )
        .await
        .map_err(db_err)?;

    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_entity(&row)?);
    }
    Ok(results)
}

pub(crate) async fn fetch_work_unit(conn: &Connection, id: &str) -> Result<Option<WorkUnitRow>> {
    let mut rows = conn
        .query(
            &format!("SELECT {WORK_UNIT_COLUMNS} FROM work_units WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_work_unit(&row)?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

/// Convert a database row to a [`Job`].
pub(crate) fn row_to_job(row: &Row) -> Result<Job> {
    Ok(Job {
        id: parse_id(&text(row, 0)?)?,
        owner_id: text(row, 1)?,
        status: parse_enum(&text(row, 2)?)?,
        total_entities: count(row, 3)?,
        processed_count: count(row, 4)?,
        failed_count: count(row, 5)?,
        created_at: time(row, 6)?,
        updated_at: time(row, 7)?,
        processing_started_at: opt_time(row, 8)?,
        processing_completed_at: opt_time(row, 9)?,
    })
}

/// Convert a database row to an [`Entity`].
pub(crate) fn row_to_entity(row: &Row) -> Result<Entity> {
    Ok(Entity {
        id: parse_id(&text(row, 0)?)?,
        job_id: parse_id(&text(row, 1)?)?,
        url: text(row, 2)?,
        scraping_status: parse_enum(&text(row, 3)?)?,
        message_status: parse_enum(&text(row, 4)?)?,
        submission_status: parse_enum(&text(row, 5)?)?,
        company_name: row.get::<String>(6).ok(),
        industry: row.get::<String>(7).ok(),
        business_type: row.get::<String>(8).ok(),
        about_content: row.get::<String>(9).ok(),
        contact_form_url: row.get::<String>(10).ok(),
        has_contact_form: row.get::<i64>(11).map_err(db_err)? != 0,
        contact_form: opt_json(row, 12)?,
        scrape_error: row.get::<String>(13).ok(),
        generated_message: row.get::<String>(14).ok(),
        message_confidence: row.get::<f64>(15).ok(),
        message_error: row.get::<String>(16).ok(),
        submitted_form_fields: opt_json(row, 17)?,
        submission_response: opt_json(row, 18)?,
        submission_error: row.get::<String>(19).ok(),
        scrape_retry_count: count(row, 20)?,
        message_retry_count: count(row, 21)?,
        submit_retry_count: count(row, 22)?,
        last_attempt_at: opt_time(row, 23)?,
        created_at: time(row, 24)?,
        updated_at: time(row, 25)?,
    })
}

/// Convert a database row to a [`WorkUnitRow`].
pub(crate) fn row_to_work_unit(row: &Row) -> Result<WorkUnitRow> {
    Ok(WorkUnitRow {
        id: text(row, 0)?,
        queue: text(row, 1)?,
        entity_id: parse_id(&text(row, 2)?)?,
        payload: text(row, 3)?,
        enqueued_at: time(row, 4)?,
        lease_owner: row.get::<String>(5).ok(),
        lease_expires_at: opt_time(row, 6)?,
        deliveries: count(row, 7)?,
    })
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn text(row: &Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(db_err)
}

fn count(row: &Row, idx: i32) -> Result<u32> {
    let v: i64 = row.get(idx).map_err(db_err)?;
    u32::try_from(v).map_err(|_| OutreachError::Storage(format!("counter out of range: {v}")))
}

fn time(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_time(&text(row, idx)?)
}

fn opt_time(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    row.get::<String>(idx).ok().map(|s| parse_time(&s)).transpose()
}

fn opt_json<T: serde::de::DeserializeOwned>(row: &Row, idx: i32) -> Result<Option<T>> {
    match row.get::<String>(idx).ok() {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| OutreachError::Storage(format!("invalid JSON in column {idx}: {e}"))),
        None => Ok(None),
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OutreachError::Storage(format!("invalid date: {e}")))
}

pub(crate) fn parse_id<T: FromStr<Err = uuid::Error>>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|e| OutreachError::Storage(format!("invalid id '{s}': {e}")))
}

fn parse_enum<T: FromStr>(s: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| OutreachError::Storage(e.to_string()))
}
