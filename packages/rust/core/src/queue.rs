//! Stage work units and the durable queue they travel through.
//!
//! A unit carries everything its worker needs (no live references), so a
//! worker never has to read the store to do its job. Units are published
//! inside the dispatcher's transaction: the in-progress mark and the unit
//! become visible together or not at all.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use outreach_shared::{
    Entity, EntityId, FormDescriptor, MessageInput, OutreachError, Result, Stage,
};
use outreach_storage::{Storage, StoreTx};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::state::StartRejection;

// ---------------------------------------------------------------------------
// Work units
// ---------------------------------------------------------------------------

/// Serializable unit of stage work for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub entity_id: EntityId,
    #[serde(flatten)]
    pub payload: UnitPayload,
}

/// Stage-specific context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum UnitPayload {
    Scrape { url: String },
    Message { input: MessageInput },
    Submit { form: FormDescriptor, message: String },
}

impl WorkUnit {
    pub fn stage(&self) -> Stage {
        match self.payload {
            UnitPayload::Scrape { .. } => Stage::Scrape,
            UnitPayload::Message { .. } => Stage::Message,
            UnitPayload::Submit { .. } => Stage::Submit,
        }
    }

    /// Build the unit for `stage` from the entity's persisted attributes.
    pub fn for_entity(
        entity: &Entity,
        stage: Stage,
        message_type: &str,
    ) -> std::result::Result<Self, StartRejection> {
        let payload = match stage {
            Stage::Scrape => UnitPayload::Scrape {
                url: entity.url.clone(),
            },
            Stage::Message => {
                let company_name = entity
                    .usable_company_name()
                    .ok_or(StartRejection::NoCompanyName)?;
                UnitPayload::Message {
                    input: MessageInput {
                        company_name: company_name.to_string(),
                        industry: entity.industry.clone(),
                        business_type: entity.business_type.clone(),
                        about_content: entity.about_content.clone(),
                        message_type: message_type.to_string(),
                    },
                }
            }
            Stage::Submit => {
                let form = entity
                    .contact_form
                    .clone()
                    .ok_or(StartRejection::NoContactForm)?;
                let message = entity
                    .generated_message
                    .clone()
                    .ok_or(StartRejection::MessageNotGenerated)?;
                UnitPayload::Submit { form, message }
            }
        };
        Ok(Self {
            entity_id: entity.id.clone(),
            payload,
        })
    }
}

/// A claimed unit. Must be acked or released by whoever claimed it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub unit: WorkUnit,
    /// 1 on first delivery, higher after lease expiry or release.
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Queue trait
// ---------------------------------------------------------------------------

/// At-least-once broker for stage work units, one named queue per stage.
pub trait WorkQueue: Send + Sync + 'static {
    /// Enqueue `unit` as part of the caller's transaction. Replaces any
    /// outstanding unit for the same entity and stage.
    fn publish(&self, tx: &StoreTx, unit: &WorkUnit) -> impl Future<Output = Result<String>> + Send;

    /// Lease the next available unit of `stage` to `worker`.
    fn claim(
        &self,
        stage: Stage,
        worker: &str,
    ) -> impl Future<Output = Result<Option<Delivery>>> + Send;

    /// Remove a delivered unit for good.
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<bool>> + Send;

    /// Hand a unit back for redelivery after `delay`.
    fn release(
        &self,
        delivery: &Delivery,
        worker: &str,
        delay: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;
}

// ---------------------------------------------------------------------------
// libSQL-backed queue
// ---------------------------------------------------------------------------

/// Durable queue stored in the same database as jobs and entities.
///
/// A claimed unit is leased for `lease`; if the claimer dies the lease runs
/// out and the unit is handed out again.
pub struct SqlQueue {
    storage: Arc<Storage>,
    lease: Duration,
}

impl SqlQueue {
    pub fn new(storage: Arc<Storage>, lease: Duration) -> Self {
        Self { storage, lease }
    }
}

impl WorkQueue for SqlQueue {
    async fn publish(&self, tx: &StoreTx, unit: &WorkUnit) -> Result<String> {
        let payload = serde_json::to_string(unit)
            .map_err(|e| OutreachError::Queue(format!("failed to encode unit: {e}")))?;
        let id = tx
            .insert_work_unit(unit.stage().queue_name(), &unit.entity_id, &payload)
            .await?;
        debug!(unit = %id, entity = %unit.entity_id, stage = %unit.stage(), "unit published");
        Ok(id)
    }

    async fn claim(&self, stage: Stage, worker: &str) -> Result<Option<Delivery>> {
        let Some(row) = self
            .storage
            .claim_work_unit(stage.queue_name(), worker, self.lease)
            .await?
        else {
            return Ok(None);
        };

        match serde_json::from_str::<WorkUnit>(&row.payload) {
            Ok(unit) if unit.stage() == stage => Ok(Some(Delivery {
                id: row.id,
                unit,
                attempt: row.deliveries,
            })),
            Ok(unit) => {
                error!(unit = %row.id, queue = %row.queue, stage = %unit.stage(), "unit on wrong queue, dropping");
                self.storage.ack_work_unit(&row.id).await?;
                Ok(None)
            }
            Err(e) => {
                error!(unit = %row.id, queue = %row.queue, error = %e, "undecodable unit, dropping");
                self.storage.ack_work_unit(&row.id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        self.storage.ack_work_unit(&delivery.id).await
    }

    async fn release(&self, delivery: &Delivery, worker: &str, delay: Duration) -> Result<bool> {
        self.storage
            .release_work_unit(&delivery.id, worker, delay)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{entity, temp_storage};

    #[test]
    fn unit_wire_format_names_the_stage() {
        let mut e = entity();
        e.url = "https://acme.test".into();
        let unit = WorkUnit::for_entity(&e, Stage::Scrape, "partnership").unwrap();
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["stage"], "scrape");
        assert_eq!(json["url"], "https://acme.test");
        assert_eq!(json["entity_id"], e.id.to_string());
    }

    #[test]
    fn message_unit_needs_company_name() {
        let e = entity();
        assert_eq!(
            WorkUnit::for_entity(&e, Stage::Message, "partnership"),
            Err(StartRejection::NoCompanyName)
        );

        let mut named = entity();
        named.company_name = Some("  Acme Corp ".into());
        named.industry = Some("Robotics".into());
        let unit = WorkUnit::for_entity(&named, Stage::Message, "partnership").unwrap();
        match unit.payload {
            UnitPayload::Message { input } => {
                assert_eq!(input.company_name, "Acme Corp");
                assert_eq!(input.industry.as_deref(), Some("Robotics"));
                assert_eq!(input.message_type, "partnership");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_claim_ack() {
        let (storage, path) = temp_storage().await;
        let storage = Arc::new(storage);
        let queue = SqlQueue::new(storage.clone(), Duration::from_secs(60));
        let (_, entities) = storage
            .create_job("owner", &["https://a.test".to_string()])
            .await
            .unwrap();

        let unit = WorkUnit::for_entity(&entities[0], Stage::Scrape, "partnership").unwrap();
        let tx = storage.begin().await.unwrap();
        queue.publish(&tx, &unit).await.unwrap();
        tx.commit().await.unwrap();

        assert!(queue.claim(Stage::Message, "w1").await.unwrap().is_none());
        let delivery = queue.claim(Stage::Scrape, "w1").await.unwrap().unwrap();
        assert_eq!(delivery.unit, unit);
        assert_eq!(delivery.attempt, 1);

        // Leased: nobody else gets it
        assert!(queue.claim(Stage::Scrape, "w2").await.unwrap().is_none());

        assert!(queue.ack(&delivery).await.unwrap());
        assert!(storage.list_work_units(None).await.unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn released_unit_is_redelivered() {
        let (storage, path) = temp_storage().await;
        let storage = Arc::new(storage);
        let queue = SqlQueue::new(storage.clone(), Duration::from_secs(60));
        let (_, entities) = storage
            .create_job("owner", &["https://a.test".to_string()])
            .await
            .unwrap();

        let unit = WorkUnit::for_entity(&entities[0], Stage::Scrape, "partnership").unwrap();
        let tx = storage.begin().await.unwrap();
        queue.publish(&tx, &unit).await.unwrap();
        tx.commit().await.unwrap();

        let first = queue.claim(Stage::Scrape, "w1").await.unwrap().unwrap();
        assert!(queue.release(&first, "w1", Duration::ZERO).await.unwrap());

        let second = queue.claim(Stage::Scrape, "w2").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn garbage_payload_is_dropped() {
        let (storage, path) = temp_storage().await;
        let storage = Arc::new(storage);
        let queue = SqlQueue::new(storage.clone(), Duration::from_secs(60));
        let (_, entities) = storage
            .create_job("owner", &["https://a.test".to_string()])
            .await
            .unwrap();

        let tx = storage.begin().await.unwrap();
        tx.insert_work_unit(Stage::Scrape.queue_name(), &entities[0].id, "{not json")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(queue.claim(Stage::Scrape, "w1").await.unwrap().is_none());
        assert!(storage.list_work_units(None).await.unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
