//! Test fixtures: entity snapshots, temp databases, scripted workers.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use outreach_shared::{
    AppConfig, Entity, EntityId, FieldKind, FormDescriptor, FormField, JobId, MessageDispatch,
    MessageInput, MessageResult, MessageStatus, PipelineConfig, ScrapeResult, ScrapingStatus,
    StageError, SubmissionStatus,
};
use outreach_storage::Storage;

use crate::dispatcher::Dispatcher;
use crate::forms::SubmissionPlan;
use crate::queue::SqlQueue;
use crate::workers::{FormSubmitter, MessageGenerator, Scraper, SubmissionReceipt};

/// A fresh entity with every stage PENDING.
pub fn entity() -> Entity {
    let now = Utc::now();
    Entity {
        id: EntityId::new(),
        job_id: JobId::new(),
        url: "https://example.test".into(),
        scraping_status: ScrapingStatus::Pending,
        message_status: MessageStatus::Pending,
        submission_status: SubmissionStatus::Pending,
        company_name: None,
        industry: None,
        business_type: None,
        about_content: None,
        contact_form_url: None,
        has_contact_form: false,
        contact_form: None,
        scrape_error: None,
        generated_message: None,
        message_confidence: None,
        message_error: None,
        submitted_form_fields: None,
        submission_response: None,
        submission_error: None,
        scrape_retry_count: 0,
        message_retry_count: 0,
        submit_retry_count: 0,
        last_attempt_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub async fn temp_storage() -> (Storage, PathBuf) {
    let path = std::env::temp_dir().join(format!("outreach_core_test_{}.db", uuid::Uuid::now_v7()));
    let storage = Storage::open(&path).await.unwrap();
    (storage, path)
}

/// Pipeline config with zero backoff so retry paths run instantly.
pub fn pipeline_config() -> PipelineConfig {
    let mut config = PipelineConfig::from(&AppConfig::default());
    config.retry.base_delay = Duration::ZERO;
    config.retry.max_delay = Duration::ZERO;
    config.retry.rate_limit_base_delay = Duration::ZERO;
    config.poll_interval = Duration::from_millis(10);
    config.call_timeout = Duration::from_secs(5);
    config.unit_timeout = Duration::from_secs(10);
    config.message_dispatch = MessageDispatch::Batch;
    config
}

pub struct Harness {
    pub storage: Arc<Storage>,
    pub queue: Arc<SqlQueue>,
    pub dispatcher: Arc<Dispatcher<SqlQueue>>,
    pub path: PathBuf,
}

impl Harness {
    pub async fn new(config: PipelineConfig) -> Self {
        let (storage, path) = temp_storage().await;
        let storage = Arc::new(storage);
        let queue = Arc::new(SqlQueue::new(storage.clone(), Duration::from_secs(60)));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), queue.clone(), config));
        Self {
            storage,
            queue,
            dispatcher,
            path,
        }
    }

    pub async fn queued(&self, stage: outreach_shared::Stage) -> usize {
        self.storage
            .list_work_units(Some(stage.queue_name()))
            .await
            .unwrap()
            .len()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A contact form with name, email and message fields.
pub fn contact_form(page_url: &str) -> FormDescriptor {
    FormDescriptor {
        page_url: page_url.to_string(),
        action: Some("/contact/send".into()),
        method: "post".into(),
        id: Some("contact-form".into()),
        class: None,
        caption: Some("Get in touch".into()),
        fields: vec![
            field("your-name", FieldKind::Text, true),
            field("your-email", FieldKind::Email, true),
            field("your-message", FieldKind::Textarea, true),
        ],
    }
}

pub fn field(name: &str, kind: FieldKind, required: bool) -> FormField {
    FormField {
        name: name.to_string(),
        id: None,
        placeholder: None,
        kind,
        required,
        options: Vec::new(),
        value: None,
    }
}

/// Scrape result for a site named `name`, with or without a contact form.
pub fn scraped(name: &str, url: &str, with_form: bool) -> ScrapeResult {
    let mut result = ScrapeResult::completed();
    result.company_name = Some(name.to_string());
    result.industry = Some("Software".into());
    result.about_content = Some(format!("{name} builds things."));
    if with_form {
        result.has_contact_form = true;
        result.contact_form_url = Some(format!("{url}/contact"));
        result.contact_form = Some(contact_form(&format!("{url}/contact")));
    }
    result
}

// ---------------------------------------------------------------------------
// Scripted workers
// ---------------------------------------------------------------------------

/// Scraper that answers per URL; URLs without a script get a failure.
#[derive(Default)]
pub struct FakeScraper {
    pub scripts: Mutex<Vec<(String, VecDeque<Result<ScrapeResult, StageError>>)>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeScraper {
    pub fn script(&self, url: &str, answers: Vec<Result<ScrapeResult, StageError>>) {
        self.scripts
            .lock()
            .unwrap()
            .push((url.to_string(), answers.into()));
    }
}

impl Scraper for FakeScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapeResult, StageError> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.iter_mut().find(|(u, _)| u == url) {
            Some((_, answers)) if answers.len() > 1 => answers.pop_front().unwrap(),
            Some((_, answers)) => answers.front().cloned().unwrap(),
            None => Err(StageError::permanent("unscripted url")),
        }
    }
}

/// Generator that writes a fixed message for every company.
#[derive(Default)]
pub struct FakeGenerator {
    pub calls: Mutex<Vec<MessageInput>>,
}

impl MessageGenerator for FakeGenerator {
    async fn generate(&self, input: &MessageInput) -> Result<MessageResult, StageError> {
        self.calls.lock().unwrap().push(input.clone());
        Ok(MessageResult::generated(
            format!("Hello {}, let's work together.", input.company_name),
            0.9,
        ))
    }
}

/// Submitter that accepts everything and records the payloads it was given.
#[derive(Default)]
pub struct FakeSubmitter {
    pub plans: Mutex<Vec<SubmissionPlan>>,
}

impl FormSubmitter for FakeSubmitter {
    async fn submit(&self, plan: &SubmissionPlan) -> Result<SubmissionReceipt, StageError> {
        self.plans.lock().unwrap().push(plan.clone());
        Ok(SubmissionReceipt {
            success: true,
            status_code: 200,
            response_url: plan.submit_url.clone(),
            excerpt: Some("Thanks for reaching out".into()),
        })
    }
}
