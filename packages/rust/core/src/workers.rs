//! Stage worker contracts.
//!
//! Workers are pure functions of a work unit's context. They report failures
//! as [`StageError`] values and never touch the store; the stage runner turns
//! their output into a [`StageResult`] for the dispatcher.

use std::future::Future;

use outreach_shared::{
    MessageInput, MessageResult, MessageStatus, ScrapeResult, ScrapingStatus, Stage, StageError,
    SubmissionResponse, SubmissionStatus, SubmitResult,
};

use crate::forms::SubmissionPlan;

/// Fetches a website and extracts company attributes and its contact form.
pub trait Scraper: Send + Sync + 'static {
    fn scrape(&self, url: &str) -> impl Future<Output = Result<ScrapeResult, StageError>> + Send;
}

/// Writes an outreach message for one company.
pub trait MessageGenerator: Send + Sync + 'static {
    fn generate(
        &self,
        input: &MessageInput,
    ) -> impl Future<Output = Result<MessageResult, StageError>> + Send;
}

/// Sends a planned form submission.
pub trait FormSubmitter: Send + Sync + 'static {
    fn submit(
        &self,
        plan: &SubmissionPlan,
    ) -> impl Future<Output = Result<SubmissionReceipt, StageError>> + Send;
}

/// What the target site answered to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub success: bool,
    pub status_code: u16,
    pub response_url: String,
    pub excerpt: Option<String>,
}

impl SubmissionReceipt {
    /// Persistable outcome. `submitted_fields` is the payload that was sent.
    pub fn into_result(self, plan: &SubmissionPlan) -> SubmitResult {
        let response = SubmissionResponse {
            status_code: self.status_code,
            url: self.response_url,
            excerpt: self.excerpt,
        };
        let error = (!self.success)
            .then(|| format!("form rejected with HTTP {}", response.status_code));
        SubmitResult {
            status: if self.success {
                SubmissionStatus::Success
            } else {
                SubmissionStatus::Failed
            },
            submitted_fields: Some(plan.payload.clone()),
            response: Some(response),
            error,
        }
    }
}

/// A worker's final answer for one (entity, stage), ready for `advance()`.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Scrape(ScrapeResult),
    Message(MessageResult),
    Submit(SubmitResult),
}

impl StageResult {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Scrape(_) => Stage::Scrape,
            Self::Message(_) => Stage::Message,
            Self::Submit(_) => Stage::Submit,
        }
    }

    /// The terminal failure result of `stage` with `reason`.
    pub fn failed(stage: Stage, reason: impl Into<String>) -> Self {
        match stage {
            Stage::Scrape => Self::Scrape(ScrapeResult::failed(reason)),
            Stage::Message => Self::Message(MessageResult::failed(reason)),
            Stage::Submit => Self::Submit(SubmitResult::failed(reason)),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Self::Scrape(r) => r.status == ScrapingStatus::Completed,
            Self::Message(r) => r.status == MessageStatus::Generated,
            Self::Submit(r) => r.status == SubmissionStatus::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn plan() -> SubmissionPlan {
        SubmissionPlan {
            field_mapping: BTreeMap::new(),
            payload: BTreeMap::from([("email".to_string(), "ada@example.com".to_string())]),
            submit_url: "https://acme.test/contact".into(),
            method: "post".into(),
        }
    }

    #[test]
    fn receipt_keeps_sent_payload() {
        let receipt = SubmissionReceipt {
            success: true,
            status_code: 200,
            response_url: "https://acme.test/thanks".into(),
            excerpt: None,
        };
        let result = receipt.into_result(&plan());
        assert_eq!(result.status, SubmissionStatus::Success);
        assert_eq!(result.submitted_fields, Some(plan().payload));
        assert_eq!(result.response.unwrap().url, "https://acme.test/thanks");
    }

    #[test]
    fn rejected_receipt_is_failure_with_status() {
        let receipt = SubmissionReceipt {
            success: false,
            status_code: 422,
            response_url: "https://acme.test/contact".into(),
            excerpt: Some("invalid captcha".into()),
        };
        let result = receipt.into_result(&plan());
        assert_eq!(result.status, SubmissionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("form rejected with HTTP 422"));
        assert_eq!(result.response.unwrap().status_code, 422);
    }

    #[test]
    fn failed_result_matches_stage() {
        let r = StageResult::failed(Stage::Message, "no usable company name");
        assert_eq!(r.stage(), Stage::Message);
        assert!(!r.is_success());
    }
}
