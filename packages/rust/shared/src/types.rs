//! Core domain types for outreach jobs, entities and stage results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a submitted batch (UUID v7, time-sortable).
    JobId
);
uuid_id!(
    /// Identifier of one target website within a job.
    EntityId
);

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Error returned when a persisted status string is not part of its closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// The persisted column value.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_enum!(
    /// Lifecycle of a submitted batch.
    JobStatus, "job status" {
        Pending => "PENDING",
        Processing => "PROCESSING",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Cancelled => "CANCELLED",
    }
);

status_enum!(
    ScrapingStatus, "scraping status" {
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

status_enum!(
    MessageStatus, "message status" {
        Pending => "PENDING",
        Generating => "GENERATING",
        Generated => "GENERATED",
        Failed => "FAILED",
    }
);

status_enum!(
    SubmissionStatus, "submission status" {
        Pending => "PENDING",
        Submitting => "SUBMITTING",
        Success => "SUCCESS",
        Failed => "FAILED",
        NoFormFound => "NO_FORM_FOUND",
    }
);

impl JobStatus {
    /// COMPLETED, FAILED and CANCELLED never change again on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One of the three sequential per-entity stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scrape,
    Message,
    Submit,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Scrape, Stage::Message, Stage::Submit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Message => "message",
            Self::Submit => "submit",
        }
    }

    /// Name of the queue this stage's work units are routed to.
    pub fn queue_name(self) -> &'static str {
        match self {
            Self::Scrape => "outreach.scrape",
            Self::Message => "outreach.message",
            Self::Submit => "outreach.submit",
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Scrape => Some(Self::Message),
            Self::Message => Some(Self::Submit),
            Self::Submit => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scrape" | "scraping" => Ok(Self::Scrape),
            "message" | "generate" => Ok(Self::Message),
            "submit" | "submission" => Ok(Self::Submit),
            other => Err(UnknownStatus {
                kind: "stage",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Job / Entity records
// ---------------------------------------------------------------------------

/// One submitted batch of target websites.
///
/// `processed_count` and `failed_count` are derived from the entity rows and
/// are never authoritative on their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: String,
    pub status: JobStatus,
    pub total_entities: u32,
    pub processed_count: u32,
    pub failed_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_completed_at: Option<DateTime<Utc>>,
}

/// One target website and its progress through the three stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub job_id: JobId,
    pub url: String,

    pub scraping_status: ScrapingStatus,
    pub message_status: MessageStatus,
    pub submission_status: SubmissionStatus,

    // Extracted attributes
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub business_type: Option<String>,
    pub about_content: Option<String>,
    pub contact_form_url: Option<String>,
    pub has_contact_form: bool,
    /// Snapshot of the detected form, used to build the submission unit.
    pub contact_form: Option<FormDescriptor>,
    pub scrape_error: Option<String>,

    // Generation
    pub generated_message: Option<String>,
    pub message_confidence: Option<f64>,
    pub message_error: Option<String>,

    // Submission
    pub submitted_form_fields: Option<BTreeMap<String, String>>,
    pub submission_response: Option<SubmissionResponse>,
    pub submission_error: Option<String>,

    pub scrape_retry_count: u32,
    pub message_retry_count: u32,
    pub submit_retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Persisted retry counter for `stage`.
    pub fn retry_count(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Scrape => self.scrape_retry_count,
            Stage::Message => self.message_retry_count,
            Stage::Submit => self.submit_retry_count,
        }
    }

    /// Company name with surrounding whitespace removed, if anything is left.
    pub fn usable_company_name(&self) -> Option<&str> {
        self.company_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Contact forms
// ---------------------------------------------------------------------------

/// A form found on a scraped page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormDescriptor {
    /// Page the form was found on; relative actions resolve against it.
    pub page_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Upper-case HTTP method (`POST` when the page omits it).
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Visible caption text (legend, headings, aria-label).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub fields: Vec<FormField>,
}

/// One named control inside a [`FormDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Option values for selects and radio groups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Value attribute present in the markup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Input type of a form control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Email,
    Tel,
    Url,
    Number,
    Textarea,
    Select,
    Checkbox,
    Radio,
    Hidden,
    Password,
    Other,
}

impl FieldKind {
    /// Map an `<input type=...>` attribute value.
    pub fn from_input_type(input_type: &str) -> Self {
        match input_type.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "search" => Self::Text,
            "email" => Self::Email,
            "tel" => Self::Tel,
            "url" => Self::Url,
            "number" => Self::Number,
            "checkbox" => Self::Checkbox,
            "radio" => Self::Radio,
            "hidden" => Self::Hidden,
            "password" => Self::Password,
            _ => Self::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage worker contracts
// ---------------------------------------------------------------------------

/// Output of the scraper for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    /// `Completed` or `Failed`.
    pub status: ScrapingStatus,
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub business_type: Option<String>,
    pub about_content: Option<String>,
    pub contact_form_url: Option<String>,
    pub has_contact_form: bool,
    pub contact_form: Option<FormDescriptor>,
    pub error_message: Option<String>,
}

impl ScrapeResult {
    /// A successful scrape with no attributes filled in yet.
    pub fn completed() -> Self {
        Self {
            status: ScrapingStatus::Completed,
            company_name: None,
            industry: None,
            business_type: None,
            about_content: None,
            contact_form_url: None,
            has_contact_form: false,
            contact_form: None,
            error_message: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ScrapingStatus::Failed,
            error_message: Some(reason.into()),
            ..Self::completed()
        }
    }
}

/// Context handed to the message generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInput {
    pub company_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about_content: Option<String>,
    pub message_type: String,
}

/// Output of the message generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResult {
    /// `Generated` or `Failed`.
    pub status: MessageStatus,
    pub message: Option<String>,
    /// Generator confidence in `[0, 1]`.
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

impl MessageResult {
    pub fn generated(message: impl Into<String>, confidence: f64) -> Self {
        Self {
            status: MessageStatus::Generated,
            message: Some(message.into()),
            confidence: Some(confidence.clamp(0.0, 1.0)),
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Failed,
            message: None,
            confidence: None,
            error: Some(reason.into()),
        }
    }
}

/// What the target site answered to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub status_code: u16,
    /// Final URL after redirects.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// Output of the form submission stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    /// `Success`, `Failed` or `NoFormFound`.
    pub status: SubmissionStatus,
    /// Exactly the payload that was sent.
    pub submitted_fields: Option<BTreeMap<String, String>>,
    pub response: Option<SubmissionResponse>,
    pub error: Option<String>,
}

impl SubmitResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Failed,
            submitted_fields: None,
            response: None,
            error: Some(reason.into()),
        }
    }

    /// Terminal, non-error outcome for entities without a usable form.
    pub fn no_form() -> Self {
        Self {
            status: SubmissionStatus::NoFormFound,
            submitted_fields: None,
            response: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            SubmissionStatus::Pending,
            SubmissionStatus::Submitting,
            SubmissionStatus::Success,
            SubmissionStatus::Failed,
            SubmissionStatus::NoFormFound,
        ] {
            let parsed: SubmissionStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert_eq!(ScrapingStatus::InProgress.as_str(), "IN_PROGRESS");
        assert!("RESTARTING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serializes_as_column_value() {
        let json = serde_json::to_string(&SubmissionStatus::NoFormFound).unwrap();
        assert_eq!(json, r#""NO_FORM_FOUND""#);
    }

    #[test]
    fn stage_order_and_queues() {
        assert_eq!(Stage::Scrape.next(), Some(Stage::Message));
        assert_eq!(Stage::Submit.next(), None);
        assert_eq!(Stage::Message.queue_name(), "outreach.message");
        assert_eq!("Submission".parse::<Stage>().unwrap(), Stage::Submit);
    }

    #[test]
    fn field_kind_from_input_type() {
        assert_eq!(FieldKind::from_input_type("EMAIL"), FieldKind::Email);
        assert_eq!(FieldKind::from_input_type(""), FieldKind::Text);
        assert_eq!(FieldKind::from_input_type("color"), FieldKind::Other);
    }

    #[test]
    fn message_confidence_is_clamped() {
        let r = MessageResult::generated("Hello", 1.7);
        assert_eq!(r.confidence, Some(1.0));
    }
}
