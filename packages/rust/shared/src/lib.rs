//! Shared types, error model, and configuration for the outreach pipeline.
//!
//! This crate is the foundation depended on by all other outreach crates.
//! It provides:
//! - [`OutreachError`] and [`StageError`]: the error model
//! - Domain types ([`Job`], [`Entity`], [`Stage`], the status enums, stage results)
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CleanupConfig, CleanupSection, DatabaseConfig, MessageDispatch, MonitorConfig,
    MonitorSection, OpenRouterConfig, PipelineConfig, PipelineSection, RetryConfig, RetrySection,
    SenderConfig, config_dir, config_file_path, database_path, init_config, load_config,
    load_config_from, openrouter_api_key,
};
pub use error::{OutreachError, Result, StageError};
pub use types::{
    Entity, EntityId, FieldKind, FormDescriptor, FormField, Job, JobId, JobStatus, MessageInput,
    MessageResult, MessageStatus, ScrapeResult, ScrapingStatus, Stage, SubmissionResponse,
    SubmissionStatus, SubmitResult, UnknownStatus,
};
