//! Application configuration for the outreach pipeline.
//!
//! User config lives at `~/.outreach/outreach.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OutreachError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "outreach.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".outreach";

// ---------------------------------------------------------------------------
// Config structs (matching outreach.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Stage concurrency, dispatch and timeouts.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Backoff schedule for failed stage attempts.
    #[serde(default)]
    pub retry: RetrySection,

    /// Stuck-process monitor.
    #[serde(default)]
    pub monitor: MonitorSection,

    /// Retention cleanup.
    #[serde(default)]
    pub cleanup: CleanupSection,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Identity used to fill contact forms.
    #[serde(default)]
    pub sender: SenderConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file. A leading `~/` expands to the home dir.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.outreach/outreach.db".into()
}

/// How the message stage fans out once scraping results arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDispatch {
    /// Wait until every entity of the job has a terminal scraping status,
    /// then fan out in bounded windows.
    #[default]
    Batch,
    /// Start generation as soon as each entity's scrape completes.
    Immediate,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_scrape_concurrency")]
    pub scrape_concurrency: u32,

    #[serde(default = "default_message_concurrency")]
    pub message_concurrency: u32,

    #[serde(default = "default_submit_concurrency")]
    pub submit_concurrency: u32,

    /// Maximum message units in flight per job.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: u32,

    #[serde(default)]
    pub message_dispatch: MessageDispatch,

    /// Timeout for a single worker call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Overall budget for one unit including retries.
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,

    /// Sleep between empty queue polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often `run` looks for newly submitted jobs.
    #[serde(default = "default_intake_interval_secs")]
    pub intake_interval_secs: u64,

    /// Message type forwarded to the generator.
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            scrape_concurrency: default_scrape_concurrency(),
            message_concurrency: default_message_concurrency(),
            submit_concurrency: default_submit_concurrency(),
            dispatch_batch_size: default_dispatch_batch_size(),
            message_dispatch: MessageDispatch::default(),
            call_timeout_secs: default_call_timeout_secs(),
            unit_timeout_secs: default_unit_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            intake_interval_secs: default_intake_interval_secs(),
            message_type: default_message_type(),
        }
    }
}

fn default_scrape_concurrency() -> u32 {
    10
}
fn default_message_concurrency() -> u32 {
    5
}
fn default_submit_concurrency() -> u32 {
    5
}
fn default_dispatch_batch_size() -> u32 {
    15
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_unit_timeout_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_intake_interval_secs() -> u64 {
    5
}
fn default_message_type() -> String {
    "partnership".into()
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Attempts before a transient failure becomes terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Attempts before a rate-limited stage becomes terminal.
    #[serde(default = "default_rate_limit_max_attempts")]
    pub rate_limit_max_attempts: u32,

    #[serde(default = "default_rate_limit_base_delay_ms")]
    pub rate_limit_base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_max_attempts: default_rate_limit_max_attempts(),
            rate_limit_base_delay_ms: default_rate_limit_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_rate_limit_max_attempts() -> u32 {
    2
}
fn default_rate_limit_base_delay_ms() -> u64 {
    15_000
}

/// `[monitor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,

    /// A PROCESSING job idle for longer than this is considered stuck.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    300
}
fn default_stale_after_secs() -> u64 {
    600
}

/// `[cleanup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSection {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    /// FAILED jobs completed longer ago than this are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_cleanup_interval_secs() -> u64 {
    86_400
}
fn default_retention_days() -> u32 {
    7
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for message generation.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[sender]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    #[serde(default = "default_sender_name")]
    pub name: String,
    #[serde(default = "default_sender_email")]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub website: String,
    #[serde(default = "default_subject")]
    pub subject: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            name: default_sender_name(),
            email: default_sender_email(),
            phone: String::new(),
            company: String::new(),
            website: String::new(),
            subject: default_subject(),
        }
    }
}

fn default_sender_name() -> String {
    "Outreach Team".into()
}
fn default_sender_email() -> String {
    "outreach@example.com".into()
}
fn default_subject() -> String {
    "Partnership inquiry".into()
}

// ---------------------------------------------------------------------------
// Runtime config (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Backoff schedule for failed stage attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_base_delay: Duration,
}

impl From<&AppConfig> for RetryConfig {
    fn from(config: &AppConfig) -> Self {
        let r = &config.retry;
        Self {
            max_attempts: r.max_attempts.max(1),
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
            rate_limit_max_attempts: r.rate_limit_max_attempts.max(1),
            rate_limit_base_delay: Duration::from_millis(r.rate_limit_base_delay_ms),
        }
    }
}

/// Runtime pipeline configuration used by the dispatcher and stage runner.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scrape_concurrency: usize,
    pub message_concurrency: usize,
    pub submit_concurrency: usize,
    pub dispatch_batch_size: usize,
    pub message_dispatch: MessageDispatch,
    pub call_timeout: Duration,
    pub unit_timeout: Duration,
    pub poll_interval: Duration,
    pub message_type: String,
    pub retry: RetryConfig,
    pub sender: SenderConfig,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            scrape_concurrency: p.scrape_concurrency.max(1) as usize,
            message_concurrency: p.message_concurrency.max(1) as usize,
            submit_concurrency: p.submit_concurrency.max(1) as usize,
            dispatch_batch_size: p.dispatch_batch_size.max(1) as usize,
            message_dispatch: p.message_dispatch,
            call_timeout: Duration::from_secs(p.call_timeout_secs),
            unit_timeout: Duration::from_secs(p.unit_timeout_secs),
            poll_interval: Duration::from_millis(p.poll_interval_ms),
            message_type: p.message_type.clone(),
            retry: RetryConfig::from(config),
            sender: config.sender.clone(),
        }
    }
}

/// Runtime configuration of the stuck-process monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub stale_after: Duration,
    /// Stall resets allowed before a stage is failed.
    pub max_retries: u32,
}

impl From<&AppConfig> for MonitorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.monitor.interval_secs),
            stale_after: Duration::from_secs(config.monitor.stale_after_secs),
            max_retries: config.retry.max_attempts.max(1),
        }
    }
}

/// Runtime configuration of the retention cleanup.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub retention_days: u32,
}

impl From<&AppConfig> for CleanupConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.cleanup.interval_secs),
            retention_days: config.cleanup.retention_days,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.outreach/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| OutreachError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.outreach/outreach.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| OutreachError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| OutreachError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| OutreachError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| OutreachError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| OutreachError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve `[database] path`, expanding a leading `~/`.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    let raw = config.database.path.as_str();
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| OutreachError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Read the OpenRouter API key from the configured env var.
pub fn openrouter_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(OutreachError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}
