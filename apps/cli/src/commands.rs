//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use outreach_core::{
    Dispatcher, JobReport, Monitor, Operator, SqlQueue, StageRunner, run_cleanup, run_cleanup_loop,
};
use outreach_shared::{
    AppConfig, CleanupConfig, EntityId, Job, JobId, JobStatus, MonitorConfig, PipelineConfig,
    Stage, database_path, init_config, load_config,
};
use outreach_storage::Storage;
use outreach_workers::{HttpFormSubmitter, HttpScraper, OpenRouterGenerator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Extra lease time on top of the unit timeout before a unit is redelivered.
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Refresh rate of `status --watch`.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Outreach: scrape company sites, write messages, fill contact forms.
#[derive(Parser)]
#[command(
    name = "outreach",
    version,
    about = "Run batches of company websites through scraping, message generation and contact form submission.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit a batch of website URLs as a new job.
    Submit {
        /// Website URLs.
        urls: Vec<String>,

        /// Read URLs from a file, one per line (`#` starts a comment).
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Owner recorded on the job.
        #[arg(long, default_value = "cli", env = "OUTREACH_OWNER")]
        owner: String,

        /// Leave the job PENDING for `run` to pick up instead of starting it.
        #[arg(long)]
        hold: bool,
    },

    /// Run stage workers, the stuck-process monitor and retention cleanup
    /// until interrupted.
    Run {
        /// Worker identity used for queue leases (defaults to worker-<pid>).
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Show a job's progress.
    Status {
        job: JobId,

        /// Keep refreshing with a progress bar until the job finishes.
        #[arg(short, long)]
        watch: bool,

        /// List every entity with its stage statuses.
        #[arg(short, long)]
        entities: bool,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List recent jobs.
    Jobs {
        /// Only jobs in this status.
        #[arg(long, value_parser = parse_job_status)]
        status: Option<JobStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Start a stage for every eligible entity of a job now.
    Trigger {
        job: JobId,

        /// scrape, message or submit.
        stage: Stage,
    },

    /// Put an entity back to PENDING from a stage onwards and re-dispatch it.
    Reset {
        entity: EntityId,

        /// First stage to reset.
        #[arg(long, default_value = "scrape")]
        from: Stage,
    },

    /// Cancel a pending or running job.
    Cancel { job: JobId },

    /// Run one stuck-process sweep now.
    Sweep,

    /// Delete expired FAILED jobs now.
    Cleanup {
        /// Override the configured retention period.
        #[arg(long)]
        retention_days: Option<u32>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

fn parse_job_status(s: &str) -> std::result::Result<JobStatus, String> {
    s.to_ascii_uppercase().parse().map_err(|e| format!("{e}"))
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "outreach=info",
        1 => "outreach=debug",
        _ => "outreach=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Submit {
            urls,
            file,
            owner,
            hold,
        } => cmd_submit(urls, file, &owner, hold).await,
        Command::Run { worker_id } => cmd_run(worker_id).await,
        Command::Status {
            job,
            watch,
            entities,
            json,
        } => cmd_status(&job, watch, entities, json).await,
        Command::Jobs { status, limit } => cmd_jobs(status, limit).await,
        Command::Trigger { job, stage } => cmd_trigger(&job, stage).await,
        Command::Reset { entity, from } => cmd_reset(&entity, from).await,
        Command::Cancel { job } => cmd_cancel(&job).await,
        Command::Sweep => cmd_sweep().await,
        Command::Cleanup { retention_days } => cmd_cleanup(retention_days).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Loaded config plus the store and dispatcher every command works through.
struct Pipeline {
    config: AppConfig,
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher<SqlQueue>>,
}

impl Pipeline {
    async fn open() -> Result<Self> {
        Self::open_with(false).await
    }

    /// Read-only view for inspection commands. A missing database is created
    /// read-write so a fresh install still answers.
    async fn inspect() -> Result<Self> {
        Self::open_with(true).await
    }

    async fn open_with(readonly: bool) -> Result<Self> {
        let config = load_config()?;
        let path = database_path(&config)?;
        let storage = if readonly && path.exists() {
            Storage::open_readonly(&path).await
        } else {
            Storage::open(&path).await
        };
        let storage = Arc::new(
            storage.wrap_err_with(|| format!("failed to open database at {}", path.display()))?,
        );
        let pipeline = PipelineConfig::from(&config);
        let queue = Arc::new(SqlQueue::new(
            storage.clone(),
            pipeline.unit_timeout + LEASE_GRACE,
        ));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), queue, pipeline));
        Ok(Self {
            config,
            storage,
            dispatcher,
        })
    }

    fn operator(&self) -> Operator<SqlQueue> {
        Operator::new(self.dispatcher.clone())
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(
    mut urls: Vec<String>,
    file: Option<PathBuf>,
    owner: &str,
    hold: bool,
) -> Result<()> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("cannot read URL list {}", path.display()))?;
        urls.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }
    if urls.is_empty() {
        return Err(eyre!("no URLs given: pass them as arguments or with --file"));
    }

    let pipeline = Pipeline::open().await?;
    let job = pipeline.operator().submit_batch(owner, &urls, !hold).await?;

    println!();
    println!("  Job submitted");
    println!("  ID:       {}", job.id);
    println!("  Status:   {}", job.status);
    println!("  Entities: {}", job.total_entities);
    println!();
    println!("  Track it with: outreach status {} --watch", job.id);
    println!();
    Ok(())
}

async fn cmd_run(worker_id: Option<String>) -> Result<()> {
    let pipeline = Pipeline::open().await?;
    let settings = pipeline.dispatcher.config();
    let call_timeout = settings.call_timeout;

    let scraper = Arc::new(HttpScraper::new(call_timeout)?);
    let generator = Arc::new(OpenRouterGenerator::from_config(&pipeline.config, call_timeout)?);
    let submitter = Arc::new(HttpFormSubmitter::new(call_timeout)?);
    let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));

    info!(
        worker = %worker_id,
        scrape = settings.scrape_concurrency,
        message = settings.message_concurrency,
        submit = settings.submit_concurrency,
        dispatch = ?settings.message_dispatch,
        "starting pipeline"
    );

    let shutdown = CancellationToken::new();
    let runner = Arc::new(StageRunner::new(
        pipeline.dispatcher.clone(),
        scraper,
        generator,
        submitter,
        worker_id,
    ));
    let monitor = Monitor::new(
        pipeline.dispatcher.clone(),
        MonitorConfig::from(&pipeline.config),
    );
    let intake_every = Duration::from_secs(pipeline.config.pipeline.intake_interval_secs.max(1));

    let handles = vec![
        tokio::spawn(runner.run(shutdown.clone())),
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move { monitor.run(shutdown).await }
        }),
        tokio::spawn(intake_loop(
            pipeline.operator(),
            intake_every,
            shutdown.clone(),
        )),
        tokio::spawn(run_cleanup_loop(
            pipeline.storage.clone(),
            CleanupConfig::from(&pipeline.config),
            shutdown.clone(),
        )),
    ];

    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")?;
    info!("shutdown requested, waiting for in-flight units");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "task panicked during shutdown");
        }
    }
    info!("pipeline stopped");
    Ok(())
}

/// Start PENDING jobs on every tick until cancelled.
async fn intake_loop(operator: Operator<SqlQueue>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match operator.start_pending().await {
                Ok(0) => {}
                Ok(started) => info!(jobs = started, "pending jobs started"),
                Err(e) => error!(error = %e, "job intake failed"),
            },
        }
    }
}

async fn cmd_status(job_id: &JobId, watch: bool, entities: bool, json: bool) -> Result<()> {
    let pipeline = Pipeline::inspect().await?;
    let operator = pipeline.operator();

    let report = if watch {
        watch_job(&operator, job_id).await?
    } else {
        operator.get_status(job_id).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, entities);
    }
    Ok(())
}

/// Poll the job behind a progress bar until it reaches a terminal status.
async fn watch_job(operator: &Operator<SqlQueue>, job_id: &JobId) -> Result<JobReport> {
    let mut report = operator.get_status(job_id).await?;
    let bar = ProgressBar::new(u64::from(report.job.total_entities));
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )?
        .progress_chars("=>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    loop {
        let job = &report.job;
        bar.set_position(u64::from(job.processed_count + job.failed_count));
        bar.set_message(format!(
            "{} | scrape {}/{} | message {}/{} | submit {}/{}",
            job.status,
            report.scrape.finished(),
            job.total_entities,
            report.message.finished(),
            job.total_entities,
            report.submit.finished(),
            job.total_entities,
        ));
        if job.status.is_terminal() {
            break;
        }
        tokio::time::sleep(WATCH_INTERVAL).await;
        report = operator.get_status(job_id).await?;
    }

    bar.finish_and_clear();
    Ok(report)
}

fn print_report(report: &JobReport, entities: bool) {
    let job = &report.job;
    println!();
    println!("  Job:       {}", job.id);
    println!("  Status:    {}", job.status);
    println!("  Owner:     {}", job.owner_id);
    println!(
        "  Entities:  {} total, {} processed, {} failed",
        job.total_entities, job.processed_count, job.failed_count
    );
    println!("  Created:   {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = job.processing_completed_at {
        println!("  Finished:  {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    println!(
        "  {:<8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "stage", "pending", "running", "done", "failed", "skipped"
    );
    for stage in Stage::ALL {
        let c = report.counts(stage);
        println!(
            "  {:<8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            stage.as_str(),
            c.pending,
            c.in_progress,
            c.succeeded,
            c.failed,
            c.skipped
        );
    }

    if entities {
        println!();
        for e in &report.entities {
            println!(
                "  {}  {:<11} {:<10} {:<13} {}",
                e.id,
                e.scraping_status.as_str(),
                e.message_status.as_str(),
                e.submission_status.as_str(),
                e.url
            );
            let error = e
                .scrape_error
                .as_ref()
                .or(e.message_error.as_ref())
                .or(e.submission_error.as_ref());
            if let Some(error) = error {
                println!("      error: {error}");
            }
        }
    }
    println!();
}

async fn cmd_jobs(status: Option<JobStatus>, limit: u32) -> Result<()> {
    let pipeline = Pipeline::inspect().await?;
    let jobs = pipeline.operator().list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:>5}  {:>9}  {:>6}  {}",
        "id", "status", "total", "processed", "failed", "created"
    );
    for Job {
        id,
        status,
        total_entities,
        processed_count,
        failed_count,
        created_at,
        ..
    } in &jobs
    {
        println!(
            "{:<36}  {:<10}  {:>5}  {:>9}  {:>6}  {}",
            id.to_string(),
            status.as_str(),
            total_entities,
            processed_count,
            failed_count,
            created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_trigger(job_id: &JobId, stage: Stage) -> Result<()> {
    let pipeline = Pipeline::open().await?;
    let started = pipeline.operator().trigger_stage(job_id, stage).await?;
    println!("{stage} started for {started} entities of job {job_id}");
    Ok(())
}

async fn cmd_reset(entity_id: &EntityId, from: Stage) -> Result<()> {
    let pipeline = Pipeline::open().await?;
    let dispatched = pipeline.operator().reset_entity(entity_id, from).await?;
    println!("Entity {entity_id} reset from {from}; {dispatched} unit(s) dispatched");
    Ok(())
}

async fn cmd_cancel(job_id: &JobId) -> Result<()> {
    let pipeline = Pipeline::open().await?;
    if pipeline.operator().cancel_job(job_id).await? {
        println!("Job {job_id} cancelled");
    } else {
        println!("Job {job_id} already finished; nothing to cancel");
    }
    Ok(())
}

async fn cmd_sweep() -> Result<()> {
    let pipeline = Pipeline::open().await?;
    let monitor = Monitor::new(
        pipeline.dispatcher.clone(),
        MonitorConfig::from(&pipeline.config),
    );
    let report = monitor.sweep(Utc::now()).await?;
    println!("  Stale jobs:         {}", report.jobs_restarted);
    println!("  Stages re-enqueued: {}", report.stages_restarted);
    println!("  Stages failed:      {}", report.stages_failed);
    println!("  Units dispatched:   {}", report.units_dispatched);
    println!("  Jobs finalized:     {}", report.jobs_finalized);
    Ok(())
}

async fn cmd_cleanup(retention_days: Option<u32>) -> Result<()> {
    let pipeline = Pipeline::open().await?;
    let days = retention_days.unwrap_or(pipeline.config.cleanup.retention_days);
    let report = run_cleanup(&pipeline.storage, days, Utc::now()).await?;
    println!(
        "Deleted {} job(s), {} entities, {} queued unit(s) older than {days} days",
        report.jobs_deleted, report.entities_deleted, report.units_deleted
    );
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
