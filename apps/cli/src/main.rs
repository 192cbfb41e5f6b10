//! Outreach CLI: batch intake, pipeline workers and operator commands.
//!
//! Submits batches of company websites and runs them through scraping,
//! message generation and contact form submission.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
