//! trawler CLI — crawler framework for documents and structured scrapers.
//!
//! Registers crawler definitions, runs them with bounded parallelism,
//! and manages their queues, dedup state, and tags.

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
