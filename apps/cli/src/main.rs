//! reposcrape CLI: incremental repository ingestion.
//!
//! Fetches the repository feed, regenerates summaries only for repositories
//! whose change marker moved, uploads them to the object store, and can
//! trigger a search index re-import.

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
