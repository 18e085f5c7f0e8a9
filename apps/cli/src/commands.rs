//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use reposcrape_cache::{ChangeMarkerCache, HttpCache, LibsqlCache};
use reposcrape_core::orchestrator::format_duration;
use reposcrape_core::{
    CommandGenerator, ItemOutcome, Orchestrator, ProgressReporter, RunStatistics,
};
use reposcrape_feed::{FeedOptions, fetch_repositories, select_shard};
use reposcrape_index::{DocumentImportTrigger, IndexReconciler, ReconciliationMode};
use reposcrape_shared::{
    AppConfig, CacheBackendKind, CacheConfig, CacheKey, PipelineConfig, RunId, init_config,
    load_config, load_config_from,
};
use reposcrape_store::{ObjectStoreBackend, RetryPolicy, UploadClient};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Keep repository summaries in sync with their sources.
#[derive(Parser)]
#[command(
    name = "reposcrape",
    version,
    about = "Incrementally summarise repositories from a feed and upload the results.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.reposcrape/reposcrape.toml).
    #[arg(long, global = true, env = "REPOSCRAPE_CONFIG")]
    pub config: Option<PathBuf>,

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
    /// Fetch the feed and process this worker's shard.
    Run {
        /// Feed URL (overrides config).
        #[arg(long)]
        feed_url: Option<String>,

        /// Number of parallel workers splitting the feed.
        #[arg(long, default_value_t = 1)]
        batch_size: usize,

        /// This worker's position, 0 to batch-size - 1.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Report what would be processed without generating or uploading.
        #[arg(long)]
        dry_run: bool,

        /// Items processed concurrently (overrides config).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Trigger an incremental index import after the run.
        #[arg(long)]
        reconcile: bool,

        /// Exit non-zero if any item failed.
        #[arg(long)]
        fail_on_errors: bool,
    },

    /// Trigger a search index import.
    Reconcile {
        /// incremental or full.
        #[arg(long, default_value = "incremental")]
        mode: String,
    },

    /// Inspect or clear the change-marker cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show recent runs and the last index reconciliation.
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Delete entries whose key starts with a prefix (all entries by default).
    Clear {
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Print the stored change marker for `org/name`.
    Get { key: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "reposcrape=info",
        1 => "reposcrape=debug",
        _ => "reposcrape=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            feed_url,
            batch_size,
            offset,
            dry_run,
            concurrency,
            reconcile,
            fail_on_errors,
        } => {
            let opts = RunOptions {
                feed_url,
                batch_size,
                offset,
                dry_run,
                concurrency,
                reconcile,
                fail_on_errors,
            };
            cmd_run(config_path, opts).await
        }
        Command::Reconcile { mode } => cmd_reconcile(config_path, &mode).await,
        Command::Cache { action } => match action {
            CacheAction::Clear { prefix } => cmd_cache_clear(config_path, &prefix).await,
            CacheAction::Get { key } => cmd_cache_get(config_path, &key).await,
        },
        Command::History { limit } => cmd_history(config_path, limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Cache wiring
// ---------------------------------------------------------------------------

/// The configured cache adapter. Only libSQL keeps run history.
enum CacheHandle {
    Libsql(Arc<LibsqlCache>),
    Http(Arc<HttpCache>),
}

impl CacheHandle {
    async fn open(config: &CacheConfig) -> Result<Self> {
        let handle = match config.backend {
            CacheBackendKind::Libsql => {
                let path = config.db_path()?;
                Self::Libsql(Arc::new(LibsqlCache::open(&path, &config.namespace).await?))
            }
            CacheBackendKind::Http => Self::Http(Arc::new(HttpCache::new(
                &config.worker_url,
                &config.namespace,
                Duration::from_secs(config.timeout_secs),
            )?)),
        };
        Ok(handle)
    }

    fn shared(&self) -> Arc<dyn ChangeMarkerCache> {
        match self {
            Self::Libsql(cache) => Arc::clone(cache) as Arc<dyn ChangeMarkerCache>,
            Self::Http(cache) => Arc::clone(cache) as Arc<dyn ChangeMarkerCache>,
        }
    }

    fn history(&self) -> Option<&LibsqlCache> {
        match self {
            Self::Libsql(cache) => Some(cache),
            Self::Http(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    feed_url: Option<String>,
    batch_size: usize,
    offset: usize,
    dry_run: bool,
    concurrency: Option<usize>,
    reconcile: bool,
    fail_on_errors: bool,
}

async fn cmd_run(config_path: Option<&Path>, opts: RunOptions) -> Result<()> {
    let config = resolve_config(config_path)?;

    let feed_url = match &opts.feed_url {
        Some(url) => Url::parse(url).map_err(|e| eyre!("invalid feed URL '{url}': {e}"))?,
        None => config.feed.feed_url()?,
    };

    let mut pipeline = PipelineConfig::from(&config);
    if let Some(concurrency) = opts.concurrency {
        pipeline.concurrency = concurrency.max(1);
    }

    let repos = fetch_repositories(&feed_url, &FeedOptions::from(&config.feed)).await?;
    let shard = select_shard(repos, opts.batch_size, opts.offset)?;

    let cache = CacheHandle::open(&config.cache).await?;
    let backend = ObjectStoreBackend::from_config(&config.store)?;
    let uploader = Arc::new(UploadClient::new(
        Arc::new(backend),
        RetryPolicy::from(&config.store),
    ));
    let generator = Arc::new(CommandGenerator::from(&config.generator));
    let orchestrator = Orchestrator::new(cache.shared(), uploader.clone(), generator, pipeline);

    if opts.dry_run {
        let plan = orchestrator.plan(&shard).await?;
        println!();
        println!("  Dry run (nothing generated or uploaded)");
        println!("  Would process: {}", plan.to_process.len());
        println!("  Cache hits:    {}", plan.cache_hits.len());
        println!("  Invalid:       {}", plan.invalid.len());
        for key in &plan.to_process {
            println!("    + {key}");
        }
        for (label, reason) in &plan.invalid {
            println!("    ! {label}: {reason}");
        }
        println!();
        return Ok(());
    }

    let run_id = RunId::new();
    if let Some(history) = cache.history() {
        history.insert_run(&run_id).await?;
    }

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone())?;

    info!(
        %run_id,
        feed = %feed_url,
        batch_size = opts.batch_size,
        offset = opts.offset,
        items = shard.len(),
        "starting run"
    );

    let reporter = CliProgress::new(shard.len() as u64);
    let stats = orchestrator.run(shard, &reporter, cancel).await?;

    if let Some(history) = cache.history() {
        history
            .finish_run(&run_id, &serde_json::to_string(&stats)?)
            .await?;
    }
    info!(totals = %uploader.totals().to_json(), "object store totals");
    print_statistics(&run_id, &stats);

    if opts.reconcile {
        if stats.uploads == 0 {
            info!("no new uploads, skipping index reconciliation");
        } else {
            match trigger_reconciliation(&config, &cache, ReconciliationMode::Incremental).await {
                Ok(operation) => println!("  Index import started: {operation}"),
                // The run itself succeeded; the next reconciliation picks up these uploads.
                Err(e) => warn!(error = %e, "index reconciliation failed"),
            }
        }
    }

    if opts.fail_on_errors && stats.errors > 0 {
        return Err(eyre!("{} of {} items failed", stats.errors, stats.total_items));
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C, or on SIGTERM where available (container stop).
fn cancel_on_shutdown(token: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let signal = tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "interrupt"),
            _ = terminate.recv() => Ok("terminate"),
        };
        #[cfg(not(unix))]
        let signal = tokio::signal::ctrl_c().await.map(|()| "interrupt");

        match signal {
            Ok(signal) => {
                warn!(signal, "shutdown requested, finishing in-flight items");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for shutdown signals"),
        }
    });
    Ok(())
}

fn print_statistics(run_id: &RunId, stats: &RunStatistics) {
    println!();
    println!("  Run {run_id} complete");
    println!("  Total:        {}", stats.total_items);
    println!("  Processed:    {}", stats.processed);
    println!(
        "  Cache hits:   {} ({:.1}%)",
        stats.cache_hits,
        stats.cache_hit_rate()
    );
    println!("  Uploads:      {}", stats.uploads);
    println!(
        "  Errors:       {} (validation {}, generation {}, upload {}, cache write {})",
        stats.errors,
        stats.validation_errors,
        stats.generation_errors,
        stats.upload_errors,
        stats.cache_write_errors
    );
    if stats.cancelled > 0 {
        println!("  Cancelled:    {}", stats.cancelled);
    }
    println!("  Time:         {}", format_duration(stats.elapsed));
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn item_finished(&self, label: &str, outcome: &ItemOutcome, _completed: u64, _total: u64) {
        if let ItemOutcome::Failed(failure) = outcome {
            self.bar.println(format!("  ✗ {label}: {failure}"));
        }
        self.bar.inc(1);
        self.bar.set_message(label.to_string());
    }

    fn done(&self, _stats: &RunStatistics) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

async fn trigger_reconciliation(
    config: &AppConfig,
    cache: &CacheHandle,
    mode: ReconciliationMode,
) -> Result<String> {
    let trigger = DocumentImportTrigger::from_config(&config.index)?
        .ok_or_else(|| eyre!("index.endpoint is not configured"))?;
    let handle = trigger.reconcile(mode).await?;

    if let Some(history) = cache.history() {
        history
            .record_reconciliation(&handle.name, &handle.mode.to_string())
            .await?;
    }
    Ok(handle.name)
}

async fn cmd_reconcile(config_path: Option<&Path>, mode: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let mode: ReconciliationMode = mode.parse()?;
    let cache = CacheHandle::open(&config.cache).await?;

    let operation = trigger_reconciliation(&config, &cache, mode).await?;
    println!("Index import ({mode}) started: {operation}");
    Ok(())
}

// ---------------------------------------------------------------------------
// cache / history
// ---------------------------------------------------------------------------

async fn cmd_cache_clear(config_path: Option<&Path>, prefix: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let cache = CacheHandle::open(&config.cache).await?;
    let deleted = cache.shared().delete_all(prefix).await?;
    println!(
        "Deleted {deleted} cache entries from namespace '{}'",
        config.cache.namespace
    );
    Ok(())
}

async fn cmd_cache_get(config_path: Option<&Path>, key: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let key: CacheKey = key.parse()?;
    let cache = CacheHandle::open(&config.cache).await?;

    match cache.shared().get(&key).await? {
        Some(marker) => println!("{key}: {marker}"),
        None => println!("{key}: not cached"),
    }
    Ok(())
}

async fn cmd_history(config_path: Option<&Path>, limit: u32) -> Result<()> {
    let config = resolve_config(config_path)?;
    if config.cache.backend != CacheBackendKind::Libsql {
        return Err(eyre!("run history is only kept by the libsql cache backend"));
    }
    let history = LibsqlCache::open_readonly(&config.cache.db_path()?, &config.cache.namespace).await?;

    let runs = history.list_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
    }
    for run in &runs {
        let summary = run
            .stats_json
            .as_deref()
            .and_then(|json| serde_json::from_str::<RunStatistics>(json).ok())
            .map(|s| {
                format!(
                    "total {} processed {} hits {} errors {}",
                    s.total_items, s.processed, s.cache_hits, s.errors
                )
            })
            .unwrap_or_else(|| "unfinished".to_string());
        println!(
            "{}  {}  {summary}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.id
        );
    }

    match history.last_reconciliation().await? {
        Some(last) => println!(
            "\nLast reconciliation: {} ({}) at {}",
            last.operation,
            last.mode,
            last.submitted_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("\nNo reconciliation recorded."),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "reposcrape",
            "run",
            "--batch-size",
            "10",
            "--offset",
            "3",
            "--dry-run",
            "--concurrency",
            "8",
        ]);
        match cli.command {
            Command::Run {
                batch_size,
                offset,
                dry_run,
                concurrency,
                reconcile,
                ..
            } => {
                assert_eq!(batch_size, 10);
                assert_eq!(offset, 3);
                assert!(dry_run);
                assert_eq!(concurrency, Some(8));
                assert!(!reconcile);
            }
            _ => panic!("expected run"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_signal_cancels_the_run() {
        let token = CancellationToken::new();
        cancel_on_shutdown(token.clone()).unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token cancelled");
    }

    #[test]
    fn cache_clear_defaults_to_everything() {
        let cli = Cli::parse_from(["reposcrape", "cache", "clear"]);
        match cli.command {
            Command::Cache {
                action: CacheAction::Clear { prefix },
            } => assert!(prefix.is_empty()),
            _ => panic!("expected cache clear"),
        }
    }
}
