//! Repository feed: fetch `repos.json`, parse it into descriptors, and pick
//! the shard a worker is responsible for.
//!
//! Records are parsed leniently. A record that does not deserialize still
//! yields an (empty, invalid) descriptor, so batch totals always match the
//! feed and the orchestrator reports it as a validation error.

use std::time::Duration;

use reposcrape_shared::{FeedConfig, RepositoryDescriptor, ReposcrapeError, Result};
use reqwest::Client;
use tokio_retry::RetryIf;
use tracing::{info, instrument, warn};
use url::Url;

/// User-Agent string for feed requests.
const USER_AGENT: &str = concat!("reposcrape/", env!("CARGO_PKG_VERSION"));

/// Delays between fetch attempts (three attempts in total).
const DEFAULT_RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Fetch settings.
#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub timeout: Duration,
    /// Sleeps between attempts; its length + 1 is the attempt count.
    pub retry_delays: Vec<Duration>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
        }
    }
}

impl From<&FeedConfig> for FeedOptions {
    fn from(config: &FeedConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Download and parse the feed at `url`, retrying network and server errors.
#[instrument(skip_all, fields(url = %url))]
pub async fn fetch_repositories(url: &Url, opts: &FeedOptions) -> Result<Vec<RepositoryDescriptor>> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(opts.timeout)
        .build()
        .map_err(|e| ReposcrapeError::Network(format!("failed to build HTTP client: {e}")))?;

    let body = RetryIf::start(
        opts.retry_delays.clone(),
        || fetch_body(&client, url),
        |err: &ReposcrapeError| {
            let retry = matches!(err, ReposcrapeError::Network(_));
            if retry {
                warn!(error = %err, "feed fetch failed, retrying");
            }
            retry
        },
    )
    .await?;

    let repos = parse_feed(&body)?;
    info!(total_repos = repos.len(), "fetched repository feed");
    Ok(repos)
}

async fn fetch_body(client: &Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| ReposcrapeError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if status.is_client_error() {
        return Err(ReposcrapeError::parse(format!("{url}: HTTP {status}")));
    }
    if !status.is_success() {
        return Err(ReposcrapeError::Network(format!("{url}: HTTP {status}")));
    }

    response
        .text()
        .await
        .map_err(|e| ReposcrapeError::Network(format!("{url}: failed to read body: {e}")))
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Parse a `repos.json` body: a JSON array of repository records.
pub fn parse_feed(body: &str) -> Result<Vec<RepositoryDescriptor>> {
    let records: Vec<serde_json::Value> = serde_json::from_str(body)
        .map_err(|e| ReposcrapeError::parse(format!("feed is not a JSON array: {e}")))?;

    let repos = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            serde_json::from_value::<RepositoryDescriptor>(record).unwrap_or_else(|e| {
                warn!(index, error = %e, "unreadable feed record");
                RepositoryDescriptor::new("", "", "", "")
            })
        })
        .collect();
    Ok(repos)
}

// ---------------------------------------------------------------------------
// Sharding
// ---------------------------------------------------------------------------

/// Keep the records at positions where `index % batch_size == offset`.
///
/// Lets `batch_size` workers split one feed without coordination.
pub fn select_shard(
    repos: Vec<RepositoryDescriptor>,
    batch_size: usize,
    offset: usize,
) -> Result<Vec<RepositoryDescriptor>> {
    if batch_size == 0 {
        return Err(ReposcrapeError::validation("batch size must be at least 1"));
    }
    if offset >= batch_size {
        return Err(ReposcrapeError::validation(format!(
            "offset {offset} must be below batch size {batch_size}"
        )));
    }

    let total = repos.len();
    let shard: Vec<_> = repos
        .into_iter()
        .enumerate()
        .filter(|(index, _)| index % batch_size == offset)
        .map(|(_, repo)| repo)
        .collect();

    info!(
        batch_size,
        offset,
        total_repos = total,
        assigned_repos = shard.len(),
        "batch filtering"
    );
    Ok(shard)
}
