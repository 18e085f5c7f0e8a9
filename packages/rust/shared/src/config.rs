//! Application configuration for reposcrape.
//!
//! User config lives at `~/.reposcrape/reposcrape.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ReposcrapeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "reposcrape.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".reposcrape";

// ---------------------------------------------------------------------------
// Config structs (matching reposcrape.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Repository feed.
    #[serde(default)]
    pub feed: FeedConfig,

    /// Orchestrator tuning.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// External artifact generator.
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Change-marker cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Object store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Search index import trigger.
    #[serde(default)]
    pub index: IndexConfig,
}

/// `[feed]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// URL of the repos.json feed.
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_feed_timeout")]
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            timeout_secs: default_feed_timeout(),
        }
    }
}

impl FeedConfig {
    /// Parse the configured feed URL.
    pub fn feed_url(&self) -> Result<Url> {
        Url::parse(&self.url)
            .map_err(|e| ReposcrapeError::config(format!("invalid feed url '{}': {e}", self.url)))
    }
}

fn default_feed_url() -> String {
    "https://uk-x-gov-software-community.github.io/xgov-opensource-repo-scraper/repos.json".into()
}
fn default_feed_timeout() -> u64 {
    30
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Items processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-item generation deadline.
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,

    /// Per-item upload deadline (covers all retry attempts).
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,

    /// Log a progress line every N completed items.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            generation_timeout_secs: default_generation_timeout(),
            upload_timeout_secs: default_upload_timeout(),
            progress_interval: default_progress_interval(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_generation_timeout() -> u64 {
    300
}
fn default_upload_timeout() -> u64 {
    120
}
fn default_progress_interval() -> usize {
    100
}

/// `[generator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Program to run per repository.
    #[serde(default = "default_generator_command")]
    pub command: String,

    /// Arguments; `{url}`, `{org}` and `{name}` are substituted.
    #[serde(default = "default_generator_args")]
    pub args: Vec<String>,

    /// Reject summaries larger than this.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: default_generator_command(),
            args: default_generator_args(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_generator_command() -> String {
    "gitingest".into()
}
fn default_generator_args() -> Vec<String> {
    vec!["{url}".into(), "-o".into(), "-".into()]
}
fn default_max_output_bytes() -> usize {
    32 * 1024 * 1024
}

/// Which cache adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Local libSQL database.
    Libsql,
    /// KV proxy reached over HTTP.
    Http,
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackendKind,

    /// Database path for the libSQL backend. `~` expands to the home directory.
    #[serde(default = "default_cache_path")]
    pub path: String,

    /// Keeps production and test entries apart.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Base URL of the KV proxy for the HTTP backend.
    #[serde(default = "default_worker_url")]
    pub worker_url: String,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_cache_timeout")]
    pub timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            path: default_cache_path(),
            namespace: default_namespace(),
            worker_url: default_worker_url(),
            timeout_secs: default_cache_timeout(),
        }
    }
}

impl CacheConfig {
    /// Resolved database path.
    pub fn db_path(&self) -> Result<PathBuf> {
        expand_home(&self.path)
    }
}

fn default_cache_backend() -> CacheBackendKind {
    CacheBackendKind::Libsql
}
fn default_cache_path() -> String {
    "~/.reposcrape/cache.db".into()
}
fn default_namespace() -> String {
    "production".into()
}
fn default_worker_url() -> String {
    "http://localhost:8787".into()
}
fn default_cache_timeout() -> u64 {
    10
}

/// Which object store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Memory,
    Local,
    S3,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackendKind,

    /// Root directory for the local backend.
    #[serde(default = "default_store_root")]
    pub root: String,

    /// Bucket for the S3 backend.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Custom S3-compatible endpoint (R2, MinIO, GCS interop).
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Optional key prefix applied to every object.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Env var holding the access key id (never store the key itself).
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,

    /// Env var holding the secret access key.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,

    /// Total upload attempts, first included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles after each failure.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            root: default_store_root(),
            bucket: None,
            endpoint: None,
            region: default_region(),
            prefix: None,
            access_key_env: default_access_key_env(),
            secret_key_env: default_secret_key_env(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl StoreConfig {
    /// Resolved root directory for the local backend.
    pub fn root_path(&self) -> Result<PathBuf> {
        expand_home(&self.root)
    }
}

fn default_store_backend() -> StoreBackendKind {
    StoreBackendKind::Local
}
fn default_store_root() -> String {
    "~/.reposcrape/objects".into()
}
fn default_region() -> String {
    "auto".into()
}
fn default_access_key_env() -> String {
    "REPOSCRAPE_STORE_ACCESS_KEY".into()
}
fn default_secret_key_env() -> String {
    "REPOSCRAPE_STORE_SECRET_KEY".into()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    30_000
}

/// `[index]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Full URL of the document import endpoint. Unset disables reconciliation.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Object URIs the index should import from.
    #[serde(default)]
    pub input_uris: Vec<String>,

    /// Schema the index applies to imported objects.
    #[serde(default = "default_data_schema")]
    pub data_schema: String,

    /// Env var holding a bearer token for the import endpoint.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    #[serde(default = "default_index_timeout")]
    pub timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            input_uris: Vec::new(),
            data_schema: default_data_schema(),
            token_env: default_token_env(),
            timeout_secs: default_index_timeout(),
        }
    }
}

fn default_data_schema() -> String {
    "content".into()
}
fn default_token_env() -> String {
    "REPOSCRAPE_INDEX_TOKEN".into()
}
fn default_index_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime orchestrator configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker pool size.
    pub concurrency: usize,
    /// Deadline for one generator call.
    pub generation_timeout: Duration,
    /// Deadline for one upload, retries included.
    pub upload_timeout: Duration,
    /// Log progress every N completed items (0 disables).
    pub progress_interval: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.pipeline.concurrency.max(1),
            generation_timeout: Duration::from_secs(config.pipeline.generation_timeout_secs),
            upload_timeout: Duration::from_secs(config.pipeline.upload_timeout_secs),
            progress_interval: config.pipeline.progress_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.reposcrape/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ReposcrapeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.reposcrape/reposcrape.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ReposcrapeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        ReposcrapeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ReposcrapeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ReposcrapeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ReposcrapeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a secret from the env var named in config.
pub fn read_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ReposcrapeError::config(format!(
            "secret not found. Set the {var_name} environment variable."
        ))),
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.store.max_attempts == 0 {
        return Err(ReposcrapeError::config("store.max_attempts must be at least 1"));
    }
    if config.store.backend == StoreBackendKind::S3 && config.store.bucket.is_none() {
        return Err(ReposcrapeError::config("store.bucket is required for the s3 backend"));
    }
    if config.cache.namespace.is_empty() {
        return Err(ReposcrapeError::config("cache.namespace must not be empty"));
    }
    Ok(())
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ReposcrapeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("repos.json"));
        assert!(toml_str.contains("REPOSCRAPE_STORE_SECRET_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.store.max_attempts, 3);
        assert_eq!(parsed.cache.backend, CacheBackendKind::Libsql);
        assert_eq!(parsed.generator.args, vec!["{url}", "-o", "-"]);
    }

    #[test]
    fn config_with_s3_store() {
        let toml_str = r#"
[store]
backend = "s3"
bucket = "summaries"
endpoint = "https://account.r2.cloudflarestorage.com"
prefix = "gitingest"

[cache]
namespace = "test"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.store.backend, StoreBackendKind::S3);
        assert_eq!(config.store.bucket.as_deref(), Some("summaries"));
        assert_eq!(config.store.initial_backoff_ms, 1_000);
        assert_eq!(config.cache.namespace, "test");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn s3_without_bucket_is_rejected() {
        let config: AppConfig = toml::from_str("[store]\nbackend = \"s3\"\n").expect("parse");
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("store.bucket"));
    }

    #[test]
    fn load_config_from_file() {
        let path = std::env::temp_dir().join(format!("rs_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[pipeline]\nconcurrency = 16\n").expect("write");
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.pipeline.concurrency, 16);
        assert_eq!(config.pipeline.generation_timeout_secs, 300);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pipeline_config_from_app_config() {
        let mut app = AppConfig::default();
        app.pipeline.concurrency = 0;
        let pipeline = PipelineConfig::from(&app);
        assert_eq!(pipeline.concurrency, 1);
        assert_eq!(pipeline.generation_timeout, Duration::from_secs(300));
        assert_eq!(pipeline.upload_timeout, Duration::from_secs(120));
        assert_eq!(pipeline.progress_interval, 100);
    }

    #[test]
    fn secret_lookup() {
        // Use a unique env var name to avoid interfering with other tests
        let result = read_secret("RS_TEST_NONEXISTENT_SECRET_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("RS_TEST_NONEXISTENT_SECRET_12345"));
    }

    #[test]
    fn expand_home_passes_absolute_paths() {
        assert_eq!(expand_home("/var/lib/cache.db").unwrap(), PathBuf::from("/var/lib/cache.db"));
    }
}
