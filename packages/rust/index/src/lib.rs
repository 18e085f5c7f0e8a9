//! Search index reconciliation trigger.
//!
//! After a run, the search index is asked to re-import the artifact bucket.
//! The call is fire-and-forget: it returns the operation handle and nothing
//! waits for the import to finish.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reposcrape_shared::{IndexConfig, ReposcrapeError, Result, read_secret};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use url::Url;

const USER_AGENT: &str = concat!("reposcrape/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How the index treats documents missing from the import source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationMode {
    /// Add and update; keep documents absent from the source.
    Incremental,
    /// Mirror the source exactly.
    Full,
}

impl fmt::Display for ReconciliationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incremental => write!(f, "incremental"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl FromStr for ReconciliationMode {
    type Err = ReposcrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "full" => Ok(Self::Full),
            other => Err(ReposcrapeError::validation(format!(
                "unknown reconciliation mode '{other}' (expected incremental or full)"
            ))),
        }
    }
}

/// Handle to a submitted, long-running import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub name: String,
    pub mode: ReconciliationMode,
    pub submitted_at: DateTime<Utc>,
}

/// Ask a search index to re-sync with the object store.
#[async_trait]
pub trait IndexReconciler: Send + Sync {
    async fn reconcile(&self, mode: ReconciliationMode) -> Result<OperationHandle>;
}

// ---------------------------------------------------------------------------
// DocumentImportTrigger
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportRequest<'a> {
    gcs_source: GcsSource<'a>,
    reconciliation_mode: ReconciliationMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GcsSource<'a> {
    input_uris: &'a [String],
    data_schema: &'a str,
}

#[derive(Deserialize)]
struct OperationResponse {
    name: String,
}

/// Posts a document-import request to a discovery-engine style endpoint.
pub struct DocumentImportTrigger {
    client: Client,
    endpoint: Url,
    input_uris: Vec<String>,
    data_schema: String,
    token: Option<String>,
}

impl DocumentImportTrigger {
    pub fn new(
        endpoint: Url,
        input_uris: Vec<String>,
        data_schema: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if input_uris.is_empty() {
            return Err(ReposcrapeError::config("index.input_uris must not be empty"));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ReposcrapeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            input_uris,
            data_schema: data_schema.into(),
            token,
        })
    }

    /// Build from config. `None` when no endpoint is configured.
    ///
    /// The bearer token is optional: a missing env var sends no header.
    pub fn from_config(config: &IndexConfig) -> Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.as_deref() else {
            return Ok(None);
        };
        let endpoint = Url::parse(endpoint)
            .map_err(|e| ReposcrapeError::config(format!("invalid index endpoint '{endpoint}': {e}")))?;
        let token = read_secret(&config.token_env).ok();

        Self::new(
            endpoint,
            config.input_uris.clone(),
            config.data_schema.clone(),
            token,
            Duration::from_secs(config.timeout_secs),
        )
        .map(Some)
    }
}

#[async_trait]
impl IndexReconciler for DocumentImportTrigger {
    #[instrument(skip_all, fields(mode = %mode))]
    async fn reconcile(&self, mode: ReconciliationMode) -> Result<OperationHandle> {
        let body = ImportRequest {
            gcs_source: GcsSource {
                input_uris: &self.input_uris,
                data_schema: &self.data_schema,
            },
            reconciliation_mode: mode,
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReposcrapeError::Index(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ReposcrapeError::Index(format!(
                "import request rejected: HTTP {status} {detail}"
            )));
        }

        let operation: OperationResponse = response
            .json()
            .await
            .map_err(|e| ReposcrapeError::parse(format!("invalid operation response: {e}")))?;

        info!(operation = %operation.name, "index import triggered");
        Ok(OperationHandle {
            name: operation.name,
            mode,
            submitted_at: Utc::now(),
        })
    }
}
