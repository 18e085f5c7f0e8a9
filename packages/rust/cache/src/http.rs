//! Client for the KV proxy that fronts a remote key/value namespace.
//!
//! Routes: `GET|PUT|DELETE /cache/{org}/{name}`, `DELETE /cache?prefix=`,
//! `GET /cache/stats`. Every request carries `namespace` as a query parameter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reposcrape_shared::{CacheKey, ReposcrapeError, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ChangeMarkerCache;

const USER_AGENT: &str = concat!("reposcrape/", env!("CARGO_PKG_VERSION"));

/// Value stored per repository in the KV namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    #[serde(rename = "pushedAt")]
    pub pushed_at: String,
    #[serde(rename = "processedAt")]
    pub processed_at: DateTime<Utc>,
    pub status: String,
}

/// Hit/miss counters reported by the proxy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvStats {
    #[serde(default)]
    pub total_checks: u64,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub hit_rate: f64,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    deleted: u64,
}

/// HTTP adapter for [`ChangeMarkerCache`].
pub struct HttpCache {
    client: Client,
    base: Url,
    namespace: String,
}

impl HttpCache {
    pub fn new(base_url: &str, namespace: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| ReposcrapeError::config(format!("invalid worker url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ReposcrapeError::config(format!(
                "worker url '{base_url}' cannot be a base"
            )));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ReposcrapeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            namespace: namespace.to_string(),
        })
    }

    /// `{base}/cache/{segments...}?namespace=...`, segments percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("cache").extend(segments);
        }
        url.query_pairs_mut()
            .append_pair("namespace", &self.namespace);
        url
    }

    fn entry_url(&self, key: &CacheKey) -> Url {
        self.endpoint(&[key.org.as_str(), key.name.as_str()])
    }

    /// Full entry for `key`, including when it was processed.
    pub async fn get_entry(&self, key: &CacheKey) -> Result<Option<KvEntry>> {
        let url = self.entry_url(key);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("{url}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let entry = response
                    .json::<KvEntry>()
                    .await
                    .map_err(|e| ReposcrapeError::Cache(format!("invalid cache entry: {e}")))?;
                Ok(Some(entry))
            }
            status => Err(ReposcrapeError::Cache(format!("GET {url}: HTTP {status}"))),
        }
    }

    /// Proxy-side hit/miss counters.
    pub async fn stats(&self) -> Result<KvStats> {
        let url = self.endpoint(&["stats"]);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReposcrapeError::Cache(format!("GET {url}: HTTP {status}")));
        }
        response
            .json::<KvStats>()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("invalid stats response: {e}")))
    }
}

#[async_trait]
impl ChangeMarkerCache for HttpCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.pushed_at))
    }

    async fn set(&self, key: &CacheKey, change_marker: &str) -> Result<()> {
        let url = self.entry_url(key);
        let entry = KvEntry {
            pushed_at: change_marker.to_string(),
            processed_at: Utc::now(),
            status: "complete".into(),
        };
        let response = self
            .client
            .put(url.clone())
            .json(&entry)
            .send()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReposcrapeError::Cache(format!("PUT {url}: HTTP {status}")));
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let url = self.entry_url(key);
        let response = self
            .client
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("{url}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(ReposcrapeError::Cache(format!("DELETE {url}: HTTP {status}"))),
        }
    }

    async fn delete_all(&self, prefix: &str) -> Result<u64> {
        let mut url = self.endpoint(&[]);
        url.query_pairs_mut().append_pair("prefix", prefix);
        let response = self
            .client
            .delete(url.clone())
            .send()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReposcrapeError::Cache(format!("DELETE {url}: HTTP {status}")));
        }
        let body = response
            .json::<DeleteResponse>()
            .await
            .map_err(|e| ReposcrapeError::Cache(format!("invalid delete response: {e}")))?;
        tracing::info!(namespace = %self.namespace, prefix, deleted = body.deleted, "cache entries deleted");
        Ok(body.deleted)
    }

    async fn ping(&self) -> Result<()> {
        self.stats().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cache_for(server: &MockServer) -> HttpCache {
        HttpCache::new(&server.uri(), "test", Duration::from_secs(5)).expect("build cache")
    }

    #[tokio::test]
    async fn get_hit_returns_marker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cache/alphagov/govuk-frontend"))
            .and(query_param("namespace", "test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pushedAt": "2025-01-01T00:00:00Z",
                "processedAt": "2025-01-13T10:30:00Z",
                "status": "complete"
            })))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        let marker = cache
            .get(&CacheKey::new("alphagov", "govuk-frontend"))
            .await
            .expect("get");
        assert_eq!(marker.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn get_404_is_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cache/alphagov/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"reason": "cache-miss"})),
            )
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        assert!(
            cache
                .get(&CacheKey::new("alphagov", "missing"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn get_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        let err = cache.get(&CacheKey::new("org", "repo")).await.unwrap_err();
        assert!(matches!(err, ReposcrapeError::Cache(_)));
    }

    #[tokio::test]
    async fn set_puts_entry() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/cache/org/repo"))
            .and(query_param("namespace", "test"))
            .and(body_partial_json(serde_json::json!({
                "pushedAt": "2025-03-01T00:00:00Z",
                "status": "complete"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        cache
            .set(&CacheKey::new("org", "repo"), "2025-03-01T00:00:00Z")
            .await
            .expect("set");
    }

    #[tokio::test]
    async fn set_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        assert!(
            cache
                .set(&CacheKey::new("org", "repo"), "2025-03-01T00:00:00Z")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/cache/org/present"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/cache/org/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        assert!(cache.delete(&CacheKey::new("org", "present")).await.unwrap());
        assert!(!cache.delete(&CacheKey::new("org", "absent")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_all_passes_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/cache"))
            .and(query_param("prefix", "alphagov/"))
            .and(query_param("namespace", "test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"deleted": 7})))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        assert_eq!(cache.delete_all("alphagov/").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn stats_and_ping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cache/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "totalChecks": 10, "hits": 8, "misses": 2, "hitRate": 80.0
            })))
            .mount(&server)
            .await;

        let cache = cache_for(&server);
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.hits, 8);
        assert_eq!(stats.total_checks, 10);
        cache.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn ping_fails_when_unreachable() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let cache = HttpCache::new(&uri, "test", Duration::from_secs(1)).unwrap();
        assert!(cache.ping().await.is_err());
    }

    #[test]
    fn segments_are_encoded() {
        let cache = HttpCache::new("http://localhost:8787", "prod", Duration::from_secs(1)).unwrap();
        let url = cache.entry_url(&CacheKey::new("my org", "repo"));
        assert_eq!(url.path(), "/cache/my%20org/repo");
        assert_eq!(url.query(), Some("namespace=prod"));
    }
}
