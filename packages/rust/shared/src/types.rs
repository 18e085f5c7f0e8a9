//! Core domain types for reposcrape ingestion runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ReposcrapeError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for ingestion run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RepositoryDescriptor
// ---------------------------------------------------------------------------

/// A candidate unit of work as supplied by the repository feed.
///
/// Fields are kept as raw strings: the orchestrator validates identity and
/// change marker per item so one malformed record never rejects the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// Owning organisation. The feed calls this `owner`; `org` is accepted too.
    #[serde(alias = "owner", default)]
    pub org: String,
    /// Repository name.
    #[serde(default)]
    pub name: String,
    /// Clone/browse URL handed to the generator.
    #[serde(default)]
    pub url: String,
    /// Last-modified marker (RFC 3339). Changes whenever the content changes.
    #[serde(rename = "pushedAt", alias = "change_marker", default)]
    pub change_marker: String,
    /// Repository size as reported by the feed, if any.
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl RepositoryDescriptor {
    /// Build a descriptor from its parts.
    pub fn new(
        org: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        change_marker: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into(),
            name: name.into(),
            url: url.into(),
            change_marker: change_marker.into(),
            size_hint: None,
        }
    }

    /// Check identity and change marker, returning the cache key on success.
    ///
    /// `org` and `name` become storage-key segments, so they must be non-empty,
    /// free of `/`, not `.`/`..`, and without surrounding whitespace.
    pub fn validate(&self) -> Result<CacheKey> {
        validate_segment("org", &self.org)?;
        validate_segment("name", &self.name)?;
        parse_change_marker(&self.change_marker)?;
        Ok(CacheKey {
            org: self.org.clone(),
            name: self.name.clone(),
        })
    }

    /// `org/name` label for logs, valid or not.
    pub fn label(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ReposcrapeError::validation(format!("{field} is empty")));
    }
    if value.trim() != value {
        return Err(ReposcrapeError::validation(format!(
            "{field} '{value}' has surrounding whitespace"
        )));
    }
    if value.contains('/')
        || value == "."
        || value == ".."
        || value.chars().any(|c| c.is_ascii_control())
    {
        return Err(ReposcrapeError::validation(format!(
            "{field} '{value}' is not a valid key segment"
        )));
    }
    Ok(())
}

/// Parse an RFC 3339 change marker.
pub fn parse_change_marker(marker: &str) -> Result<DateTime<Utc>> {
    if marker.is_empty() {
        return Err(ReposcrapeError::validation("change marker is empty"));
    }
    DateTime::parse_from_rfc3339(marker)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            ReposcrapeError::validation(format!("change marker '{marker}' is not RFC 3339: {e}"))
        })
}

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Natural identifier of a repository: `org/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub org: String,
    pub name: String,
}

impl CacheKey {
    /// Build a key without validation (callers validate descriptors first).
    pub fn new(org: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org, self.name)
    }
}

impl std::str::FromStr for CacheKey {
    type Err = ReposcrapeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((org, name)) if !org.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(org, name))
            }
            _ => Err(ReposcrapeError::validation(format!(
                "'{s}' is not an org/name key"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Derived content for one repository, owned by the run that generated it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub org: String,
    pub name: String,
    /// SHA-256 of `content`, lowercase hex.
    pub content_hash: String,
    pub content: String,
    pub size_bytes: usize,
    pub generated_at: DateTime<Utc>,
}

impl Artifact {
    /// Wrap generated content for `key`, hashing it.
    pub fn new(key: &CacheKey, content: String) -> Self {
        Self {
            org: key.org.clone(),
            name: key.name.clone(),
            content_hash: content_hash(content.as_bytes()),
            size_bytes: content.len(),
            content,
            generated_at: Utc::now(),
        }
    }

    /// Deterministic, content-addressed storage key: `{org}/{name}/{content_hash}`.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.org, self.name, self.content_hash)
    }
}

/// SHA-256 hex digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// ObjectMetadata
// ---------------------------------------------------------------------------

/// Metadata stored alongside every uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub org: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "pushedAt")]
    pub change_marker: String,
    #[serde(rename = "processedAt")]
    pub processed_at: DateTime<Utc>,
    pub size: usize,
    #[serde(rename = "contentHash")]
    pub content_hash: String,
}

impl ObjectMetadata {
    /// Metadata for `artifact` generated from `repo`.
    pub fn for_artifact(repo: &RepositoryDescriptor, artifact: &Artifact) -> Self {
        Self {
            org: artifact.org.clone(),
            name: artifact.name.clone(),
            url: repo.url.clone(),
            change_marker: repo.change_marker.clone(),
            processed_at: Utc::now(),
            size: artifact.size_bytes,
            content_hash: artifact.content_hash.clone(),
        }
    }

    /// Flatten into string pairs for object attributes / HTTP headers.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("org", self.org.clone()),
            ("name", self.name.clone()),
            ("url", self.url.clone()),
            ("pushedAt", self.change_marker.clone()),
            ("processedAt", self.processed_at.to_rfc3339()),
            ("size", self.size.to_string()),
            ("contentHash", self.content_hash.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(org: &str, name: &str, marker: &str) -> RepositoryDescriptor {
        RepositoryDescriptor::new(org, name, format!("https://github.com/{org}/{name}"), marker)
    }

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn descriptor_accepts_owner_alias() {
        let json = r#"{"owner":"alphagov","name":"govuk-frontend","url":"https://github.com/alphagov/govuk-frontend","pushedAt":"2025-01-01T00:00:00Z","size":1234}"#;
        let parsed: RepositoryDescriptor = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.org, "alphagov");
        assert_eq!(parsed.change_marker, "2025-01-01T00:00:00Z");
        assert_eq!(parsed.size_hint, Some(1234));
    }

    #[test]
    fn descriptor_missing_fields_default_to_empty() {
        let parsed: RepositoryDescriptor =
            serde_json::from_str(r#"{"url":"https://github.com/x/y"}"#).expect("deserialize");
        assert!(parsed.org.is_empty());
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn valid_descriptor_yields_key() {
        let key = repo("alphagov", "govuk-frontend", "2025-10-15T14:30:00Z")
            .validate()
            .expect("valid");
        assert_eq!(key.to_string(), "alphagov/govuk-frontend");
    }

    #[test]
    fn validation_rejects_bad_identity() {
        for (org, name) in [
            ("", "a"),
            ("a", ""),
            ("a/b", "c"),
            ("a", ".."),
            (" a", "b"),
            ("org", "bad\u{7}name"),
            ("o\u{0}rg", "b"),
        ] {
            assert!(
                repo(org, name, "2025-01-01T00:00:00Z").validate().is_err(),
                "{org}/{name} should be rejected"
            );
        }
    }

    #[test]
    fn validation_rejects_bad_marker() {
        assert!(repo("a", "b", "").validate().is_err());
        let err = repo("a", "b", "last tuesday").validate().unwrap_err();
        assert!(err.to_string().contains("RFC 3339"));
    }

    #[test]
    fn cache_key_parse() {
        let key: CacheKey = "alphagov/notify".parse().expect("parse");
        assert_eq!(key, CacheKey::new("alphagov", "notify"));
        assert!("no-slash".parse::<CacheKey>().is_err());
        assert!("a/b/c".parse::<CacheKey>().is_err());
    }

    #[test]
    fn artifact_key_is_content_addressed() {
        let key = CacheKey::new("alphagov", "notify");
        let a = Artifact::new(&key, "# notify\nsummary".into());
        let b = Artifact::new(&key, "# notify\nsummary".into());
        let c = Artifact::new(&key, "# notify\nchanged".into());
        assert_eq!(a.storage_key(), b.storage_key());
        assert_ne!(a.storage_key(), c.storage_key());
        assert!(a.storage_key().starts_with("alphagov/notify/"));
        assert_eq!(a.content_hash.len(), 64);
        assert_eq!(a.size_bytes, 16);
    }

    #[test]
    fn metadata_pairs_cover_contract_fields() {
        let r = repo("alphagov", "notify", "2025-01-01T00:00:00Z");
        let artifact = Artifact::new(&r.validate().unwrap(), "body".into());
        let meta = ObjectMetadata::for_artifact(&r, &artifact);
        let names: Vec<_> = meta.to_pairs().into_iter().map(|(k, _)| k).collect();
        for required in ["org", "name", "pushedAt", "processedAt", "size"] {
            assert!(names.contains(&required), "missing {required}");
        }
        assert_eq!(meta.size, 4);
    }
}
