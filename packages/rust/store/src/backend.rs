use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::prefix::PrefixStore;
use object_store::{Attribute, Attributes, GetOptions, ObjectStore, PutOptions, PutPayload};
use reposcrape_shared::{
    ObjectMetadata, ReposcrapeError, Result, StoreBackendKind, StoreConfig, read_secret,
};
use tracing::debug;

use crate::{ObjectBackend, StoreError};

/// Suffix of the metadata sidecar written next to each object on backends
/// without attribute support.
const SIDECAR_SUFFIX: &str = ".meta.json";

/// Key probed by [`ObjectBackend::ping`]. Absence is a healthy answer.
const PING_KEY: &str = ".reposcrape-ping";

/// Metadata attribute names, in `ObjectMetadata::to_pairs` order.
const METADATA_KEYS: [&str; 7] = [
    "org",
    "name",
    "url",
    "pushedAt",
    "processedAt",
    "size",
    "contentHash",
];

/// [`ObjectBackend`] over any `object_store` implementation.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    kind: StoreBackendKind,
    /// Local filesystem rejects attributes; metadata goes to a sidecar instead.
    sidecar_metadata: bool,
}

impl ObjectStoreBackend {
    /// Build the backend selected by `config`.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match config.backend {
            StoreBackendKind::Memory => Arc::new(InMemory::new()),
            StoreBackendKind::Local => {
                let root = config.root_path()?;
                std::fs::create_dir_all(&root).map_err(|e| ReposcrapeError::io(&root, e))?;
                let local = LocalFileSystem::new_with_prefix(&root)
                    .map_err(|e| ReposcrapeError::config(format!("local store: {e}")))?;
                Arc::new(local)
            }
            StoreBackendKind::S3 => {
                let bucket = config.bucket.as_deref().ok_or_else(|| {
                    ReposcrapeError::config("store.bucket is required for the s3 backend")
                })?;
                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(&config.region)
                    .with_access_key_id(read_secret(&config.access_key_env)?)
                    .with_secret_access_key(read_secret(&config.secret_key_env)?);
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let s3 = builder
                    .build()
                    .map_err(|e| ReposcrapeError::config(format!("s3 store: {e}")))?;
                Arc::new(s3)
            }
        };

        let store = match config.prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => Arc::new(PrefixStore::new(store, prefix)) as Arc<dyn ObjectStore>,
            None => store,
        };

        Ok(Self::with_store(store, config.backend))
    }

    /// Wrap an existing store (tests, custom wiring).
    pub fn with_store(store: Arc<dyn ObjectStore>, kind: StoreBackendKind) -> Self {
        Self {
            store,
            kind,
            sidecar_metadata: kind == StoreBackendKind::Local,
        }
    }

    pub fn kind(&self) -> StoreBackendKind {
        self.kind
    }

    /// Metadata recorded for `key`, `None` if the object does not exist.
    pub async fn metadata(
        &self,
        key: &str,
    ) -> std::result::Result<Option<BTreeMap<String, String>>, StoreError> {
        if self.sidecar_metadata {
            let sidecar = parse_key(&format!("{key}{SIDECAR_SUFFIX}"))?;
            let bytes = match self.store.get(&sidecar).await {
                Ok(result) => result.bytes().await?,
                Err(object_store::Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let meta: ObjectMetadata = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Rejected(format!("corrupt metadata sidecar: {e}")))?;
            return Ok(Some(
                meta.to_pairs()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ));
        }

        let path = parse_key(key)?;
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = match self.store.get_opts(&path, options).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let pairs = METADATA_KEYS
            .iter()
            .filter_map(|name| {
                result
                    .attributes
                    .get(&Attribute::Metadata((*name).into()))
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        Ok(Some(pairs))
    }
}

#[async_trait]
impl ObjectBackend for ObjectStoreBackend {
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> std::result::Result<(), StoreError> {
        let path = parse_key(key)?;

        if self.sidecar_metadata {
            self.store.put(&path, PutPayload::from_bytes(body)).await?;
            let sidecar = parse_key(&format!("{key}{SIDECAR_SUFFIX}"))?;
            let json = serde_json::to_vec(metadata)
                .map_err(|e| StoreError::Rejected(format!("metadata encoding: {e}")))?;
            self.store
                .put(&sidecar, PutPayload::from_bytes(Bytes::from(json)))
                .await?;
        } else {
            let mut attributes = Attributes::new();
            for (name, value) in metadata.to_pairs() {
                attributes.insert(Attribute::Metadata(name.into()), value.into());
            }
            let options = PutOptions {
                attributes,
                ..Default::default()
            };
            self.store
                .put_opts(&path, PutPayload::from_bytes(body), options)
                .await?;
        }

        debug!(key, "object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<Bytes>, StoreError> {
        let path = parse_key(key)?;
        match self.store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> std::result::Result<bool, StoreError> {
        let path = parse_key(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> std::result::Result<Vec<String>, StoreError> {
        let prefix = prefix.map(parse_key).transpose()?;
        let metas: Vec<_> = self.store.list(prefix.as_ref()).try_collect().await?;
        let mut keys: Vec<String> = metas
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| !key.ends_with(SIDECAR_SUFFIX))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        match self.store.head(&ObjPath::from(PING_KEY)).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_key(key: &str) -> std::result::Result<ObjPath, StoreError> {
    ObjPath::parse(key).map_err(|e| StoreError::Rejected(format!("invalid key '{key}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reposcrape_shared::{Artifact, RepositoryDescriptor};

    fn sample() -> (String, Bytes, ObjectMetadata) {
        let repo = RepositoryDescriptor::new(
            "alphagov",
            "notify",
            "https://github.com/alphagov/notify",
            "2025-01-01T00:00:00Z",
        );
        let artifact = Artifact::new(&repo.validate().unwrap(), "# notify\n".into());
        let meta = ObjectMetadata::for_artifact(&repo, &artifact);
        (artifact.storage_key(), Bytes::from(artifact.content), meta)
    }

    fn temp_local_config() -> StoreConfig {
        StoreConfig {
            backend: StoreBackendKind::Local,
            root: std::env::temp_dir()
                .join(format!("rs_store_{}", uuid::Uuid::now_v7()))
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_put_get_exists_list() {
        let backend = ObjectStoreBackend::from_config(&StoreConfig {
            backend: StoreBackendKind::Memory,
            ..Default::default()
        })
        .unwrap();
        let (key, body, meta) = sample();

        assert!(!backend.exists(&key).await.unwrap());
        backend.put(&key, body.clone(), &meta).await.unwrap();
        assert!(backend.exists(&key).await.unwrap());
        assert_eq!(backend.get(&key).await.unwrap(), Some(body));
        assert_eq!(backend.list(Some("alphagov")).await.unwrap(), vec![key.clone()]);
        assert!(backend.list(Some("hmrc")).await.unwrap().is_empty());
        assert!(backend.get("alphagov/missing/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_keeps_metadata_as_attributes() {
        let backend = ObjectStoreBackend::with_store(Arc::new(InMemory::new()), StoreBackendKind::Memory);
        let (key, body, meta) = sample();
        backend.put(&key, body, &meta).await.unwrap();

        let stored = backend.metadata(&key).await.unwrap().expect("metadata");
        assert_eq!(stored.get("org").map(String::as_str), Some("alphagov"));
        assert_eq!(stored.get("pushedAt").map(String::as_str), Some("2025-01-01T00:00:00Z"));
        assert_eq!(stored.get("size").map(String::as_str), Some("9"));
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let backend = ObjectStoreBackend::with_store(Arc::new(InMemory::new()), StoreBackendKind::Memory);
        let (key, body, meta) = sample();
        backend.put(&key, body.clone(), &meta).await.unwrap();
        backend.put(&key, body.clone(), &meta).await.unwrap();
        assert_eq!(backend.list(None).await.unwrap().len(), 1);
        assert_eq!(backend.get(&key).await.unwrap(), Some(body));
    }

    #[tokio::test]
    async fn local_writes_sidecar_and_hides_it() {
        let backend = ObjectStoreBackend::from_config(&temp_local_config()).unwrap();
        let (key, body, meta) = sample();
        backend.put(&key, body.clone(), &meta).await.unwrap();

        assert_eq!(backend.get(&key).await.unwrap(), Some(body));
        assert_eq!(backend.list(None).await.unwrap(), vec![key.clone()]);
        let stored = backend.metadata(&key).await.unwrap().expect("sidecar");
        assert_eq!(stored.get("name").map(String::as_str), Some("notify"));
        assert_eq!(stored.get("contentHash"), Some(&meta.content_hash));
    }

    #[tokio::test]
    async fn prefix_is_applied() {
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let prefixed: Arc<dyn ObjectStore> = Arc::new(PrefixStore::new(inner.clone(), "gitingest"));
        let backend = ObjectStoreBackend::with_store(prefixed, StoreBackendKind::Memory);
        let (key, body, meta) = sample();
        backend.put(&key, body, &meta).await.unwrap();

        let raw = ObjectStoreBackend::with_store(inner, StoreBackendKind::Memory);
        assert_eq!(
            raw.list(None).await.unwrap(),
            vec![format!("gitingest/{key}")]
        );
    }

    #[tokio::test]
    async fn invalid_key_is_rejected() {
        let backend = ObjectStoreBackend::with_store(Arc::new(InMemory::new()), StoreBackendKind::Memory);
        let (_, body, meta) = sample();
        let err = backend.put("a//b", body, &meta).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn ping_on_empty_store() {
        let backend = ObjectStoreBackend::from_config(&temp_local_config()).unwrap();
        backend.ping().await.expect("ping");
    }

    #[test]
    fn s3_requires_credentials() {
        let config = StoreConfig {
            backend: StoreBackendKind::S3,
            bucket: Some("summaries".into()),
            access_key_env: "RS_TEST_NO_SUCH_ACCESS_KEY".into(),
            secret_key_env: "RS_TEST_NO_SUCH_SECRET_KEY".into(),
            ..Default::default()
        };
        let err = ObjectStoreBackend::from_config(&config).err().expect("missing secret");
        assert!(err.to_string().contains("RS_TEST_NO_SUCH_ACCESS_KEY"));
    }
}
