use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use keysync_core::path::PathError;
use keysync_core::{SecretPath, SecretTree};
use thiserror::Error;
use tracing::debug;

use super::breaker::{retry, CircuitBreaker, RetryPolicy};
use super::ClientError;
use crate::utils::context::RequestContext;
use crate::utils::metrics::Metrics;

/// Either a filesystem-backed object store, or an in-memory one for
/// testing.
#[derive(Debug)]
#[enum_dispatch(BlobClientTrait)]
pub enum BlobClient {
    File(FileBlobStore),
    Memory(MemoryBlobClient),
}

#[async_trait]
#[enum_dispatch]
pub trait BlobClientTrait {
    async fn put(&self, ctx: &RequestContext, key: &str, bytes: Vec<u8>)
        -> Result<(), ClientError>;

    async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Vec<u8>, ClientError>;

    /// All keys under `prefix`, in unspecified order.
    async fn list(&self, ctx: &RequestContext, prefix: &str) -> Result<Vec<String>, ClientError>;
}

/// Object store rooted in a local directory. Keys map directly to
/// relative file paths; writes are atomic (tempfile + rename).
#[derive(Debug)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobClientTrait for FileBlobStore {
    async fn put(
        &self,
        ctx: &RequestContext,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        ctx.check()?;
        keysync_core::write_atomically(&bytes, &self.root.join(key))
            .map_err(|err| ClientError::transient("put", err))
    }

    async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Vec<u8>, ClientError> {
        ctx.check()?;
        match tokio::fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ClientError::not_found("get", key))
            },
            Err(err) => Err(ClientError::transient("get", err)),
        }
    }

    async fn list(&self, ctx: &RequestContext, prefix: &str) -> Result<Vec<String>, ClientError> {
        ctx.check()?;
        let base = self.root.join(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&base) {
            let entry = entry.map_err(|err| ClientError::transient("list", err))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|err| ClientError::transient("list", err))?;
            keys.push(relative.to_string_lossy().replace('\\', "/"));
        }
        Ok(keys)
    }
}

/// In-memory object store for tests; records puts so dry-run purity can
/// be asserted.
#[derive(Debug, Default)]
pub struct MemoryBlobClient {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    puts: Mutex<Vec<String>>,
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().expect("blob puts lock poisoned").len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("blob objects lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlobClientTrait for MemoryBlobClient {
    async fn put(
        &self,
        ctx: &RequestContext,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ClientError> {
        ctx.check()?;
        self.puts
            .lock()
            .expect("blob puts lock poisoned")
            .push(key.to_string());
        self.objects
            .lock()
            .expect("blob objects lock poisoned")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Vec<u8>, ClientError> {
        ctx.check()?;
        self.objects
            .lock()
            .expect("blob objects lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| ClientError::not_found("get", key))
    }

    async fn list(&self, ctx: &RequestContext, prefix: &str) -> Result<Vec<String>, ClientError> {
        ctx.check()?;
        let objects = self.objects.lock().expect("blob objects lock poisoned");
        Ok(objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum BlobMergeError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to encode bundle entry {path}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode blob {key}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Persists per-target merged bundles for downstream importers.
///
/// Keys follow `<prefix>/<target>/<path>.json`; values are canonical
/// JSON so equal bundles produce byte-identical objects. A run writes
/// exactly the keys present in the bundle; stale keys from earlier runs
/// are left in place (no tombstones).
#[derive(Debug)]
pub struct BlobMergeStore {
    client: BlobClient,
    prefix: String,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl BlobMergeStore {
    pub fn new(
        client: BlobClient,
        prefix: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_matches('/').to_string(),
            breaker,
            retry,
            metrics,
        }
    }

    pub fn client(&self) -> &BlobClient {
        &self.client
    }

    fn target_prefix(&self, target: &str) -> String {
        if self.prefix.is_empty() {
            format!("{target}/")
        } else {
            format!("{}/{target}/", self.prefix)
        }
    }

    fn key(&self, target: &str, path: &SecretPath) -> String {
        format!("{}{path}.json", self.target_prefix(target))
    }

    pub async fn write(
        &self,
        ctx: &RequestContext,
        target: &str,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<(), BlobMergeError> {
        let encoded = value.to_canonical_json().map_err(|source| BlobMergeError::Encode {
            path: path.to_string(),
            source,
        })?;
        let key = self.key(target, path);
        debug!(target, %path, request_id = %ctx.request_id(), "writing merged bundle entry");
        self.metrics.blob_calls.increment();
        retry(&self.retry, ctx, &self.metrics, "put", || {
            let key = key.clone();
            let bytes = encoded.clone().into_bytes();
            async move {
                self.breaker
                    .call(&self.metrics, || self.client.put(ctx, &key, bytes))
                    .await
            }
        })
        .await?;
        Ok(())
    }

    pub async fn read(
        &self,
        ctx: &RequestContext,
        target: &str,
        path: &SecretPath,
    ) -> Result<SecretTree, BlobMergeError> {
        let key = self.key(target, path);
        self.metrics.blob_calls.increment();
        let bytes = retry(&self.retry, ctx, &self.metrics, "get", || {
            let key = key.clone();
            async move {
                self.breaker
                    .call(&self.metrics, || self.client.get(ctx, &key))
                    .await
            }
        })
        .await?;
        serde_json::from_slice(&bytes).map_err(|source| BlobMergeError::Decode { key, source })
    }

    /// Logical paths stored for `target` (prefix and `.json` stripped),
    /// sorted for deterministic fold order.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        target: &str,
    ) -> Result<Vec<SecretPath>, BlobMergeError> {
        let prefix = self.target_prefix(target);
        self.metrics.blob_calls.increment();
        let keys = retry(&self.retry, ctx, &self.metrics, "list", || {
            let prefix = prefix.clone();
            async move {
                self.breaker
                    .call(&self.metrics, || self.client.list(ctx, &prefix))
                    .await
            }
        })
        .await?;

        let mut paths = Vec::new();
        for key in keys {
            let Some(logical) = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            paths.push(SecretPath::parse(logical)?);
        }
        paths.sort();
        Ok(paths)
    }
}
