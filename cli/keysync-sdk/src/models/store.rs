use std::sync::Arc;
use std::time::{Duration, Instant};

use keysync_core::{SecretPath, SecretTree};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::providers::breaker::{retry, CircuitBreaker, RetryPolicy};
use crate::providers::store::{SecretRecord, SecretStoreClient, SecretStoreClientTrait};
use crate::providers::ClientError;
use crate::utils::clock::Clock;
use crate::utils::context::RequestContext;
use crate::utils::metrics::Metrics;

pub const DEFAULT_LIST_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct TargetStoreOptions {
    pub cache_ttl: Duration,
    /// Omit empty-mapping secrets from listings and never create them.
    pub no_empty_secrets: bool,
    /// Version retention forwarded to the client on updates.
    pub retain: Option<u32>,
}

impl Default for TargetStoreOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_LIST_CACHE_TTL,
            no_empty_secrets: false,
            retain: None,
        }
    }
}

#[derive(Debug)]
struct CachedListing {
    fetched_at: Instant,
    records: Vec<SecretRecord>,
}

/// Policy layer over a [`SecretStoreClient`] for one target: run-scoped
/// TTL list cache with write invalidation, upsert degradation, and
/// empty-secret filtering. Every client call goes through the
/// target-store breaker and the retry policy.
#[derive(Debug)]
pub struct TargetStore {
    target_name: String,
    client: SecretStoreClient,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    options: TargetStoreOptions,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    cache: RwLock<Option<CachedListing>>,
    // single-flight guard: one cache refresh per target at a time
    refresh: Mutex<()>,
}

impl TargetStore {
    pub fn new(
        target_name: impl Into<String>,
        client: SecretStoreClient,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        options: TargetStoreOptions,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            client,
            breaker,
            retry,
            options,
            clock,
            metrics,
            cache: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// The underlying client, for embedding code and tests that need to
    /// reach past the policy layer.
    pub fn client(&self) -> &SecretStoreClient {
        &self.client
    }

    fn cached_records(&self, cached: &Option<CachedListing>) -> Option<Vec<SecretRecord>> {
        let cached = cached.as_ref()?;
        let age = self.clock.now().duration_since(cached.fetched_at);
        (age < self.options.cache_ttl).then(|| cached.records.clone())
    }

    /// Current listing, served from the TTL cache when fresh.
    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<SecretRecord>, ClientError> {
        if let Some(records) = self.cached_records(&*self.cache.read().await) {
            self.metrics.cache_hits.increment();
            return Ok(records);
        }

        let _refresh = self.refresh.lock().await;
        // another task may have refreshed while we waited for the guard
        if let Some(records) = self.cached_records(&*self.cache.read().await) {
            self.metrics.cache_hits.increment();
            return Ok(records);
        }

        self.metrics.cache_misses.increment();
        let started = self.clock.now();
        let mut records = retry(&self.retry, ctx, &self.metrics, "list", || async move {
            self.metrics.store_calls.increment();
            self.breaker
                .call(&self.metrics, || self.client.list(ctx))
                .await
        })
        .await?;
        self.metrics
            .store_call_duration
            .record(self.clock.now().duration_since(started));

        if self.options.no_empty_secrets {
            records.retain(|record| !record.value.is_empty_mapping());
        }

        *self.cache.write().await = Some(CachedListing {
            fetched_at: self.clock.now(),
            records: records.clone(),
        });
        Ok(records)
    }

    pub async fn get(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<SecretTree, ClientError> {
        retry(&self.retry, ctx, &self.metrics, "get", || async move {
            self.metrics.store_calls.increment();
            self.breaker
                .call(&self.metrics, || self.client.get(ctx, path))
                .await
        })
        .await
    }

    /// Create a secret, degrading to an update when the path already
    /// exists. Returns the post-image version, or `None` when the value
    /// was skipped by the empty-secret filter.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<Option<String>, ClientError> {
        if self.options.no_empty_secrets && value.is_empty_mapping() {
            debug!(target = %self.target_name, %path, "skipping empty secret");
            return Ok(None);
        }
        let created = retry(&self.retry, ctx, &self.metrics, "create", || async move {
            self.metrics.store_calls.increment();
            self.breaker
                .call(&self.metrics, || self.client.create(ctx, path, value))
                .await
        })
        .await;
        let version = match created {
            Err(ClientError::AlreadyExists { .. }) => self.update_raw(ctx, path, value).await?,
            other => other?,
        };
        self.invalidate().await;
        Ok(Some(version))
    }

    /// Update a secret, degrading to a create when the path is missing.
    /// Returns the post-image version.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<String, ClientError> {
        let updated = self.update_raw(ctx, path, value).await;
        let version = match updated {
            Err(ClientError::NotFound { .. }) => {
                retry(&self.retry, ctx, &self.metrics, "create", || async move {
                    self.metrics.store_calls.increment();
                    self.breaker
                        .call(&self.metrics, || self.client.create(ctx, path, value))
                        .await
                })
                .await?
            },
            other => other?,
        };
        self.invalidate().await;
        Ok(version)
    }

    pub async fn delete(&self, ctx: &RequestContext, path: &SecretPath) -> Result<(), ClientError> {
        let result = retry(&self.retry, ctx, &self.metrics, "delete", || async move {
            self.metrics.store_calls.increment();
            self.breaker
                .call(&self.metrics, || self.client.delete(ctx, path))
                .await
        })
        .await;
        self.invalidate().await;
        result
    }

    async fn update_raw(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<String, ClientError> {
        retry(&self.retry, ctx, &self.metrics, "update", || async move {
            self.metrics.store_calls.increment();
            self.breaker
                .call(&self.metrics, || {
                    self.client.update(ctx, path, value, self.options.retain)
                })
                .await
        })
        .await
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
