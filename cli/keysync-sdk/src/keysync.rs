use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::models::discovery::{Discovery, DiscoveryConfig};
use crate::models::source::{Source, SourceReader};
use crate::models::store::{TargetStore, TargetStoreOptions};
use crate::models::target::{Target, TargetKind};
use crate::providers::blob::BlobMergeStore;
use crate::providers::breaker::{CircuitBreaker, RetryPolicy};
use crate::providers::store::{HttpStoreClient, MemoryStoreClient, SecretStoreClient};
use crate::utils::clock::Clock;
use crate::utils::metrics::Metrics;

/// Builds the policy-wrapped store for a target. Dispatch over backend
/// kinds happens here; the pipeline is variant-agnostic.
pub trait StoreFactory: Debug + Send + Sync {
    fn store_for(&self, target: &Target) -> Result<Arc<TargetStore>, StoreFactoryError>;
}

#[derive(Debug, Error)]
pub enum StoreFactoryError {
    #[error("no secret-store endpoint configured for target {0:?}")]
    MissingEndpoint(String),
    #[error("invalid secret-store endpoint for target {0:?}")]
    InvalidEndpoint(String, #[source] url::ParseError),
}

/// The main context for one pipeline run: the configured sources plus
/// the shared client bundle. Clients are shared by reference across
/// targets; their internal caches carry their own locks.
#[derive(Debug)]
pub struct Keysync {
    pub sources: Vec<Source>,
    pub reader: Arc<SourceReader>,
    pub merge_store: Option<Arc<BlobMergeStore>>,
    pub discovery: Option<DiscoverySetup>,
    pub stores: Arc<dyn StoreFactory>,
    pub metrics: Arc<Metrics>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug)]
pub struct DiscoverySetup {
    pub config: DiscoveryConfig,
    pub engine: Arc<Discovery>,
}

/// Default [`StoreFactory`]: REST clients for cloud targets (with
/// `{account}` / `{region}` placeholders expanded into the endpoint),
/// fresh in-memory stores for `memory` targets.
#[derive(Debug)]
pub struct ClientStoreFactory {
    endpoint: Option<String>,
    token: String,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    options: TargetStoreOptions,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl ClientStoreFactory {
    pub fn new(
        endpoint: Option<String>,
        token: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        options: TargetStoreOptions,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            endpoint,
            token: token.into(),
            breaker,
            retry,
            options,
            clock,
            metrics,
        }
    }

    fn endpoint_for(&self, target: &Target) -> Result<Url, StoreFactoryError> {
        let template = self
            .endpoint
            .as_deref()
            .ok_or_else(|| StoreFactoryError::MissingEndpoint(target.name.clone()))?;
        let expanded = template
            .replace("{account}", target.account_id.as_deref().unwrap_or_default())
            .replace("{region}", target.region.as_deref().unwrap_or_default());
        Url::parse(&expanded)
            .map_err(|source| StoreFactoryError::InvalidEndpoint(target.name.clone(), source))
    }
}

impl StoreFactory for ClientStoreFactory {
    fn store_for(&self, target: &Target) -> Result<Arc<TargetStore>, StoreFactoryError> {
        let client = match target.kind {
            TargetKind::CloudSecretStore => SecretStoreClient::Http(HttpStoreClient::new(
                &self.endpoint_for(target)?,
                &self.token,
                Arc::clone(&self.metrics),
            )),
            TargetKind::Memory => SecretStoreClient::Memory(MemoryStoreClient::new()),
        };
        let options = TargetStoreOptions {
            retain: target.retain(),
            ..self.options.clone()
        };
        Ok(Arc::new(TargetStore::new(
            target.name.clone(),
            client,
            Arc::clone(&self.breaker),
            self.retry.clone(),
            options,
            Arc::clone(&self.clock),
            Arc::clone(&self.metrics),
        )))
    }
}
