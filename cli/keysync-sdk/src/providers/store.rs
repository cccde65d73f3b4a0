use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use indexmap::IndexMap;
use keysync_core::{SecretPath, SecretTree};
use serde::{Deserialize, Serialize};
use url::Url;

use super::source::InjectedFailure;
use super::{error_from_status, ClientError};
use crate::utils::context::RequestContext;
use crate::utils::metrics::Metrics;

/// A secret held by a target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub path: SecretPath,
    pub value: SecretTree,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Either a client for a real secret manager, or an in-memory client
/// for testing and local runs.
#[derive(Debug)]
#[enum_dispatch(SecretStoreClientTrait)]
pub enum SecretStoreClient {
    Http(HttpStoreClient),
    Memory(MemoryStoreClient),
}

#[async_trait]
#[enum_dispatch]
pub trait SecretStoreClientTrait {
    /// List every record in the store. Pagination is exhausted here;
    /// page count is surfaced through the metrics registry.
    async fn list(&self, ctx: &RequestContext) -> Result<Vec<SecretRecord>, ClientError>;

    async fn get(&self, ctx: &RequestContext, path: &SecretPath)
        -> Result<SecretTree, ClientError>;

    /// Create a secret; fails with `AlreadyExists` if the path is taken.
    /// Returns the post-image version identifier.
    async fn create(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<String, ClientError>;

    /// Update a secret; fails with `NotFound` if the path is absent.
    /// `retain` is the number of old versions the store should keep.
    async fn update(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
        retain: Option<u32>,
    ) -> Result<String, ClientError>;

    async fn delete(&self, ctx: &RequestContext, path: &SecretPath) -> Result<(), ClientError>;
}

/// REST secret-manager client: cursor-paginated listing, bearer auth.
#[derive(Debug)]
pub struct HttpStoreClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    metrics: Arc<Metrics>,
}

#[derive(Deserialize)]
struct ListPage {
    secrets: Vec<SecretRecord>,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct ValueResponse {
    value: SecretTree,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    value: &'a SecretTree,
    #[serde(skip_serializing_if = "Option::is_none")]
    retain: Option<u32>,
}

impl HttpStoreClient {
    pub fn new(base_url: &Url, token: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.clone(),
            token: token.to_string(),
            metrics,
        }
    }

    fn secret_url(&self, path: &SecretPath, operation: &'static str) -> Result<Url, ClientError> {
        self.base_url
            .join(&format!("v1/secrets/{path}"))
            .map_err(|err| ClientError::transient(operation, err))
    }

    async fn write(
        &self,
        method: reqwest::Method,
        operation: &'static str,
        path: &SecretPath,
        value: &SecretTree,
        retain: Option<u32>,
    ) -> Result<String, ClientError> {
        let url = self.secret_url(path, operation)?;
        let response = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .json(&WriteRequest { value, retain })
            .send()
            .await
            .map_err(|err| ClientError::transient(operation, err))?;

        match response.status() {
            status if status.is_success() => {
                let parsed: VersionResponse = response
                    .json()
                    .await
                    .map_err(|err| ClientError::transient(operation, err))?;
                Ok(parsed.version)
            },
            status => Err(error_from_status(operation, path.as_str(), status)),
        }
    }
}

#[async_trait]
impl SecretStoreClientTrait for HttpStoreClient {
    async fn list(&self, ctx: &RequestContext) -> Result<Vec<SecretRecord>, ClientError> {
        ctx.check()?;
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let url = self
                .base_url
                .join("v1/secrets")
                .map_err(|err| ClientError::transient("list", err))?;
            let mut request = self.client.get(url).bearer_auth(&self.token);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            let response = request
                .send()
                .await
                .map_err(|err| ClientError::transient("list", err))?;
            if !response.status().is_success() {
                return Err(error_from_status("list", "", response.status()));
            }
            let page: ListPage = response
                .json()
                .await
                .map_err(|err| ClientError::transient("list", err))?;
            self.metrics.store_pages.increment();
            records.extend(page.secrets);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(records),
            }
            ctx.check()?;
        }
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<SecretTree, ClientError> {
        ctx.check()?;
        let url = self.secret_url(path, "get")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::transient("get", err))?;
        match response.status() {
            status if status.is_success() => {
                let parsed: ValueResponse = response
                    .json()
                    .await
                    .map_err(|err| ClientError::transient("get", err))?;
                Ok(parsed.value)
            },
            status => Err(error_from_status("get", path.as_str(), status)),
        }
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<String, ClientError> {
        ctx.check()?;
        self.write(reqwest::Method::POST, "create", path, value, None)
            .await
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
        retain: Option<u32>,
    ) -> Result<String, ClientError> {
        ctx.check()?;
        self.write(reqwest::Method::PUT, "update", path, value, retain)
            .await
    }

    async fn delete(&self, ctx: &RequestContext, path: &SecretPath) -> Result<(), ClientError> {
        ctx.check()?;
        let url = self.secret_url(path, "delete")?;
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::transient("delete", err))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(error_from_status("delete", path.as_str(), status)),
        }
    }
}

/// Operations recorded by [`MemoryStoreClient`], used by tests to
/// assert dry-run purity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    List,
    Get(String),
    Create(String),
    Update(String),
    Delete(String),
}

impl StoreOp {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Create(_) | Self::Update(_) | Self::Delete(_))
    }
}

/// In-memory secret store.
///
/// The path index is guarded by a reader/writer lock: reads take the
/// shared side, mutations the exclusive side.
#[derive(Debug, Default)]
pub struct MemoryStoreClient {
    index: RwLock<IndexMap<SecretPath, SecretRecord>>,
    version: AtomicU64,
    ops: Mutex<Vec<StoreOp>>,
    failures: Mutex<HashMap<&'static str, Vec<InjectedFailure>>>,
}

impl MemoryStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, bypassing the op log.
    pub fn seed(&self, path: SecretPath, value: SecretTree, tags: BTreeMap<String, String>) {
        let version = self.next_version();
        self.index
            .write()
            .expect("store index lock poisoned")
            .insert(path.clone(), SecretRecord {
                path,
                value,
                version: Some(version),
                tags,
            });
    }

    /// Queue a failure for the next call to `operation`.
    pub fn fail_next(&self, operation: &'static str, failure: InjectedFailure) {
        self.failures
            .lock()
            .expect("store failures lock poisoned")
            .entry(operation)
            .or_default()
            .push(failure);
    }

    /// Every operation issued so far, in order.
    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.lock().expect("store ops lock poisoned").clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.ops().iter().filter(|op| op.is_mutation()).count()
    }

    /// Direct snapshot of current contents, for assertions.
    pub fn contents(&self) -> IndexMap<SecretPath, SecretTree> {
        self.index
            .read()
            .expect("store index lock poisoned")
            .iter()
            .map(|(path, record)| (path.clone(), record.value.clone()))
            .collect()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record_op(&self, op: StoreOp) {
        self.ops.lock().expect("store ops lock poisoned").push(op);
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), ClientError> {
        let mut failures = self.failures.lock().expect("store failures lock poisoned");
        match failures.get_mut(operation) {
            Some(queue) if !queue.is_empty() => Err(queue.remove(0).into_error(operation)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SecretStoreClientTrait for MemoryStoreClient {
    async fn list(&self, ctx: &RequestContext) -> Result<Vec<SecretRecord>, ClientError> {
        ctx.check()?;
        self.record_op(StoreOp::List);
        self.take_failure("list")?;
        let index = self.index.read().expect("store index lock poisoned");
        Ok(index.values().cloned().collect())
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<SecretTree, ClientError> {
        ctx.check()?;
        self.record_op(StoreOp::Get(path.to_string()));
        self.take_failure("get")?;
        let index = self.index.read().expect("store index lock poisoned");
        index
            .get(path)
            .map(|record| record.value.clone())
            .ok_or_else(|| ClientError::not_found("get", path.as_str()))
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
    ) -> Result<String, ClientError> {
        ctx.check()?;
        self.record_op(StoreOp::Create(path.to_string()));
        self.take_failure("create")?;
        let mut index = self.index.write().expect("store index lock poisoned");
        if index.contains_key(path) {
            return Err(ClientError::AlreadyExists {
                operation: "create",
                path: path.to_string(),
            });
        }
        let version = self.next_version();
        index.insert(path.clone(), SecretRecord {
            path: path.clone(),
            value: value.clone(),
            version: Some(version.clone()),
            tags: BTreeMap::new(),
        });
        Ok(version)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
        value: &SecretTree,
        _retain: Option<u32>,
    ) -> Result<String, ClientError> {
        ctx.check()?;
        self.record_op(StoreOp::Update(path.to_string()));
        self.take_failure("update")?;
        let mut index = self.index.write().expect("store index lock poisoned");
        let Some(record) = index.get_mut(path) else {
            return Err(ClientError::not_found("update", path.as_str()));
        };
        let version = self.next_version();
        record.value = value.clone();
        record.version = Some(version.clone());
        Ok(version)
    }

    async fn delete(&self, ctx: &RequestContext, path: &SecretPath) -> Result<(), ClientError> {
        ctx.check()?;
        self.record_op(StoreOp::Delete(path.to_string()));
        self.take_failure("delete")?;
        let mut index = self.index.write().expect("store index lock poisoned");
        if index.shift_remove(path).is_none() {
            return Err(ClientError::not_found("delete", path.as_str()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn path(s: &str) -> SecretPath {
        SecretPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let client = MemoryStoreClient::new();
        let ctx = RequestContext::new();
        let value = SecretTree::from([("user", SecretTree::from("admin"))]);

        let version = client.create(&ctx, &path("app/db"), &value).await.unwrap();
        assert_eq!(version, "1");
        assert_eq!(client.get(&ctx, &path("app/db")).await.unwrap(), value);
    }

    #[tokio::test]
    async fn create_on_existing_path_conflicts() {
        let client = MemoryStoreClient::new();
        let ctx = RequestContext::new();
        let value = SecretTree::from("x");

        client.create(&ctx, &path("app/db"), &value).await.unwrap();
        let result = client.create(&ctx, &path("app/db"), &value).await;
        assert!(matches!(result, Err(ClientError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn update_on_missing_path_is_not_found() {
        let client = MemoryStoreClient::new();
        let ctx = RequestContext::new();
        let result = client
            .update(&ctx, &path("ghost"), &SecretTree::from("x"), None)
            .await;
        assert!(matches!(result, Err(ClientError::NotFound { .. })));
    }

    #[tokio::test]
    async fn versions_are_monotonic_across_writes() {
        let client = MemoryStoreClient::new();
        let ctx = RequestContext::new();
        let v1 = client
            .create(&ctx, &path("a"), &SecretTree::from("x"))
            .await
            .unwrap();
        let v2 = client
            .update(&ctx, &path("a"), &SecretTree::from("y"), None)
            .await
            .unwrap();
        assert!(v2.parse::<u64>().unwrap() > v1.parse::<u64>().unwrap());
    }

    #[tokio::test]
    async fn op_log_distinguishes_reads_from_mutations() {
        let client = MemoryStoreClient::new();
        let ctx = RequestContext::new();
        client
            .create(&ctx, &path("a"), &SecretTree::from("x"))
            .await
            .unwrap();
        let _ = client.list(&ctx).await;
        assert_eq!(client.mutation_count(), 1);
    }
}
