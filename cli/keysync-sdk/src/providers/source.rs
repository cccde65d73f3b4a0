use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use keysync_core::{SecretPath, SecretTree};
use serde::Deserialize;
use url::Url;

use super::{error_from_status, ClientError};
use crate::utils::context::RequestContext;

/// A single entry returned by a directory listing. Directories are
/// marked by a trailing `/` on the wire; the flag is split out here so
/// callers don't re-parse names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub is_dir: bool,
}

impl ChildEntry {
    pub fn from_wire_name(name: &str) -> Self {
        match name.strip_suffix('/') {
            Some(dir) => Self {
                name: dir.to_string(),
                is_dir: true,
            },
            None => Self {
                name: name.to_string(),
                is_dir: false,
            },
        }
    }
}

/// Either a client for a real KV vault, or an in-memory client for
/// testing.
#[derive(Debug)]
#[enum_dispatch(SourceClientTrait)]
pub enum SourceClient {
    Vault(VaultClient),
    Mock(MockSourceClient),
}

#[async_trait]
#[enum_dispatch]
pub trait SourceClientTrait {
    /// List the direct children of a directory node. `path` is the full
    /// source path including the mount as its first segment.
    async fn list_children(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<Vec<ChildEntry>, ClientError>;

    /// Read the latest version of a leaf secret.
    async fn read(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<(SecretTree, Option<String>), ClientError>;
}

/// A KV-v2 style vault client.
///
/// The first path segment is the mount; listing goes through the
/// `metadata` endpoint, reads through the `data` endpoint. Token refresh
/// and credential acquisition are the caller's concern.
#[derive(Debug)]
pub struct VaultClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

#[derive(Deserialize)]
struct VaultListResponse {
    data: VaultListKeys,
}

#[derive(Deserialize)]
struct VaultListKeys {
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct VaultReadResponse {
    data: VaultReadData,
}

#[derive(Deserialize)]
struct VaultReadData {
    data: SecretTree,
    metadata: Option<VaultReadMetadata>,
}

#[derive(Deserialize)]
struct VaultReadMetadata {
    version: Option<u64>,
}

impl VaultClient {
    pub fn new(base_url: &Url, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.clone(),
            token: token.to_string(),
        }
    }

    /// Split `mount/rest/of/path` into `(mount, rest)`.
    fn split_mount(path: &str) -> (&str, &str) {
        match path.split_once('/') {
            Some((mount, rest)) => (mount, rest),
            None => (path, ""),
        }
    }

    fn endpoint(
        &self,
        segment: &str,
        path: &str,
        operation: &'static str,
    ) -> Result<Url, ClientError> {
        let (mount, rest) = Self::split_mount(path.trim_end_matches('/'));
        self.base_url
            .join(&format!("v1/{mount}/{segment}/{rest}"))
            .map_err(|err| ClientError::transient(operation, err))
    }
}

#[async_trait]
impl SourceClientTrait for VaultClient {
    async fn list_children(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<Vec<ChildEntry>, ClientError> {
        ctx.check()?;
        let url = self.endpoint("metadata", path, "list")?;
        let response = self
            .client
            .get(url)
            .query(&[("list", "true")])
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|err| ClientError::transient("list", err))?;

        match response.status() {
            status if status.is_success() => {
                let parsed: VaultListResponse = response
                    .json()
                    .await
                    .map_err(|err| ClientError::transient("list", err))?;
                Ok(parsed
                    .data
                    .keys
                    .iter()
                    .map(|name| ChildEntry::from_wire_name(name))
                    .collect())
            },
            status => Err(error_from_status("list", path, status)),
        }
    }

    async fn read(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<(SecretTree, Option<String>), ClientError> {
        ctx.check()?;
        let url = self.endpoint("data", path.as_str(), "read")?;
        let response = self
            .client
            .get(url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|err| ClientError::transient("read", err))?;

        match response.status() {
            status if status.is_success() => {
                let parsed: VaultReadResponse = response
                    .json()
                    .await
                    .map_err(|err| ClientError::transient("read", err))?;
                let version = parsed
                    .data
                    .metadata
                    .and_then(|meta| meta.version)
                    .map(|v| v.to_string());
                Ok((parsed.data.data, version))
            },
            status => Err(error_from_status("read", path.as_str(), status)),
        }
    }
}

/// Failure kinds a mock client can be primed with.
#[derive(Debug, Clone, Copy)]
pub enum InjectedFailure {
    Transient,
    RateLimited,
    PermissionDenied,
    NotFound,
}

impl InjectedFailure {
    pub(crate) fn into_error(self, operation: &'static str) -> ClientError {
        match self {
            Self::Transient => ClientError::transient(operation, "injected"),
            Self::RateLimited => ClientError::RateLimited { operation },
            Self::PermissionDenied => ClientError::PermissionDenied { operation },
            Self::NotFound => ClientError::not_found(operation, "injected"),
        }
    }
}

/// In-memory source for tests: a directory tree built from inserted
/// secret paths, plus explicit directory links for cycle scenarios.
#[derive(Debug, Default)]
pub struct MockSourceClient {
    children: Mutex<HashMap<String, Vec<ChildEntry>>>,
    secrets: Mutex<HashMap<String, (SecretTree, Option<String>)>>,
    failures: Mutex<Vec<InjectedFailure>>,
}

impl MockSourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a leaf secret, registering every ancestor directory.
    pub fn insert_secret(&self, path: &str, value: SecretTree) {
        let path = path.trim_matches('/');
        self.secrets
            .lock()
            .expect("mock secrets lock poisoned")
            .insert(path.to_string(), (value, Some("1".to_string())));

        let segments: Vec<&str> = path.split('/').collect();
        let mut children = self.children.lock().expect("mock children lock poisoned");
        for depth in 1..segments.len() {
            let parent = segments[..depth].join("/");
            let entry = ChildEntry {
                name: segments[depth].to_string(),
                is_dir: depth + 1 < segments.len(),
            };
            let listing = children.entry(parent).or_default();
            if !listing.contains(&entry) {
                listing.push(entry);
            }
        }
    }

    /// Register `child` as a subdirectory of `parent`, without content.
    /// The name is kept verbatim, so absolute (leading `/`) entries can
    /// be used to build listing cycles.
    pub fn link_dir(&self, parent: &str, child: &str) {
        let entry = ChildEntry {
            name: child.to_string(),
            is_dir: true,
        };
        let mut children = self.children.lock().expect("mock children lock poisoned");
        let listing = children.entry(parent.trim_matches('/').to_string()).or_default();
        if !listing.contains(&entry) {
            listing.push(entry);
        }
    }

    /// Queue a failure to be returned by the next call.
    pub fn fail_next(&self, failure: InjectedFailure) {
        self.failures
            .lock()
            .expect("mock failures lock poisoned")
            .push(failure);
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), ClientError> {
        let mut failures = self.failures.lock().expect("mock failures lock poisoned");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0).into_error(operation))
        }
    }
}

#[async_trait]
impl SourceClientTrait for MockSourceClient {
    async fn list_children(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<Vec<ChildEntry>, ClientError> {
        ctx.check()?;
        self.take_failure("list")?;
        let children = self.children.lock().expect("mock children lock poisoned");
        Ok(children
            .get(path.trim_matches('/'))
            .cloned()
            .unwrap_or_default())
    }

    async fn read(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<(SecretTree, Option<String>), ClientError> {
        ctx.check()?;
        self.take_failure("read")?;
        let secrets = self.secrets.lock().expect("mock secrets lock poisoned");
        secrets
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| ClientError::not_found("read", path.as_str()))
    }
}
