use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use url::Url;

use super::source::InjectedFailure;
use super::{error_from_status, ClientError};
use crate::utils::context::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Suspended,
    PendingClosure,
}

/// An account known to the organization directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    pub name: String,
    pub status: AccountStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ou_path: Option<Vec<String>>,
}

/// Either a client for a real organization directory service, or an
/// in-memory client for testing.
#[derive(Debug)]
#[enum_dispatch(OrgDirectoryClientTrait)]
pub enum OrgDirectoryClient {
    Http(HttpOrgClient),
    Mock(MockOrgClient),
}

#[async_trait]
#[enum_dispatch]
pub trait OrgDirectoryClientTrait {
    /// Whether the execution context can reach the organization API at
    /// all. Checked once before traversal starts.
    fn can_access(&self) -> bool;

    async fn list_accounts_in_ou(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<AccountInfo>, ClientError>;

    async fn list_child_ous(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<String>, ClientError>;

    async fn list_all_accounts(&self, ctx: &RequestContext)
        -> Result<Vec<AccountInfo>, ClientError>;
}

/// REST organization-directory client: accounts and organizational
/// units behind a bearer-authenticated API.
#[derive(Debug)]
pub struct HttpOrgClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<AccountInfo>,
}

#[derive(Deserialize)]
struct ChildOusResponse {
    ous: Vec<String>,
}

impl HttpOrgClient {
    pub fn new(base_url: &Url, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.clone(),
            token: token.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
    ) -> Result<T, ClientError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| ClientError::transient(operation, err))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ClientError::transient(operation, err))?;
        if !response.status().is_success() {
            return Err(error_from_status(operation, path, response.status()));
        }
        response
            .json()
            .await
            .map_err(|err| ClientError::transient(operation, err))
    }
}

#[async_trait]
impl OrgDirectoryClientTrait for HttpOrgClient {
    fn can_access(&self) -> bool {
        true
    }

    async fn list_accounts_in_ou(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<AccountInfo>, ClientError> {
        ctx.check()?;
        let response: AccountsResponse = self
            .get_json(
                "list_accounts_in_ou",
                &format!("v1/ous/{}/accounts", url_escape(ou)),
            )
            .await?;
        Ok(response.accounts)
    }

    async fn list_child_ous(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<String>, ClientError> {
        ctx.check()?;
        let response: ChildOusResponse = self
            .get_json("list_child_ous", &format!("v1/ous/{}/children", url_escape(ou)))
            .await?;
        Ok(response.ous)
    }

    async fn list_all_accounts(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<AccountInfo>, ClientError> {
        ctx.check()?;
        let response: AccountsResponse = self.get_json("list_all_accounts", "v1/accounts").await?;
        Ok(response.accounts)
    }
}

fn url_escape(segment: &str) -> String {
    segment.replace('/', "%2F")
}

/// In-memory organization tree.
#[derive(Debug, Default)]
pub struct MockOrgClient {
    accessible: bool,
    accounts_by_ou: Mutex<HashMap<String, Vec<AccountInfo>>>,
    child_ous: Mutex<HashMap<String, Vec<String>>>,
    denied_ous: Mutex<Vec<String>>,
    failures: Mutex<Vec<InjectedFailure>>,
    calls: AtomicUsize,
}

impl MockOrgClient {
    pub fn new() -> Self {
        Self {
            accessible: true,
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            accessible: false,
            ..Self::default()
        }
    }

    pub fn add_account(&self, ou: &str, account: AccountInfo) {
        self.accounts_by_ou
            .lock()
            .expect("org accounts lock poisoned")
            .entry(ou.to_string())
            .or_default()
            .push(account);
    }

    pub fn add_child_ou(&self, parent: &str, child: &str) {
        self.child_ous
            .lock()
            .expect("org ous lock poisoned")
            .entry(parent.to_string())
            .or_default()
            .push(child.to_string());
    }

    /// Make child-OU listing fail for `ou` with a permission error.
    pub fn deny_ou(&self, ou: &str) {
        self.denied_ous
            .lock()
            .expect("org denied lock poisoned")
            .push(ou.to_string());
    }

    pub fn fail_next(&self, failure: InjectedFailure) {
        self.failures
            .lock()
            .expect("org failures lock poisoned")
            .push(failure);
    }

    /// Number of listing calls issued so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), ClientError> {
        let mut failures = self.failures.lock().expect("org failures lock poisoned");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0).into_error(operation))
        }
    }
}

#[async_trait]
impl OrgDirectoryClientTrait for MockOrgClient {
    fn can_access(&self) -> bool {
        self.accessible
    }

    async fn list_accounts_in_ou(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<AccountInfo>, ClientError> {
        ctx.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure("list_accounts_in_ou")?;
        let accounts = self
            .accounts_by_ou
            .lock()
            .expect("org accounts lock poisoned");
        Ok(accounts.get(ou).cloned().unwrap_or_default())
    }

    async fn list_child_ous(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<String>, ClientError> {
        ctx.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure("list_child_ous")?;
        if self
            .denied_ous
            .lock()
            .expect("org denied lock poisoned")
            .iter()
            .any(|denied| denied == ou)
        {
            return Err(ClientError::PermissionDenied {
                operation: "list_child_ous",
            });
        }
        let ous = self.child_ous.lock().expect("org ous lock poisoned");
        Ok(ous.get(ou).cloned().unwrap_or_default())
    }

    async fn list_all_accounts(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<AccountInfo>, ClientError> {
        ctx.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure("list_all_accounts")?;
        let accounts = self
            .accounts_by_ou
            .lock()
            .expect("org accounts lock poisoned");
        let mut all: Vec<AccountInfo> = accounts.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}

/// Convenience constructor used by tests throughout the crate.
pub fn account(id: &str, tags: &[(&str, &str)]) -> AccountInfo {
    AccountInfo {
        id: id.to_string(),
        name: format!("account-{id}"),
        status: AccountStatus::Active,
        email: None,
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ou_path: None,
    }
}
