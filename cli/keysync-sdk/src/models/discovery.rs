use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::target::Target;
use crate::providers::breaker::{retry, CircuitBreaker, RetryPolicy};
use crate::providers::org::{AccountInfo, AccountStatus, OrgDirectoryClient, OrgDirectoryClientTrait};
use crate::providers::ClientError;
use crate::utils::clock::Clock;
use crate::utils::context::RequestContext;
use crate::utils::metrics::Metrics;

pub const DEFAULT_DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    #[default]
    Organization,
}

/// A glob over one tag: both the key and the value pattern support `*`
/// (zero or more characters) and `?` (exactly one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct TagGlob {
    pub key: String,
    pub value_pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum MatchMode {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

fn default_status_in() -> Vec<AccountStatus> {
    vec![AccountStatus::Active]
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kind: DiscoveryKind,
    #[serde(default)]
    pub root_ou: Option<String>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub tag_globs: Vec<TagGlob>,
    #[serde(default)]
    pub and_or: MatchMode,
    #[serde(default = "default_status_in")]
    pub status_in: Vec<AccountStatus>,
    #[serde(default)]
    pub role: Option<String>,
    /// Cache TTL override in seconds.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: DiscoveryKind::Organization,
            root_ou: None,
            recursive: false,
            tag_globs: Vec::new(),
            and_or: MatchMode::And,
            status_in: default_status_in(),
            role: None,
            cache_ttl_secs: None,
        }
    }
}

impl DiscoveryConfig {
    fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn cache_ttl(&self) -> Duration {
        self.cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DISCOVERY_CACHE_TTL)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("organization directory is not reachable from this execution context")]
    NoAccess,
    #[error("invalid tag glob {pattern:?}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug)]
struct CachedAccounts {
    fetched_at: Instant,
    accounts: Vec<AccountInfo>,
}

struct CompiledGlob {
    key: Regex,
    value: Regex,
}

fn glob_to_regex(pattern: &str) -> Result<Regex, DiscoveryError> {
    let mut expr = String::with_capacity(pattern.len() + 4);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|source| DiscoveryError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Lists accounts from the organization directory, filtered by tag
/// globs and OU subtree, with a TTL cache keyed by the config hash.
#[derive(Debug)]
pub struct Discovery {
    client: Arc<OrgDirectoryClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    cache: RwLock<HashMap<u64, CachedAccounts>>,
    // single-flight guard: one refresh per key at a time
    refresh: Mutex<()>,
}

impl Discovery {
    pub fn new(
        client: Arc<OrgDirectoryClient>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            breaker,
            retry,
            clock,
            metrics,
            cache: RwLock::new(HashMap::new()),
            refresh: Mutex::new(()),
        }
    }

    /// Discover accounts matching `config`.
    pub async fn discover(
        &self,
        ctx: &RequestContext,
        config: &DiscoveryConfig,
    ) -> Result<Vec<AccountInfo>, DiscoveryError> {
        if !self.client.can_access() {
            return Err(DiscoveryError::NoAccess);
        }

        let key = config.cache_key();
        if let Some(accounts) = self.cached(key, config).await {
            self.metrics.cache_hits.increment();
            return Ok(accounts);
        }

        let _refresh = self.refresh.lock().await;
        if let Some(accounts) = self.cached(key, config).await {
            self.metrics.cache_hits.increment();
            return Ok(accounts);
        }

        self.metrics.cache_misses.increment();
        let accounts = self.enumerate(ctx, config).await?;
        let accounts = self.filter(config, accounts)?;

        self.cache.write().await.insert(key, CachedAccounts {
            fetched_at: self.clock.now(),
            accounts: accounts.clone(),
        });
        Ok(accounts)
    }

    async fn cached(&self, key: u64, config: &DiscoveryConfig) -> Option<Vec<AccountInfo>> {
        let cache = self.cache.read().await;
        let cached = cache.get(&key)?;
        let age = self.clock.now().duration_since(cached.fetched_at);
        (age < config.cache_ttl()).then(|| cached.accounts.clone())
    }

    async fn enumerate(
        &self,
        ctx: &RequestContext,
        config: &DiscoveryConfig,
    ) -> Result<Vec<AccountInfo>, DiscoveryError> {
        match (&config.root_ou, config.recursive) {
            (Some(root), true) => self.walk_ou_tree(ctx, root).await,
            (Some(root), false) => Ok(self.list_accounts(ctx, root).await?),
            (None, _) if !config.tag_globs.is_empty() => {
                self.metrics.discovery_calls.increment();
                let accounts = retry(&self.retry, ctx, &self.metrics, "list_all_accounts", || async move {
                    self.breaker
                        .call(&self.metrics, || self.client.list_all_accounts(ctx))
                        .await
                })
                .await?;
                Ok(accounts)
            },
            (None, _) => {
                warn!("discovery enabled without root_ou or tag_globs; nothing to enumerate");
                Ok(Vec::new())
            },
        }
    }

    /// Depth-first walk of the OU tree rooted at `root`. A failure to
    /// enumerate one OU's children is logged, counted, and treated as
    /// an empty listing; accounts found elsewhere still count.
    async fn walk_ou_tree(
        &self,
        ctx: &RequestContext,
        root: &str,
    ) -> Result<Vec<AccountInfo>, DiscoveryError> {
        let mut accounts = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([root.to_string()]);
        let mut stack: Vec<String> = vec![root.to_string()];

        while let Some(ou) = stack.pop() {
            ctx.check()?;
            accounts.extend(self.list_accounts(ctx, &ou).await?);

            self.metrics.discovery_calls.increment();
            let ou_ref = ou.as_str();
            let children = retry(&self.retry, ctx, &self.metrics, "list_child_ous", || async move {
                self.breaker
                    .call(&self.metrics, || self.client.list_child_ous(ctx, ou_ref))
                    .await
            })
            .await;
            match children {
                Ok(children) => {
                    for child in children.into_iter().rev() {
                        if seen.insert(child.clone()) {
                            stack.push(child);
                        }
                    }
                },
                Err(err) => {
                    self.metrics.ou_listing_failures.increment();
                    warn!(%ou, error = %err, "failed to list child OUs; continuing");
                },
            }
        }
        Ok(accounts)
    }

    async fn list_accounts(
        &self,
        ctx: &RequestContext,
        ou: &str,
    ) -> Result<Vec<AccountInfo>, ClientError> {
        self.metrics.discovery_calls.increment();
        retry(&self.retry, ctx, &self.metrics, "list_accounts_in_ou", || async move {
            self.breaker
                .call(&self.metrics, || self.client.list_accounts_in_ou(ctx, ou))
                .await
        })
        .await
    }

    fn filter(
        &self,
        config: &DiscoveryConfig,
        accounts: Vec<AccountInfo>,
    ) -> Result<Vec<AccountInfo>, DiscoveryError> {
        let globs: Vec<CompiledGlob> = config
            .tag_globs
            .iter()
            .map(|glob| {
                Ok(CompiledGlob {
                    key: glob_to_regex(&glob.key)?,
                    value: glob_to_regex(&glob.value_pattern)?,
                })
            })
            .collect::<Result<_, DiscoveryError>>()?;

        let matches_glob = |account: &AccountInfo, glob: &CompiledGlob| {
            account
                .tags
                .iter()
                .any(|(key, value)| glob.key.is_match(key) && glob.value.is_match(value))
        };

        let filtered = accounts
            .into_iter()
            .filter(|account| {
                if !config.status_in.is_empty() && !config.status_in.contains(&account.status) {
                    return false;
                }
                if globs.is_empty() {
                    return true;
                }
                match config.and_or {
                    MatchMode::And => globs.iter().all(|glob| matches_glob(account, glob)),
                    MatchMode::Or => globs.iter().any(|glob| matches_glob(account, glob)),
                }
            })
            .collect();
        Ok(filtered)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ExpandError {
    #[error("expanded target name {0:?} collides with another target")]
    NameCollision(String),
}

/// Expand per-account target templates into concrete targets, one per
/// discovered account (`<template>-<account_id>`), carrying the
/// template's imports, overrides, and filters. Non-template targets
/// pass through unchanged.
pub fn expand_targets(
    targets: Vec<Target>,
    accounts: &[AccountInfo],
) -> Result<Vec<Target>, ExpandError> {
    let mut expanded: Vec<Target> = Vec::with_capacity(targets.len());
    let mut names: HashSet<String> = HashSet::new();

    for target in targets {
        if !target.per_account {
            if !names.insert(target.name.clone()) {
                return Err(ExpandError::NameCollision(target.name));
            }
            expanded.push(target);
            continue;
        }
        for account in accounts {
            let name = format!("{}-{}", target.name, account.id);
            if !names.insert(name.clone()) {
                return Err(ExpandError::NameCollision(name));
            }
            debug!(template = %target.name, account = %account.id, target = %name, "expanded target");
            expanded.push(Target {
                name,
                per_account: false,
                account_id: Some(account.id.clone()),
                ..target.clone()
            });
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::target::TargetKind;
    use crate::providers::breaker::BreakerConfig;
    use crate::providers::org::{account, MockOrgClient};
    use crate::providers::ServiceKind;
    use crate::utils::clock::ManualClock;

    struct Fixture {
        discovery: Discovery,
        client: Arc<OrgDirectoryClient>,
        clock: Arc<ManualClock>,
    }

    fn fixture(mock: MockOrgClient) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let client = Arc::new(OrgDirectoryClient::Mock(mock));
        let discovery = Discovery::new(
            Arc::clone(&client),
            Arc::new(CircuitBreaker::new(
                ServiceKind::Discovery,
                BreakerConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
            )),
            RetryPolicy::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::new(Metrics::default()),
        );
        Fixture {
            discovery,
            client,
            clock,
        }
    }

    fn mock_call_count(client: &OrgDirectoryClient) -> usize {
        match client {
            OrgDirectoryClient::Mock(mock) => mock.call_count(),
            _ => panic!("expected mock client"),
        }
    }

    fn glob(key: &str, value: &str) -> TagGlob {
        TagGlob {
            key: key.to_string(),
            value_pattern: value.to_string(),
        }
    }

    fn tag_config(globs: Vec<TagGlob>, and_or: MatchMode) -> DiscoveryConfig {
        DiscoveryConfig {
            enabled: true,
            tag_globs: globs,
            and_or,
            ..DiscoveryConfig::default()
        }
    }

    fn ids(accounts: &[AccountInfo]) -> Vec<&str> {
        accounts.iter().map(|a| a.id.as_str()).collect()
    }

    #[tokio::test]
    async fn and_requires_every_glob_or_matches_any() {
        let mock = MockOrgClient::new();
        mock.add_account("root", account("1", &[("env", "prod"), ("role", "a")]));
        mock.add_account("root", account("2", &[("env", "stg"), ("role", "a")]));
        mock.add_account("root", account("3", &[("env", "prod")]));
        let fx = fixture(mock);
        let ctx = RequestContext::new();

        let globs = vec![glob("env", "pr*"), glob("role", "a")];

        let matched = fx
            .discovery
            .discover(&ctx, &tag_config(globs.clone(), MatchMode::And))
            .await
            .unwrap();
        assert_eq!(ids(&matched), vec!["1"]);

        let matched = fx
            .discovery
            .discover(&ctx, &tag_config(globs, MatchMode::Or))
            .await
            .unwrap();
        assert_eq!(ids(&matched), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn question_mark_matches_exactly_one_character() {
        let mock = MockOrgClient::new();
        mock.add_account("root", account("1", &[("env", "stg")]));
        mock.add_account("root", account("2", &[("env", "stage")]));
        let fx = fixture(mock);

        let matched = fx
            .discovery
            .discover(
                &RequestContext::new(),
                &tag_config(vec![glob("env", "st?")], MatchMode::And),
            )
            .await
            .unwrap();
        assert_eq!(ids(&matched), vec!["1"]);
    }

    #[tokio::test]
    async fn recursive_walk_visits_nested_ous() {
        let mock = MockOrgClient::new();
        mock.add_account("root", account("1", &[]));
        mock.add_child_ou("root", "root/a");
        mock.add_child_ou("root/a", "root/a/deep");
        mock.add_account("root/a", account("2", &[]));
        mock.add_account("root/a/deep", account("3", &[]));
        let fx = fixture(mock);

        let config = DiscoveryConfig {
            enabled: true,
            root_ou: Some("root".to_string()),
            recursive: true,
            status_in: Vec::new(),
            ..DiscoveryConfig::default()
        };
        let mut found = fx
            .discovery
            .discover(&RequestContext::new(), &config)
            .await
            .unwrap();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(ids(&found), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn non_recursive_lists_direct_accounts_only() {
        let mock = MockOrgClient::new();
        mock.add_account("root", account("1", &[]));
        mock.add_child_ou("root", "root/a");
        mock.add_account("root/a", account("2", &[]));
        let fx = fixture(mock);

        let config = DiscoveryConfig {
            enabled: true,
            root_ou: Some("root".to_string()),
            recursive: false,
            ..DiscoveryConfig::default()
        };
        let found = fx
            .discovery
            .discover(&RequestContext::new(), &config)
            .await
            .unwrap();
        assert_eq!(ids(&found), vec!["1"]);
    }

    #[tokio::test]
    async fn child_ou_failure_is_tolerated() {
        let mock = MockOrgClient::new();
        mock.add_account("root", account("1", &[]));
        mock.add_child_ou("root", "root/ok");
        mock.add_account("root/ok", account("2", &[]));
        mock.deny_ou("root/ok");
        let fx = fixture(mock);

        let config = DiscoveryConfig {
            enabled: true,
            root_ou: Some("root".to_string()),
            recursive: true,
            ..DiscoveryConfig::default()
        };
        let found = fx
            .discovery
            .discover(&RequestContext::new(), &config)
            .await
            .unwrap();
        // the denied subtree contributes its direct accounts but no
        // grandchildren; the walk itself keeps going
        assert_eq!(ids(&found), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn suspended_accounts_are_rejected_by_default() {
        let mock = MockOrgClient::new();
        let mut suspended = account("2", &[("env", "prod")]);
        suspended.status = AccountStatus::Suspended;
        mock.add_account("root", account("1", &[("env", "prod")]));
        mock.add_account("root", suspended);
        let fx = fixture(mock);

        let found = fx
            .discovery
            .discover(
                &RequestContext::new(),
                &tag_config(vec![glob("env", "prod")], MatchMode::And),
            )
            .await
            .unwrap();
        assert_eq!(ids(&found), vec!["1"]);
    }

    #[tokio::test]
    async fn results_are_cached_by_config_hash() {
        let mock = MockOrgClient::new();
        mock.add_account("root", account("1", &[("env", "prod")]));
        let fx = fixture(mock);
        let ctx = RequestContext::new();
        let config = tag_config(vec![glob("env", "prod")], MatchMode::And);

        fx.discovery.discover(&ctx, &config).await.unwrap();
        let calls_after_first = mock_call_count(&fx.client);
        fx.discovery.discover(&ctx, &config).await.unwrap();
        assert_eq!(mock_call_count(&fx.client), calls_after_first);

        // a different config misses the cache
        let other = tag_config(vec![glob("env", "*")], MatchMode::And);
        fx.discovery.discover(&ctx, &other).await.unwrap();
        assert!(mock_call_count(&fx.client) > calls_after_first);

        // and the TTL expires
        fx.clock.advance(DEFAULT_DISCOVERY_CACHE_TTL + Duration::from_secs(1));
        fx.discovery.discover(&ctx, &config).await.unwrap();
        assert!(mock_call_count(&fx.client) > calls_after_first + 1);
    }

    #[tokio::test]
    async fn unreachable_directory_is_no_access() {
        let fx = fixture(MockOrgClient::unreachable());
        let result = fx
            .discovery
            .discover(
                &RequestContext::new(),
                &tag_config(vec![glob("env", "*")], MatchMode::And),
            )
            .await;
        assert!(matches!(result, Err(DiscoveryError::NoAccess)));
    }

    #[test]
    fn expansion_clones_template_per_account() {
        let mut template = Target::new("prod", TargetKind::Memory);
        template.per_account = true;
        template.imports = vec!["base".to_string()];
        let accounts = [account("111", &[]), account("222", &[])];

        let expanded =
            expand_targets(vec![Target::new("base", TargetKind::Memory), template], &accounts)
                .unwrap();
        let names: Vec<&str> = expanded.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["base", "prod-111", "prod-222"]);
        assert_eq!(expanded[1].account_id.as_deref(), Some("111"));
        assert_eq!(expanded[1].imports, vec!["base".to_string()]);
        assert!(!expanded[1].per_account);
    }

    #[test]
    fn expansion_detects_name_collisions() {
        let mut template = Target::new("prod", TargetKind::Memory);
        template.per_account = true;
        let fixed = Target::new("prod-111", TargetKind::Memory);
        let accounts = [account("111", &[])];

        let err = expand_targets(vec![fixed, template], &accounts).unwrap_err();
        assert_eq!(err, ExpandError::NameCollision("prod-111".to_string()));
    }
}
