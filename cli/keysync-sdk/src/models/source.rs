use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use keysync_core::path::normalize;
use keysync_core::{SecretPath, SecretTree};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::providers::breaker::{retry, CircuitBreaker, RetryPolicy};
use crate::providers::source::{SourceClient, SourceClientTrait};
use crate::providers::ClientError;
use crate::utils::context::RequestContext;
use crate::utils::metrics::Metrics;

fn default_max_secrets() -> usize {
    5000
}

fn default_compaction_threshold() -> usize {
    1024
}

/// A hierarchical secret namespace to read from. Read-only during a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Source {
    pub mount: String,
    #[serde(default = "default_max_secrets")]
    pub max_secrets: usize,
    #[serde(default = "default_compaction_threshold")]
    pub queue_compaction_threshold: usize,
}

impl Source {
    pub fn new(mount: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            max_secrets: default_max_secrets(),
            queue_compaction_threshold: default_compaction_threshold(),
        }
    }
}

/// Enumerates and reads secrets from a source through its client,
/// wrapping every call in the source breaker and retry policy.
#[derive(Debug)]
pub struct SourceReader {
    client: Arc<SourceClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl SourceReader {
    pub fn new(
        client: Arc<SourceClient>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            breaker,
            retry,
            metrics,
        }
    }

    /// Breadth-first listing of the leaf secrets under `source.mount`.
    ///
    /// Directories are visited at most once (re-encounters are skipped,
    /// so listing cycles terminate), and listing stops without error
    /// once `max_secrets` leaves have accumulated. When the pending
    /// queue grows past `queue_compaction_threshold` it is rewritten in
    /// place, dropping duplicate entries while preserving the relative
    /// order of the rest.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        source: &Source,
    ) -> Result<Vec<SecretPath>, ClientError> {
        let mount = normalize(&source.mount)?;
        let mount = mount.trim_end_matches('/').to_string();
        if mount.is_empty() {
            return Err(ClientError::InvalidPath(
                keysync_core::path::PathError::Empty,
            ));
        }

        let mut visited: HashSet<String> = HashSet::from([mount.clone()]);
        let mut queue: VecDeque<String> = VecDeque::from([mount]);
        let mut results: Vec<SecretPath> = Vec::new();

        while let Some(dir) = queue.pop_front() {
            if results.len() >= source.max_secrets {
                break;
            }
            ctx.check()?;

            self.metrics.source_lists.increment();
            let children = self.call_list(ctx, &dir).await?;
            for child in children {
                // a leading slash marks an absolute path from the source
                // root; anything else is relative to the listed directory
                let raw = if child.name.starts_with('/') {
                    child.name.clone()
                } else {
                    format!("{dir}/{}", child.name)
                };
                let full = match normalize(&raw) {
                    Ok(full) => full.trim_end_matches('/').to_string(),
                    Err(err) => {
                        warn!(%dir, child = %child.name, error = %err, "skipping invalid source path");
                        continue;
                    },
                };
                if child.is_dir {
                    if visited.insert(full.clone()) {
                        queue.push_back(full);
                    } else {
                        debug!(path = %full, "skipping already-visited directory");
                    }
                } else if results.len() < source.max_secrets {
                    match SecretPath::parse(&full) {
                        Ok(path) => results.push(path),
                        Err(err) => {
                            warn!(path = %full, error = %err, "skipping invalid source path");
                        },
                    }
                } else {
                    break;
                }
            }

            if queue.len() > source.queue_compaction_threshold {
                compact_queue(&mut queue);
            }
        }

        Ok(results)
    }

    /// Read the latest version of a leaf secret.
    pub async fn read(
        &self,
        ctx: &RequestContext,
        path: &SecretPath,
    ) -> Result<SecretTree, ClientError> {
        self.metrics.source_reads.increment();
        let (value, _version) = retry(&self.retry, ctx, &self.metrics, "read", || async move {
            self.breaker
                .call(&self.metrics, || self.client.read(ctx, path))
                .await
        })
        .await?;
        Ok(value)
    }

    async fn call_list(
        &self,
        ctx: &RequestContext,
        dir: &str,
    ) -> Result<Vec<crate::providers::source::ChildEntry>, ClientError> {
        retry(&self.retry, ctx, &self.metrics, "list", || async move {
            self.breaker
                .call(&self.metrics, || self.client.list_children(ctx, dir))
                .await
        })
        .await
    }
}

/// Drop queue entries that already appear earlier in the queue. O(n),
/// order of the surviving entries is preserved.
fn compact_queue(queue: &mut VecDeque<String>) {
    let mut seen = HashSet::with_capacity(queue.len());
    queue.retain(|entry| seen.insert(entry.clone()));
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::providers::breaker::BreakerConfig;
    use crate::providers::source::{InjectedFailure, MockSourceClient};
    use crate::providers::ServiceKind;
    use crate::utils::clock::SystemClock;

    fn reader(mock: MockSourceClient) -> SourceReader {
        SourceReader::new(
            Arc::new(SourceClient::Mock(mock)),
            Arc::new(CircuitBreaker::new(
                ServiceKind::Source,
                BreakerConfig::default(),
                Arc::new(SystemClock),
            )),
            RetryPolicy::default(),
            Arc::new(Metrics::default()),
        )
    }

    fn paths(found: &[SecretPath]) -> Vec<&str> {
        found.iter().map(|p| p.as_str()).collect()
    }

    #[tokio::test]
    async fn lists_exactly_the_leaf_set() {
        let mock = MockSourceClient::new();
        mock.insert_secret("secret/app/db", SecretTree::from("a"));
        mock.insert_secret("secret/app/api", SecretTree::from("b"));
        mock.insert_secret("secret/infra/dns/zone", SecretTree::from("c"));

        let found = reader(mock)
            .list(&RequestContext::new(), &Source::new("secret"))
            .await
            .unwrap();
        let mut found = paths(&found);
        found.sort();
        assert_eq!(found, vec![
            "secret/app/api",
            "secret/app/db",
            "secret/infra/dns/zone",
        ]);
    }

    #[tokio::test]
    async fn listing_is_breadth_first() {
        let mock = MockSourceClient::new();
        mock.insert_secret("secret/top", SecretTree::from("t"));
        mock.insert_secret("secret/app/db", SecretTree::from("a"));

        let found = reader(mock)
            .list(&RequestContext::new(), &Source::new("secret"))
            .await
            .unwrap();
        // the shallow leaf is found before the deeper one
        assert_eq!(paths(&found), vec!["secret/top", "secret/app/db"]);
    }

    #[tokio::test]
    async fn listing_cycles_terminate_without_duplicates() {
        let mock = MockSourceClient::new();
        mock.insert_secret("secret/a/b/leaf", SecretTree::from("x"));
        // b lists a as a child again, closing the cycle
        mock.link_dir("secret/a/b", "/secret/a");

        let found = reader(mock)
            .list(&RequestContext::new(), &Source::new("secret"))
            .await
            .unwrap();
        assert_eq!(paths(&found), vec!["secret/a/b/leaf"]);
    }

    #[tokio::test]
    async fn max_secrets_bounds_the_listing() {
        let mock = MockSourceClient::new();
        for i in 0..10 {
            mock.insert_secret(&format!("secret/leaf{i:02}"), SecretTree::from("x"));
        }
        let source = Source {
            max_secrets: 3,
            ..Source::new("secret")
        };

        let found = reader(mock)
            .list(&RequestContext::new(), &source)
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn listing_survives_queue_compaction() {
        let mock = MockSourceClient::new();
        for i in 0..8 {
            mock.insert_secret(&format!("secret/dir{i:02}/leaf"), SecretTree::from("x"));
        }
        // listing the mount enqueues 8 directories at once, so the
        // pending queue overshoots the threshold and gets compacted
        // before any of them is processed
        let source = Source {
            queue_compaction_threshold: 3,
            ..Source::new("secret")
        };

        let found = reader(mock)
            .list(&RequestContext::new(), &source)
            .await
            .unwrap();
        let expected: Vec<String> = (0..8)
            .map(|i| format!("secret/dir{i:02}/leaf"))
            .collect();
        // every leaf exactly once, in the order the directories were
        // enqueued
        assert_eq!(paths(&found), expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn invalid_mount_is_rejected() {
        let result = reader(MockSourceClient::new())
            .list(&RequestContext::new(), &Source::new("secret/../other"))
            .await;
        assert!(matches!(result, Err(ClientError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn transient_listing_failures_are_retried() {
        let mock = MockSourceClient::new();
        mock.insert_secret("secret/app", SecretTree::from("x"));
        mock.fail_next(InjectedFailure::Transient);

        let found = reader(mock)
            .list(&RequestContext::new(), &Source::new("secret"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn read_surfaces_not_found() {
        let result = reader(MockSourceClient::new())
            .read(
                &RequestContext::new(),
                &SecretPath::parse("secret/ghost").unwrap(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::NotFound { .. })));
    }

    #[test]
    fn compaction_preserves_order_and_drops_duplicates() {
        let mut queue: VecDeque<String> = ["a", "b", "a", "c", "b", "d"]
            .into_iter()
            .map(String::from)
            .collect();
        compact_queue(&mut queue);
        assert_eq!(queue, VecDeque::from(["a".to_string(), "b".into(), "c".into(), "d".into()]));
    }
}
