pub mod summary;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use keysync_core::path::{normalize, PathError};
use keysync_core::{SecretPath, SecretTree};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

pub use summary::{EntryFailure, RunStatus, RunSummary, TargetReport};

use super::diff::{self, render, DiffEntry, DiffKind, DiffSummary, RenderError, RenderOptions};
use super::discovery::{expand_targets, DiscoveryError, ExpandError};
use super::merge::{merge_bounded, MergeError};
use super::plan::{self, Plan, PlanError};
use super::source::Source;
use super::store::TargetStore;
use super::target::{CompiledFilters, FilterError, Target, BASE_MERGED};
use super::MergedBundle;
use crate::keysync::{Keysync, StoreFactoryError};
use crate::providers::blob::BlobMergeError;
use crate::providers::ClientError;
use crate::utils::context::RequestContext;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Suppress every mutation; reads and diffs proceed.
    pub dry_run: bool,
    /// Render per-target diffs into the target reports.
    pub emit_diff: bool,
    pub render: RenderOptions,
    /// Concurrent source reads during the merge phase.
    pub source_concurrency: usize,
    /// Concurrent targets within a plan level.
    pub target_concurrency: usize,
    /// Concurrent entry applies within a target; entries apply
    /// sequentially when unset, keeping failures attributable.
    pub entry_concurrency: Option<usize>,
    /// Defensive node limit for merged values.
    pub merge_node_limit: Option<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            emit_diff: false,
            render: RenderOptions::default(),
            source_concurrency: 10,
            target_concurrency: 10,
            entry_concurrency: None,
            merge_node_limit: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Blob(#[from] BlobMergeError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    StoreFactory(#[from] StoreFactoryError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("import {import:?} of target {target:?} has no materialized output")]
    CircularImports { target: String, import: String },
    #[error("target {0:?} is a per-account template but discovery is not enabled")]
    TemplateWithoutDiscovery(String),
}

/// Drives one run: merge phase, barrier, then the sync phase over the
/// plan. Owns the plan, the in-memory bundles, and all transient state
/// for the duration of the run.
#[derive(Debug)]
pub struct PipelineExecutor<'a> {
    keysync: &'a Keysync,
    options: PipelineOptions,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(keysync: &'a Keysync, options: PipelineOptions) -> Self {
        Self { keysync, options }
    }

    /// Expand discovery templates and build the plan without touching
    /// any store. Backs the `plan` command.
    pub async fn plan(
        &self,
        ctx: &RequestContext,
        targets: Vec<Target>,
    ) -> Result<Plan, PipelineError> {
        self.prepare(ctx, targets).await
    }

    /// Execute the full pipeline. Never panics or returns an error: the
    /// outcome, including failures, is the summary.
    pub async fn run(&self, ctx: &RequestContext, targets: Vec<Target>) -> RunSummary {
        let started = self.keysync.clock.now();
        let mut summary = RunSummary {
            status: RunStatus::Ok,
            request_id: ctx.request_id().to_string(),
            dry_run: self.options.dry_run,
            cancelled: false,
            merged_paths: 0,
            targets: Vec::new(),
            plan_error: None,
            fatal_error: None,
            ou_listing_failures: 0,
            elapsed_ms: 0,
        };

        let plan = match self.prepare(ctx, targets).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(request_id = %ctx.request_id(), error = %err, "planning failed");
                summary.plan_error = Some(err.to_string());
                return self.finish(summary, started);
            },
        };
        info!(
            request_id = %ctx.request_id(),
            targets = plan.len(),
            dry_run = self.options.dry_run,
            "plan built, starting merge phase"
        );

        let merge_started = self.keysync.clock.now();
        let base = match self.merge_phase(ctx).await {
            Ok(base) => base,
            Err(err) => {
                summary.cancelled = ctx.is_cancelled();
                if summary.cancelled {
                    info!(request_id = %ctx.request_id(), "merge phase cancelled");
                } else {
                    warn!(request_id = %ctx.request_id(), error = %err, "merge phase failed");
                    summary.fatal_error = Some(err.to_string());
                }
                return self.finish(summary, started);
            },
        };
        self.keysync
            .metrics
            .merge_phase
            .record(self.keysync.clock.now().duration_since(merge_started));
        summary.merged_paths = base.len();
        info!(request_id = %ctx.request_id(), paths = base.len(), "merge phase complete");

        let sync_started = self.keysync.clock.now();
        let bundles: RwLock<HashMap<String, MergedBundle>> =
            RwLock::new(HashMap::from([(BASE_MERGED.to_string(), base)]));
        let semaphore = Arc::new(Semaphore::new(self.options.target_concurrency.max(1)));

        let levels = plan.levels();
        for (index, level) in levels.iter().enumerate() {
            if ctx.is_cancelled() {
                for target in levels[index..].iter().flatten() {
                    summary.targets.push(TargetReport::skipped(&target.name));
                }
                break;
            }
            let reports = join_all(
                level
                    .iter()
                    .map(|target| self.sync_target(ctx, target, &bundles, &semaphore)),
            )
            .await;
            summary.targets.extend(reports);
        }
        self.keysync
            .metrics
            .sync_phase
            .record(self.keysync.clock.now().duration_since(sync_started));

        summary.cancelled = ctx.is_cancelled();
        self.finish(summary, started)
    }

    async fn prepare(
        &self,
        ctx: &RequestContext,
        targets: Vec<Target>,
    ) -> Result<Plan, PipelineError> {
        let targets = match &self.keysync.discovery {
            Some(setup) if setup.config.enabled => {
                let accounts = setup.engine.discover(ctx, &setup.config).await?;
                info!(
                    request_id = %ctx.request_id(),
                    accounts = accounts.len(),
                    "discovery returned accounts"
                );
                expand_targets(targets, &accounts)?
            },
            _ => {
                if let Some(template) = targets.iter().find(|t| t.per_account) {
                    return Err(PipelineError::TemplateWithoutDiscovery(template.name.clone()));
                }
                targets
            },
        };
        Ok(plan::build(targets)?)
    }

    /// Read every configured source in order, fold overlapping paths
    /// with the merge law, and stream the result to the blob store
    /// under `base_merged`.
    async fn merge_phase(&self, ctx: &RequestContext) -> Result<MergedBundle, PipelineError> {
        let mut bundle = MergedBundle::new();
        for source in &self.keysync.sources {
            let paths = self.keysync.reader.list(ctx, source).await?;
            debug!(mount = %source.mount, secrets = paths.len(), "listed source");

            let mount_prefix = format!("{}/", normalize(&source.mount)?.trim_end_matches('/'));
            let semaphore = Arc::new(Semaphore::new(self.options.source_concurrency.max(1)));
            let reads = join_all(paths.iter().map(|path| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| ClientError::Cancelled)?;
                    let value = self.keysync.reader.read(ctx, path).await?;
                    Ok::<_, ClientError>((path.clone(), value))
                }
            }))
            .await;

            for result in reads {
                let (path, value) = result?;
                // secrets are keyed by their path relative to the mount,
                // which is what lets overlapping sources merge
                let relative = path
                    .as_str()
                    .strip_prefix(&mount_prefix)
                    .unwrap_or(path.as_str());
                let relative = SecretPath::parse(relative).map_err(ClientError::from)?;
                match bundle.get(&relative) {
                    Some(existing) => {
                        let merged =
                            merge_bounded(existing, &value, self.options.merge_node_limit)?;
                        bundle.insert(relative, merged);
                    },
                    None => {
                        bundle.insert(relative, value);
                    },
                }
            }
        }

        if !self.options.dry_run {
            if let Some(store) = &self.keysync.merge_store {
                for (path, value) in &bundle {
                    store.write(ctx, BASE_MERGED, path, value).await?;
                }
            }
        }
        Ok(bundle)
    }

    async fn sync_target(
        &self,
        ctx: &RequestContext,
        target: &Target,
        bundles: &RwLock<HashMap<String, MergedBundle>>,
        semaphore: &Semaphore,
    ) -> TargetReport {
        let Ok(_permit) = semaphore.acquire().await else {
            return TargetReport::skipped(&target.name);
        };
        let mut report = TargetReport {
            name: target.name.clone(),
            summary: DiffSummary::default(),
            applied: 0,
            entry_failures: Vec::new(),
            error: None,
            skipped: false,
            diff_output: None,
        };
        if ctx.check().is_err() {
            report.skipped = true;
            return report;
        }
        if let Err(err) = self
            .sync_target_inner(ctx, target, bundles, &mut report)
            .await
        {
            warn!(
                request_id = %ctx.request_id(),
                target = %target.name,
                error = %err,
                "target sync failed"
            );
            report.error = Some(err.to_string());
        }
        report
    }

    async fn sync_target_inner(
        &self,
        ctx: &RequestContext,
        target: &Target,
        bundles: &RwLock<HashMap<String, MergedBundle>>,
        report: &mut TargetReport,
    ) -> Result<(), PipelineError> {
        // resolve imports in order, then apply overrides on top
        let mut resolved = MergedBundle::new();
        for import in &target.imports {
            let imported = self.load_import(ctx, target, import, bundles).await?;
            merge_into(&mut resolved, &imported, self.options.merge_node_limit)?;
        }
        merge_into(
            &mut resolved,
            &overrides_bundle(target),
            self.options.merge_node_limit,
        )?;

        let filters = CompiledFilters::compile(&target.name, target.filters.as_ref())?;
        resolved.retain(|path, _| filters.matches_path(path));

        let store = self.keysync.stores.store_for(target)?;
        let records = store.list(ctx).await?;
        let mut before = MergedBundle::new();
        let mut before_versions: HashMap<SecretPath, Option<String>> = HashMap::new();
        for record in records {
            if !filters.matches_path(&record.path) || !filters.matches_tags(&record.tags) {
                continue;
            }
            before_versions.insert(record.path.clone(), record.version.clone());
            before.insert(record.path, record.value);
        }

        let mut entries = diff::compute(&before, &resolved);
        for entry in &mut entries {
            if let Some(version) = before_versions.get(&entry.path) {
                entry.before_version = version.clone();
            }
        }
        report.summary = DiffSummary::of(&entries);
        if self.options.emit_diff {
            report.diff_output = Some(render(&entries, &self.options.render)?);
        }
        debug!(
            target = %target.name,
            added = report.summary.added,
            modified = report.summary.modified,
            deleted = report.summary.deleted,
            "computed diff"
        );

        if !self.options.dry_run {
            self.apply_entries(ctx, &store, &entries, report).await;
            if let Some(merge_store) = &self.keysync.merge_store {
                for (path, value) in &resolved {
                    merge_store.write(ctx, &target.name, path, value).await?;
                }
            }
        }

        bundles.write().await.insert(target.name.clone(), resolved);
        Ok(())
    }

    /// Load one import's materialized bundle: `base_merged` comes from
    /// the merge-phase output, other targets from the blob store (or
    /// from memory when the blob store is disabled or the run is dry).
    async fn load_import(
        &self,
        ctx: &RequestContext,
        target: &Target,
        import: &str,
        bundles: &RwLock<HashMap<String, MergedBundle>>,
    ) -> Result<MergedBundle, PipelineError> {
        let missing = || PipelineError::CircularImports {
            target: target.name.clone(),
            import: import.to_string(),
        };
        if import == BASE_MERGED {
            return bundles
                .read()
                .await
                .get(BASE_MERGED)
                .cloned()
                .ok_or_else(missing);
        }
        if let Some(store) = &self.keysync.merge_store {
            if !self.options.dry_run {
                let paths = store.list(ctx, import).await?;
                if !paths.is_empty() {
                    let mut bundle = MergedBundle::new();
                    for path in paths {
                        let value = store.read(ctx, import, &path).await?;
                        bundle.insert(path, value);
                    }
                    return Ok(bundle);
                }
            }
        }
        bundles.read().await.get(import).cloned().ok_or_else(missing)
    }

    async fn apply_entries(
        &self,
        ctx: &RequestContext,
        store: &Arc<TargetStore>,
        entries: &[DiffEntry],
        report: &mut TargetReport,
    ) {
        let width = self.options.entry_concurrency.unwrap_or(1).max(1);
        if width == 1 {
            for entry in entries {
                if ctx.check().is_err() {
                    break;
                }
                self.record_entry_outcome(
                    report,
                    entry,
                    self.apply_entry(ctx, store, entry).await,
                );
            }
            return;
        }

        let semaphore = Arc::new(Semaphore::new(width));
        let results = join_all(entries.iter().map(|entry| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (entry, Err(ClientError::Cancelled));
                };
                (entry, self.apply_entry(ctx, store, entry).await)
            }
        }))
        .await;
        for (entry, result) in results {
            self.record_entry_outcome(report, entry, result);
        }
    }

    fn record_entry_outcome(
        &self,
        report: &mut TargetReport,
        entry: &DiffEntry,
        result: Result<(), ClientError>,
    ) {
        match result {
            Ok(()) => report.applied += 1,
            Err(err) => report.entry_failures.push(EntryFailure {
                path: entry.path.to_string(),
                kind: entry.kind.to_string(),
                error: err.to_string(),
            }),
        }
    }

    async fn apply_entry(
        &self,
        ctx: &RequestContext,
        store: &Arc<TargetStore>,
        entry: &DiffEntry,
    ) -> Result<(), ClientError> {
        match entry.kind {
            DiffKind::Added => {
                let Some(value) = &entry.after else {
                    return Ok(());
                };
                store.create(ctx, &entry.path, value).await.map(|_| ())
            },
            DiffKind::Modified => {
                let Some(value) = &entry.after else {
                    return Ok(());
                };
                store.update(ctx, &entry.path, value).await.map(|_| ())
            },
            DiffKind::Deleted => match store.delete(ctx, &entry.path).await {
                // already gone is the desired end state
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            },
        }
    }

    fn finish(&self, mut summary: RunSummary, started: std::time::Instant) -> RunSummary {
        summary.ou_listing_failures = self.keysync.metrics.ou_listing_failures.get();
        summary.elapsed_ms = self
            .keysync
            .clock
            .now()
            .duration_since(started)
            .as_millis() as u64;
        summary.classify();
        info!(
            request_id = %summary.request_id,
            status = ?summary.status,
            targets = summary.targets.len(),
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        summary
    }
}

/// Interpret a target's `overrides` mapping as bundle entries: each
/// top-level key is a path, its value the secret tree.
fn overrides_bundle(target: &Target) -> MergedBundle {
    let SecretTree::Mapping(entries) = &target.overrides else {
        warn!(target = %target.name, "overrides must be a mapping; ignoring");
        return MergedBundle::new();
    };
    let mut bundle = MergedBundle::new();
    for (key, value) in entries {
        match SecretPath::parse(key) {
            Ok(path) => {
                bundle.insert(path, value.clone());
            },
            Err(err) => {
                warn!(target = %target.name, %key, error = %err, "invalid override path; ignoring");
            },
        }
    }
    bundle
}

/// Merge `overlay` into `into`, path by path.
fn merge_into(
    into: &mut MergedBundle,
    overlay: &MergedBundle,
    limit: Option<usize>,
) -> Result<(), MergeError> {
    for (path, value) in overlay {
        match into.get(path) {
            Some(existing) => {
                let merged = merge_bounded(existing, value, limit)?;
                into.insert(path.clone(), merged);
            },
            None => {
                into.insert(path.clone(), value.clone());
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::keysync::{DiscoverySetup, Keysync, StoreFactory};
    use crate::models::discovery::{Discovery, DiscoveryConfig};
    use crate::models::source::SourceReader;
    use crate::models::store::TargetStoreOptions;
    use crate::models::target::{Filters, TargetKind};
    use crate::providers::blob::{BlobClient, BlobMergeStore, MemoryBlobClient};
    use crate::providers::breaker::{BreakerConfig, CircuitBreaker, RetryPolicy};
    use crate::providers::org::{account, MockOrgClient, OrgDirectoryClient};
    use crate::providers::source::{InjectedFailure, MockSourceClient, SourceClient};
    use crate::providers::store::{MemoryStoreClient, SecretStoreClient};
    use crate::providers::ServiceKind;
    use crate::utils::clock::{Clock, SystemClock};
    use crate::utils::metrics::Metrics;

    fn tree(json: &str) -> SecretTree {
        serde_json::from_str(json).unwrap()
    }

    fn path(s: &str) -> SecretPath {
        SecretPath::parse(s).unwrap()
    }

    fn retry_once() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn breaker(service: ServiceKind, clock: &Arc<dyn Clock>) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            service,
            BreakerConfig::default(),
            Arc::clone(clock),
        ))
    }

    #[derive(Debug)]
    struct MapStores(StdMutex<HashMap<String, Arc<TargetStore>>>);

    impl StoreFactory for MapStores {
        fn store_for(
            &self,
            target: &Target,
        ) -> Result<Arc<TargetStore>, crate::keysync::StoreFactoryError> {
            self.0
                .lock()
                .expect("stores lock poisoned")
                .get(&target.name)
                .cloned()
                .ok_or_else(|| {
                    crate::keysync::StoreFactoryError::MissingEndpoint(target.name.clone())
                })
        }
    }

    struct Harness {
        keysync: Keysync,
        stores: HashMap<String, Arc<TargetStore>>,
    }

    fn harness(
        source: MockSourceClient,
        sources: Vec<Source>,
        target_names: &[&str],
        with_merge_store: bool,
    ) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metrics = Arc::new(Metrics::default());
        let reader = Arc::new(SourceReader::new(
            Arc::new(SourceClient::Mock(source)),
            breaker(ServiceKind::Source, &clock),
            retry_once(),
            Arc::clone(&metrics),
        ));

        let mut stores = HashMap::new();
        for name in target_names {
            stores.insert(
                name.to_string(),
                Arc::new(TargetStore::new(
                    *name,
                    SecretStoreClient::Memory(MemoryStoreClient::new()),
                    breaker(ServiceKind::TargetStore, &clock),
                    retry_once(),
                    TargetStoreOptions::default(),
                    Arc::clone(&clock),
                    Arc::clone(&metrics),
                )),
            );
        }

        let merge_store = with_merge_store.then(|| {
            Arc::new(BlobMergeStore::new(
                BlobClient::Memory(MemoryBlobClient::new()),
                "merged",
                breaker(ServiceKind::BlobStore, &clock),
                retry_once(),
                Arc::clone(&metrics),
            ))
        });

        let keysync = Keysync {
            sources,
            reader,
            merge_store,
            discovery: None,
            stores: Arc::new(MapStores(StdMutex::new(stores.clone()))),
            metrics,
            clock,
        };
        Harness { keysync, stores }
    }

    fn memory(store: &TargetStore) -> &MemoryStoreClient {
        match store.client() {
            SecretStoreClient::Memory(client) => client,
            _ => panic!("expected memory client"),
        }
    }

    fn contents(harness: &Harness, name: &str) -> IndexMap<SecretPath, SecretTree> {
        memory(&harness.stores[name]).contents()
    }

    fn importing(name: &str, imports: &[&str]) -> Target {
        Target {
            imports: imports.iter().map(|s| s.to_string()).collect(),
            ..Target::new(name, TargetKind::Memory)
        }
    }

    #[tokio::test]
    async fn two_sources_deep_merge_into_one_added_entry() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree(r#"{"timeout": 30, "retries": 3}"#));
        mock.insert_secret("beta/app", tree(r#"{"timeout": 60, "debug": true}"#));
        let harness = harness(
            mock,
            vec![Source::new("alpha"), Source::new("beta")],
            &["dest"],
            true,
        );
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), targets).await;

        assert_eq!(summary.status, RunStatus::Changed);
        assert_eq!(summary.merged_paths, 1);
        assert_eq!(summary.targets[0].summary.added, 1);
        assert_eq!(
            contents(&harness, "dest"),
            IndexMap::from([(
                path("app"),
                tree(r#"{"timeout": 60, "retries": 3, "debug": true}"#),
            )])
        );
    }

    #[tokio::test]
    async fn overlapping_sequences_append_across_sources() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/svc", tree(r#"{"keys": ["k1", "k2"]}"#));
        mock.insert_secret("beta/svc", tree(r#"{"keys": ["k3"]}"#));
        let harness = harness(
            mock,
            vec![Source::new("alpha"), Source::new("beta")],
            &["dest"],
            false,
        );
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        executor.run(&RequestContext::new(), targets).await;

        assert_eq!(
            contents(&harness, "dest"),
            IndexMap::from([(path("svc"), tree(r#"{"keys": ["k1", "k2", "k3"]}"#))])
        );
    }

    #[tokio::test]
    async fn inheritance_chain_resolves_through_the_merge_store() {
        let harness = harness(MockSourceClient::new(), Vec::new(), &["base", "prod"], true);
        let mut base = importing("base", &[]);
        base.overrides = tree(r#"{"env": "base"}"#);
        let mut prod = importing("prod", &["base"]);
        prod.overrides = tree(r#"{"env": "prod", "region": "us-east-1"}"#);

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), vec![prod, base]).await;

        let names: Vec<&str> = summary.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["base", "prod"]);
        assert_eq!(
            contents(&harness, "prod"),
            IndexMap::from([
                (path("env"), tree(r#""prod""#)),
                (path("region"), tree(r#""us-east-1""#)),
            ])
        );
        assert_eq!(
            contents(&harness, "base"),
            IndexMap::from([(path("env"), tree(r#""base""#))])
        );
    }

    #[tokio::test]
    async fn inheritance_works_in_memory_when_merge_store_disabled() {
        let harness = harness(MockSourceClient::new(), Vec::new(), &["base", "prod"], false);
        let mut base = importing("base", &[]);
        base.overrides = tree(r#"{"env": "base", "shared": true}"#);
        let prod = importing("prod", &["base"]);

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), vec![base, prod]).await;

        assert_eq!(summary.status, RunStatus::Changed);
        assert_eq!(
            contents(&harness, "prod"),
            IndexMap::from([
                (path("env"), tree(r#""base""#)),
                (path("shared"), tree("true")),
            ])
        );
    }

    #[tokio::test]
    async fn merge_phase_output_lands_in_the_blob_store() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app/db", tree(r#"{"user": "svc"}"#));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], true);
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        executor.run(&RequestContext::new(), targets).await;

        let merge_store = harness.keysync.merge_store.as_ref().unwrap();
        let BlobClient::Memory(blob) = merge_store.client() else {
            panic!("expected memory blob client");
        };
        assert_eq!(blob.keys(), vec![
            "merged/base_merged/app/db.json".to_string(),
            "merged/dest/app/db.json".to_string(),
        ]);
    }

    #[tokio::test]
    async fn dry_run_never_mutates_any_collaborator() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree(r#"{"user": "svc"}"#));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], true);
        // pre-existing secret that a real run would delete
        memory(&harness.stores["dest"]).seed(path("stale"), tree("1"), Default::default());
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let options = PipelineOptions {
            dry_run: true,
            ..PipelineOptions::default()
        };
        let executor = PipelineExecutor::new(&harness.keysync, options);
        let summary = executor.run(&RequestContext::new(), targets).await;

        assert_eq!(summary.status, RunStatus::Ok);
        assert_eq!(summary.targets[0].summary.added, 1);
        assert_eq!(summary.targets[0].summary.deleted, 1);
        assert_eq!(summary.targets[0].applied, 0);
        assert_eq!(memory(&harness.stores["dest"]).mutation_count(), 0);

        let merge_store = harness.keysync.merge_store.as_ref().unwrap();
        let BlobClient::Memory(blob) = merge_store.client() else {
            panic!("expected memory blob client");
        };
        assert_eq!(blob.put_count(), 0);
    }

    #[tokio::test]
    async fn modified_and_deleted_entries_are_applied() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree(r#"{"user": "new"}"#));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], false);
        let client = memory(&harness.stores["dest"]);
        client.seed(path("app"), tree(r#"{"user": "old"}"#), Default::default());
        client.seed(path("stale"), tree("1"), Default::default());
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), targets).await;

        assert_eq!(summary.targets[0].summary.modified, 1);
        assert_eq!(summary.targets[0].summary.deleted, 1);
        assert_eq!(
            contents(&harness, "dest"),
            IndexMap::from([(path("app"), tree(r#"{"user": "new"}"#))])
        );
    }

    #[tokio::test]
    async fn per_target_failures_do_not_abort_other_targets() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree("1"));
        let harness = harness(mock, vec![Source::new("alpha")], &["good", "bad"], false);
        memory(&harness.stores["bad"]).fail_next("list", InjectedFailure::PermissionDenied);
        let targets = vec![
            importing("good", &[BASE_MERGED]),
            importing("bad", &[BASE_MERGED]),
        ];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), targets).await;

        assert_eq!(summary.status, RunStatus::PartialFailure);
        assert_eq!(summary.status.exit_code(), 3);
        let bad = summary.targets.iter().find(|t| t.name == "bad").unwrap();
        assert!(bad.error.as_deref().unwrap().contains("permission denied"));
        assert_eq!(contents(&harness, "good").len(), 1);
    }

    #[tokio::test]
    async fn entry_failures_are_recorded_but_do_not_abort_the_target() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree("1"));
        mock.insert_secret("alpha/svc", tree("2"));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], false);
        memory(&harness.stores["dest"]).fail_next("create", InjectedFailure::Transient);
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), targets).await;

        let report = &summary.targets[0];
        // entries apply in path order: app fails, svc still lands
        assert_eq!(report.entry_failures.len(), 1);
        assert_eq!(report.entry_failures[0].path, "app");
        assert_eq!(report.applied, 1);
        assert_eq!(summary.status, RunStatus::PartialFailure);
    }

    #[tokio::test]
    async fn all_targets_failing_is_a_total_failure() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree("1"));
        let harness = harness(mock, vec![Source::new("alpha")], &["bad"], false);
        memory(&harness.stores["bad"]).fail_next("list", InjectedFailure::PermissionDenied);
        let targets = vec![importing("bad", &[BASE_MERGED])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), targets).await;
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.status.exit_code(), 4);
    }

    #[tokio::test]
    async fn import_cycles_fail_the_plan() {
        let harness = harness(MockSourceClient::new(), Vec::new(), &["x", "y"], false);
        let targets = vec![importing("x", &["y"]), importing("y", &["x"])];

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), targets).await;

        assert_eq!(summary.status, RunStatus::PlanFailure);
        assert_eq!(summary.status.exit_code(), 2);
        assert!(summary.plan_error.as_deref().unwrap().contains("circular"));
        assert_eq!(memory(&harness.stores["x"]).ops().len(), 0);
    }

    #[tokio::test]
    async fn cancellation_before_the_run_reports_partial() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree("1"));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], false);
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let ctx = RequestContext::new();
        ctx.cancel();
        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&ctx, targets).await;

        assert!(summary.cancelled);
        assert_eq!(summary.status, RunStatus::PartialFailure);
        assert_eq!(memory(&harness.stores["dest"]).mutation_count(), 0);
    }

    #[tokio::test]
    async fn path_filters_scope_the_bundle() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app/db", tree("1"));
        mock.insert_secret("alpha/infra/dns", tree("2"));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], false);
        let mut dest = importing("dest", &[BASE_MERGED]);
        dest.filters = Some(Filters {
            path_regex: Some("^app/".to_string()),
            ..Filters::default()
        });

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        executor.run(&RequestContext::new(), vec![dest]).await;

        assert_eq!(
            contents(&harness, "dest"),
            IndexMap::from([(path("app/db"), tree("1"))])
        );
    }

    #[tokio::test]
    async fn tag_filter_leaves_unmanaged_records_alone() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree("1"));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], false);
        // a record the pipeline does not manage: its tags do not match
        memory(&harness.stores["dest"]).seed(path("legacy"), tree("9"), Default::default());
        let mut dest = importing("dest", &[BASE_MERGED]);
        dest.filters = Some(Filters {
            tag_match: [("managed-by".to_string(), "keysync".to_string())].into(),
            ..Filters::default()
        });

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), vec![dest]).await;

        assert_eq!(summary.targets[0].summary.deleted, 0);
        assert!(contents(&harness, "dest").contains_key(&path("legacy")));
    }

    #[tokio::test]
    async fn rendered_diffs_are_attached_when_requested() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree(r#"{"user": "svc"}"#));
        let harness = harness(mock, vec![Source::new("alpha")], &["dest"], false);
        let targets = vec![importing("dest", &[BASE_MERGED])];

        let options = PipelineOptions {
            dry_run: true,
            emit_diff: true,
            ..PipelineOptions::default()
        };
        let executor = PipelineExecutor::new(&harness.keysync, options);
        let summary = executor.run(&RequestContext::new(), targets).await;

        let output = summary.targets[0].diff_output.as_deref().unwrap();
        assert!(output.contains("+ app"));
        assert!(!output.contains("svc"), "values must be masked by default");
    }

    #[tokio::test]
    async fn discovery_expands_templates_into_per_account_targets() {
        let mock = MockSourceClient::new();
        mock.insert_secret("alpha/app", tree("1"));
        let mut harness = harness(
            mock,
            vec![Source::new("alpha")],
            &["dest-111", "dest-222"],
            false,
        );

        let org = MockOrgClient::new();
        org.add_account("root", account("111", &[("env", "prod")]));
        org.add_account("root", account("222", &[("env", "prod")]));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        harness.keysync.discovery = Some(DiscoverySetup {
            config: DiscoveryConfig {
                enabled: true,
                root_ou: Some("root".to_string()),
                ..DiscoveryConfig::default()
            },
            engine: Arc::new(Discovery::new(
                Arc::new(OrgDirectoryClient::Mock(org)),
                breaker(ServiceKind::Discovery, &clock),
                retry_once(),
                Arc::clone(&clock),
                Arc::new(Metrics::default()),
            )),
        });

        let mut template = importing("dest", &[BASE_MERGED]);
        template.per_account = true;

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), vec![template]).await;

        assert_eq!(summary.status, RunStatus::Changed);
        assert_eq!(contents(&harness, "dest-111").len(), 1);
        assert_eq!(contents(&harness, "dest-222").len(), 1);
    }

    #[tokio::test]
    async fn templates_without_discovery_fail_the_plan() {
        let harness = harness(MockSourceClient::new(), Vec::new(), &["dest"], false);
        let mut template = importing("dest", &[]);
        template.per_account = true;

        let executor = PipelineExecutor::new(&harness.keysync, PipelineOptions::default());
        let summary = executor.run(&RequestContext::new(), vec![template]).await;
        assert_eq!(summary.status, RunStatus::PlanFailure);
        assert!(summary.plan_error.as_deref().unwrap().contains("discovery"));
    }

    #[test]
    fn overrides_bundle_splits_top_level_keys_into_paths() {
        let mut target = Target::new("t", TargetKind::Memory);
        target.overrides = tree(r#"{"env": "prod", "db": {"user": "svc"}}"#);
        let bundle = overrides_bundle(&target);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle[&path("db")], tree(r#"{"user": "svc"}"#));
    }
}
