use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bpaf::Bpaf;
use keysync_sdk::keysync::{ClientStoreFactory, DiscoverySetup, Keysync};
use keysync_sdk::models::diff::{OutputFormat, RenderOptions};
use keysync_sdk::models::discovery::Discovery;
use keysync_sdk::models::pipeline::{PipelineExecutor, PipelineOptions};
use keysync_sdk::models::source::SourceReader;
use keysync_sdk::models::store::{TargetStoreOptions, DEFAULT_LIST_CACHE_TTL};
use keysync_sdk::providers::blob::{BlobClient, BlobMergeStore, FileBlobStore, MemoryBlobClient};
use keysync_sdk::providers::breaker::{Breakers, RetryPolicy};
use keysync_sdk::providers::org::{HttpOrgClient, OrgDirectoryClient};
use keysync_sdk::providers::source::{SourceClient, VaultClient};
use keysync_sdk::providers::ServiceKind;
use keysync_sdk::utils::clock::{Clock, SystemClock};
use keysync_sdk::utils::context::RequestContext;
use keysync_sdk::utils::metrics::Metrics;
use tracing::{debug, info};

use crate::config::{Config, MergeStoreKind};

fn flag_count(flags: Vec<()>) -> usize {
    flags.len()
}

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
pub struct KeysyncCli {
    /// Increase logging verbosity (repeatable)
    #[bpaf(short('v'), long("verbose"), req_flag(()), many, map(flag_count))]
    pub verbose: usize,

    /// Path to the configuration file
    #[bpaf(long, argument("PATH"))]
    pub config: Option<PathBuf>,

    #[bpaf(external(command))]
    pub command: Command,
}

#[derive(Debug, Clone, Bpaf)]
pub enum Command {
    /// Run the merge/sync pipeline
    #[bpaf(command)]
    Sync {
        /// Compute and print diffs without applying any change
        #[bpaf(long)]
        dry_run: bool,
        /// Print per-target diffs
        #[bpaf(long)]
        diff: bool,
        /// Diff output format: text, json, annotation, or compact
        #[bpaf(long, argument("FORMAT"))]
        format: Option<String>,
        /// Print secret values instead of masked placeholders
        #[bpaf(long)]
        show_values: bool,
    },
    /// Resolve discovery and print the target plan without syncing
    #[bpaf(command)]
    Plan,
}

impl Command {
    pub async fn handle(self, config: Config) -> Result<ExitCode> {
        let keysync = build_keysync(&config)?;
        let ctx = match config.defaults.run_timeout_secs {
            Some(secs) => RequestContext::with_timeout(Duration::from_secs(secs)),
            None => RequestContext::new(),
        };
        spawn_cancel_on_ctrl_c(&ctx);

        match self {
            Command::Sync {
                dry_run,
                diff,
                format,
                show_values,
            } => {
                let options = PipelineOptions {
                    dry_run: dry_run || config.defaults.dry_run,
                    emit_diff: diff || config.defaults.diff,
                    render: RenderOptions {
                        format: match format {
                            Some(format) => parse_format(&format)?,
                            None => config.defaults.output_format,
                        },
                        show_values: show_values || config.defaults.show_values,
                        color: std::io::IsTerminal::is_terminal(&std::io::stdout()),
                    },
                    source_concurrency: config.concurrency.w_source,
                    target_concurrency: config.concurrency.w_target,
                    entry_concurrency: config.concurrency.w_entry,
                    merge_node_limit: config.defaults.merge_node_limit,
                };
                info!(request_id = %ctx.request_id(), dry_run = options.dry_run, "starting sync");
                let format = options.render.format;

                let executor = PipelineExecutor::new(&keysync, options);
                let summary = executor.run(&ctx, config.targets.clone()).await;

                for target in &summary.targets {
                    if let Some(diff_output) = &target.diff_output {
                        if !diff_output.is_empty() {
                            println!("--- {}", target.name);
                            println!("{diff_output}");
                        }
                    }
                }
                if format == OutputFormat::Json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&summary)
                            .context("failed to encode run summary")?
                    );
                } else {
                    print!("{}", summary.render_human());
                }
                Ok(ExitCode::from(summary.status.exit_code()))
            },
            Command::Plan => {
                let executor = PipelineExecutor::new(&keysync, PipelineOptions::default());
                match executor.plan(&ctx, config.targets.clone()).await {
                    Ok(plan) => {
                        for (level, targets) in plan.levels().iter().enumerate() {
                            for target in targets {
                                let imports = if target.imports.is_empty() {
                                    String::new()
                                } else {
                                    format!(" <- {}", target.imports.join(", "))
                                };
                                println!("{level}. {}{imports}", target.name);
                            }
                        }
                        Ok(ExitCode::from(0))
                    },
                    Err(err) => {
                        eprintln!("plan failed: {err}");
                        Ok(ExitCode::from(2))
                    },
                }
            },
        }
    }
}

fn parse_format(raw: &str) -> Result<OutputFormat> {
    match raw {
        "text" => Ok(OutputFormat::Text),
        "json" => Ok(OutputFormat::Json),
        "annotation" => Ok(OutputFormat::Annotation),
        "compact" => Ok(OutputFormat::Compact),
        other => bail!("unknown output format {other:?} (expected text, json, annotation, or compact)"),
    }
}

fn spawn_cancel_on_ctrl_c(ctx: &RequestContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            ctx.cancel();
        }
    });
}

/// Wire the configured clients into a [`Keysync`] context.
fn build_keysync(config: &Config) -> Result<Keysync> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::default());
    let breakers = Breakers::new(&config.circuit_breaker, Arc::clone(&clock));
    let retry = RetryPolicy::default();

    let vault_address = config
        .vault
        .address
        .as_ref()
        .context("vault.address is not configured")?;
    let source_client = SourceClient::Vault(VaultClient::new(
        vault_address,
        config.vault.token.as_deref().unwrap_or_default(),
    ));
    let reader = Arc::new(SourceReader::new(
        Arc::new(source_client),
        breakers.get(ServiceKind::Source),
        retry.clone(),
        Arc::clone(&metrics),
    ));

    let merge_store = if config.merge_store.enabled {
        let client = match config.merge_store.kind {
            MergeStoreKind::File => {
                let location = config
                    .merge_store
                    .location
                    .as_ref()
                    .context("merge_store.location is not configured")?;
                BlobClient::File(FileBlobStore::new(location))
            },
            MergeStoreKind::Memory => BlobClient::Memory(MemoryBlobClient::new()),
        };
        Some(Arc::new(BlobMergeStore::new(
            client,
            config.merge_store.prefix.clone(),
            breakers.get(ServiceKind::BlobStore),
            retry.clone(),
            Arc::clone(&metrics),
        )))
    } else {
        debug!("merge store disabled; bundles are kept in memory only");
        None
    };

    let discovery = if config.discovery.enabled {
        let endpoint = config
            .org
            .endpoint
            .as_ref()
            .context("org.endpoint is not configured")?;
        let client = OrgDirectoryClient::Http(HttpOrgClient::new(
            endpoint,
            config.org.token.as_deref().unwrap_or_default(),
        ));
        Some(DiscoverySetup {
            config: config.discovery.clone(),
            engine: Arc::new(Discovery::new(
                Arc::new(client),
                breakers.get(ServiceKind::Discovery),
                retry.clone(),
                Arc::clone(&clock),
                Arc::clone(&metrics),
            )),
        })
    } else {
        None
    };

    let store_options = TargetStoreOptions {
        cache_ttl: config
            .store
            .cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIST_CACHE_TTL),
        no_empty_secrets: config.defaults.no_empty_secrets,
        retain: None,
    };
    let stores = Arc::new(ClientStoreFactory::new(
        config.store.endpoint.clone(),
        config.store.token.as_deref().unwrap_or_default(),
        breakers.get(ServiceKind::TargetStore),
        retry,
        store_options,
        Arc::clone(&clock),
        Arc::clone(&metrics),
    ));

    Ok(Keysync {
        sources: config.sources.clone(),
        reader,
        merge_store,
        discovery,
        stores,
        metrics,
        clock,
    })
}
