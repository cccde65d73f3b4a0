use std::path::{Path, PathBuf};

use config::{Config as HierarchicalConfig, Environment, File};
use keysync_sdk::models::discovery::DiscoveryConfig;
use keysync_sdk::models::source::Source;
use keysync_sdk::models::target::{Target, BASE_MERGED};
use keysync_sdk::providers::breaker::BreakerConfig;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Name of keysync managed directories (config, data)
pub const KEYSYNC_DIR_NAME: &str = "keysync";
pub const KEYSYNC_CONFIG_FILE: &str = "keysync.toml";

/// The full configuration surface, layered from the TOML file and
/// `KEYSYNC_*` environment variables (`__` separates nesting levels,
/// e.g. `KEYSYNC_VAULT__TOKEN`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub merge_store: MergeStoreConfig,
    #[serde(default)]
    pub org: OrgConfig,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    /// Base URL of the vault; the KV mount is part of each source path.
    pub address: Option<Url>,
    /// Token acquisition is external; this is the acquired token.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Endpoint template for cloud secret stores. `{account}` and
    /// `{region}` expand per target.
    pub endpoint: Option<String>,
    pub token: Option<String>,
    /// Listing cache TTL override, in seconds (default 30 minutes).
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStoreKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MergeStoreConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kind: MergeStoreKind,
    /// Root directory (file kind) holding the blob objects.
    pub location: Option<PathBuf>,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrgConfig {
    pub endpoint: Option<Url>,
    pub token: Option<String>,
}

fn default_width() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_width")]
    pub w_source: usize,
    #[serde(default = "default_width")]
    pub w_target: usize,
    #[serde(default)]
    pub w_entry: Option<usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            w_source: default_width(),
            w_target: default_width(),
            w_entry: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub diff: bool,
    #[serde(default)]
    pub output_format: keysync_sdk::models::diff::OutputFormat,
    #[serde(default)]
    pub show_values: bool,
    #[serde(default)]
    pub no_empty_secrets: bool,
    /// Defensive limit on merged value size.
    pub merge_node_limit: Option<usize>,
    /// Whole-run deadline, in seconds; unbounded when unset.
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the configuration directory")]
    Directories,
    #[error("could not read configuration")]
    Read(#[source] config::ConfigError),
    #[error("could not parse configuration")]
    Parse(#[source] config::ConfigError),
    #[error("source {0:?}: {1} must be at least 1")]
    SourceBound(String, &'static str),
    #[error("target {0:?}: versioning.retain must be at least 1")]
    RetainBound(String),
    #[error("target name {0:?} is reserved")]
    ReservedTargetName(String),
    #[error("duplicate target name {0:?}")]
    DuplicateTargetName(String),
    #[error("merge_store.location is required when merge_store.kind is \"file\"")]
    MissingMergeStoreLocation,
    #[error("org.endpoint is required when discovery is enabled")]
    MissingOrgEndpoint,
    #[error("at least one source must be configured")]
    NoSources,
}

impl Config {
    /// Load from an explicit path, or from the XDG config directory.
    pub fn parse(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => xdg::BaseDirectories::with_prefix(KEYSYNC_DIR_NAME)
                .get_config_home()
                .map(|home| home.join(KEYSYNC_CONFIG_FILE))
                .ok_or(ConfigError::Directories)?,
        };

        let raw = HierarchicalConfig::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("KEYSYNC").separator("__"))
            .build()
            .map_err(ConfigError::Read)?;
        raw.try_deserialize().map_err(ConfigError::Parse)
    }

    /// Bounds and cross-field checks the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        for source in &self.sources {
            if source.max_secrets < 1 {
                return Err(ConfigError::SourceBound(
                    source.mount.clone(),
                    "max_secrets",
                ));
            }
            if source.queue_compaction_threshold < 1 {
                return Err(ConfigError::SourceBound(
                    source.mount.clone(),
                    "queue_compaction_threshold",
                ));
            }
        }

        let mut names = std::collections::HashSet::new();
        for target in &self.targets {
            if target.name == BASE_MERGED {
                return Err(ConfigError::ReservedTargetName(target.name.clone()));
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTargetName(target.name.clone()));
            }
            if let Some(versioning) = &target.versioning {
                if versioning.enabled && versioning.retain < 1 {
                    return Err(ConfigError::RetainBound(target.name.clone()));
                }
            }
        }

        if self.merge_store.enabled
            && self.merge_store.kind == MergeStoreKind::File
            && self.merge_store.location.is_none()
        {
            return Err(ConfigError::MissingMergeStoreLocation);
        }
        if self.discovery.enabled && self.org.endpoint.is_none() {
            return Err(ConfigError::MissingOrgEndpoint);
        }
        Ok(())
    }
}
