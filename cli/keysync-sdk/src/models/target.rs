use std::collections::BTreeMap;

use keysync_core::{SecretPath, SecretTree};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Reserved import name referring to the merge-phase output.
pub const BASE_MERGED: &str = "base_merged";

/// Backend kind a target syncs into. Dispatch happens at factory time;
/// the pipeline itself is variant-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    CloudSecretStore,
    Memory,
}

/// Per-target path/tag filters, as configured.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Filters {
    pub path_regex: Option<String>,
    pub exclude_regex: Option<String>,
    #[serde(default)]
    pub tag_match: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid {which} for target {target}")]
    InvalidRegex {
        target: String,
        which: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Compiled form of [`Filters`].
///
/// Path rules apply to every bundle path; the tag rule applies only to
/// records that exist in the target store (the merged bundle carries no
/// tags), scoping which existing secrets the pipeline manages at all.
#[derive(Debug, Default)]
pub struct CompiledFilters {
    path: Option<Regex>,
    exclude: Option<Regex>,
    tags: BTreeMap<String, String>,
}

impl CompiledFilters {
    pub fn compile(target: &str, filters: Option<&Filters>) -> Result<Self, FilterError> {
        let Some(filters) = filters else {
            return Ok(Self::default());
        };
        let compile = |which, pattern: Option<&String>| {
            pattern
                .map(|p| {
                    Regex::new(p).map_err(|source| FilterError::InvalidRegex {
                        target: target.to_string(),
                        which,
                        source,
                    })
                })
                .transpose()
        };
        Ok(Self {
            path: compile("path_regex", filters.path_regex.as_ref())?,
            exclude: compile("exclude_regex", filters.exclude_regex.as_ref())?,
            tags: filters.tag_match.clone(),
        })
    }

    pub fn matches_path(&self, path: &SecretPath) -> bool {
        if let Some(include) = &self.path {
            if !include.is_match(path.as_str()) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(path.as_str()) {
                return false;
            }
        }
        true
    }

    /// Whether a store record with `tags` is managed by this target.
    pub fn matches_tags(&self, tags: &BTreeMap<String, String>) -> bool {
        self.tags
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }
}

/// Version retention settings forwarded to the store client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Versioning {
    pub enabled: bool,
    pub retain: u32,
}

/// A concrete destination for synced secrets.
///
/// Materialized from configuration, or synthesized by discovery
/// expansion, before planning; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default = "SecretTree::empty")]
    pub overrides: SecretTree,
    #[serde(default)]
    pub filters: Option<Filters>,
    #[serde(default)]
    pub versioning: Option<Versioning>,
    /// When discovery is enabled, expand this target into one concrete
    /// target per discovered account.
    #[serde(default)]
    pub per_account: bool,
    /// Account binding filled in by discovery expansion.
    #[serde(skip)]
    pub account_id: Option<String>,
}

impl Target {
    pub fn new(name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            region: None,
            role: None,
            imports: Vec::new(),
            overrides: SecretTree::empty(),
            filters: None,
            versioning: None,
            per_account: false,
            account_id: None,
        }
    }

    /// Retention count to forward on updates, when versioning is on.
    pub fn retain(&self) -> Option<u32> {
        self.versioning
            .as_ref()
            .filter(|v| v.enabled)
            .map(|v| v.retain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn path_filters_include_then_exclude() {
        let filters = Filters {
            path_regex: Some("^app/".to_string()),
            exclude_regex: Some("/internal/".to_string()),
            tag_match: BTreeMap::new(),
        };
        let compiled = CompiledFilters::compile("t", Some(&filters)).unwrap();

        let ok = SecretPath::parse("app/db").unwrap();
        let excluded = SecretPath::parse("app/internal/token").unwrap();
        let outside = SecretPath::parse("infra/dns").unwrap();
        assert!(compiled.matches_path(&ok));
        assert!(!compiled.matches_path(&excluded));
        assert!(!compiled.matches_path(&outside));
    }

    #[test]
    fn tag_match_requires_every_pair() {
        let filters = Filters {
            tag_match: tags(&[("managed-by", "keysync")]),
            ..Filters::default()
        };
        let compiled = CompiledFilters::compile("t", Some(&filters)).unwrap();

        assert!(compiled.matches_tags(&tags(&[("managed-by", "keysync"), ("env", "prod")])));
        assert!(!compiled.matches_tags(&tags(&[("env", "prod")])));
        assert!(!compiled.matches_tags(&tags(&[("managed-by", "other")])));
    }

    #[test]
    fn absent_filters_match_everything() {
        let compiled = CompiledFilters::compile("t", None).unwrap();
        assert!(compiled.matches_path(&SecretPath::parse("anything/at/all").unwrap()));
        assert!(compiled.matches_tags(&BTreeMap::new()));
    }

    #[test]
    fn invalid_regex_is_rejected_with_target_name() {
        let filters = Filters {
            path_regex: Some("(".to_string()),
            ..Filters::default()
        };
        let err = CompiledFilters::compile("prod", Some(&filters)).unwrap_err();
        assert!(err.to_string().contains("prod"));
    }

    #[test]
    fn retain_only_applies_when_versioning_enabled() {
        let mut target = Target::new("t", TargetKind::Memory);
        assert_eq!(target.retain(), None);
        target.versioning = Some(Versioning {
            enabled: false,
            retain: 5,
        });
        assert_eq!(target.retain(), None);
        target.versioning = Some(Versioning {
            enabled: true,
            retain: 5,
        });
        assert_eq!(target.retain(), Some(5));
    }
}
