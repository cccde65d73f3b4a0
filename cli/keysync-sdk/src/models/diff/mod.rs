pub mod render;

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;
use keysync_core::{SecretPath, SecretTree};
use serde::Serialize;

pub use render::{render, OutputFormat, RenderError, RenderOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffKind {
    Added,
    Modified,
    Deleted,
}

impl Display for DiffKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        write!(f, "{name}")
    }
}

/// A single classified difference between desired and current state.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub path: SecretPath,
    pub kind: DiffKind,
    pub before: Option<SecretTree>,
    pub after: Option<SecretTree>,
    pub before_version: Option<String>,
    pub after_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl DiffSummary {
    pub fn of(entries: &[DiffEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.kind {
                DiffKind::Added => summary.added += 1,
                DiffKind::Modified => summary.modified += 1,
                DiffKind::Deleted => summary.deleted += 1,
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.modified == 0 && self.deleted == 0
    }

    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

/// Outer join of `before` and `after` by path, classified and sorted
/// lexicographically by path. Deep-equal values are suppressed.
pub fn compute(
    before: &IndexMap<SecretPath, SecretTree>,
    after: &IndexMap<SecretPath, SecretTree>,
) -> Vec<DiffEntry> {
    let paths: BTreeSet<&SecretPath> = before.keys().chain(after.keys()).collect();

    let mut entries = Vec::new();
    for path in paths {
        let entry = match (before.get(path), after.get(path)) {
            (None, Some(new_value)) => DiffEntry {
                path: path.clone(),
                kind: DiffKind::Added,
                before: None,
                after: Some(new_value.clone()),
                before_version: None,
                after_version: None,
            },
            (Some(old_value), None) => DiffEntry {
                path: path.clone(),
                kind: DiffKind::Deleted,
                before: Some(old_value.clone()),
                after: None,
                before_version: None,
                after_version: None,
            },
            (Some(old_value), Some(new_value)) => {
                if old_value == new_value {
                    continue;
                }
                DiffEntry {
                    path: path.clone(),
                    kind: DiffKind::Modified,
                    before: Some(old_value.clone()),
                    after: Some(new_value.clone()),
                    before_version: None,
                    after_version: None,
                }
            },
            (None, None) => continue,
        };
        entries.push(entry);
    }
    entries
}
