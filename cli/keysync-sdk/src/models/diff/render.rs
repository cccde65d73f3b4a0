use keysync_core::SecretTree;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DiffEntry, DiffKind, DiffSummary};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Annotation,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub format: OutputFormat,
    /// Off by default: scalar values render as length plus first/last
    /// character.
    pub show_values: bool,
    pub color: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            show_values: false,
            color: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to encode diff")]
    Encode(#[source] serde_json::Error),
}

/// Replace every scalar with a masked placeholder, keeping structure.
fn mask_tree(tree: &SecretTree) -> SecretTree {
    match tree {
        SecretTree::Null => SecretTree::Null,
        SecretTree::Bool(value) => SecretTree::String(mask_scalar(&value.to_string())),
        SecretTree::Number(value) => SecretTree::String(mask_scalar(&value.to_string())),
        SecretTree::String(value) => SecretTree::String(mask_scalar(value)),
        SecretTree::Sequence(items) => {
            SecretTree::Sequence(items.iter().map(mask_tree).collect())
        },
        SecretTree::Set(items) => SecretTree::Set(items.iter().map(mask_tree).collect()),
        SecretTree::Mapping(entries) => SecretTree::Mapping(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), mask_tree(value)))
                .collect(),
        ),
    }
}

fn mask_scalar(text: &str) -> String {
    let mut chars = text.chars();
    let count = text.chars().count();
    match (chars.next(), text.chars().next_back()) {
        (Some(first), Some(last)) if count > 1 => format!("{first}…{last}[{count}]"),
        (Some(first), _) => format!("{first}[1]"),
        _ => "[0]".to_string(),
    }
}

fn value_for_display(
    value: &Option<SecretTree>,
    show_values: bool,
) -> Result<Option<String>, RenderError> {
    value
        .as_ref()
        .map(|tree| {
            let tree = if show_values {
                tree.clone()
            } else {
                mask_tree(tree)
            };
            tree.to_canonical_json().map_err(RenderError::Encode)
        })
        .transpose()
}

pub fn render(entries: &[DiffEntry], options: &RenderOptions) -> Result<String, RenderError> {
    match options.format {
        OutputFormat::Text => render_text(entries, options),
        OutputFormat::Json => render_json(entries, options),
        OutputFormat::Annotation => Ok(render_annotation(entries)),
        OutputFormat::Compact => Ok(render_compact(entries)),
    }
}

fn render_text(entries: &[DiffEntry], options: &RenderOptions) -> Result<String, RenderError> {
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        let (marker, color) = match entry.kind {
            DiffKind::Added => ('+', GREEN),
            DiffKind::Modified => ('~', YELLOW),
            DiffKind::Deleted => ('-', RED),
        };
        let before = value_for_display(&entry.before, options.show_values)?;
        let after = value_for_display(&entry.after, options.show_values)?;
        let detail = match (before, after) {
            (Some(before), Some(after)) => format!(": {before} -> {after}"),
            (None, Some(after)) => format!(": {after}"),
            (Some(before), None) => format!(": {before}"),
            (None, None) => String::new(),
        };
        let line = if options.color {
            format!("{color}{marker} {}{RESET}{detail}", entry.path)
        } else {
            format!("{marker} {}{detail}", entry.path)
        };
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

#[derive(Serialize)]
struct JsonDiff<'a> {
    summary: DiffSummary,
    entries: Vec<JsonEntry<'a>>,
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    path: &'a str,
    kind: DiffKind,
    before: Option<SecretTree>,
    after: Option<SecretTree>,
}

fn render_json(entries: &[DiffEntry], options: &RenderOptions) -> Result<String, RenderError> {
    let mask = |value: &Option<SecretTree>| {
        value.as_ref().map(|tree| {
            if options.show_values {
                tree.clone()
            } else {
                mask_tree(tree)
            }
        })
    };
    let document = JsonDiff {
        summary: DiffSummary::of(entries),
        entries: entries
            .iter()
            .map(|entry| JsonEntry {
                path: entry.path.as_str(),
                kind: entry.kind,
                before: mask(&entry.before),
                after: mask(&entry.after),
            })
            .collect(),
    };
    serde_json::to_string(&document).map_err(RenderError::Encode)
}

/// One CI annotation per entry; deletions get warning severity.
fn render_annotation(entries: &[DiffEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let severity = match entry.kind {
                DiffKind::Deleted => "warning",
                _ => "notice",
            };
            format!("::{severity}::keysync {} {}", entry.kind, entry.path)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_compact(entries: &[DiffEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let marker = match entry.kind {
                DiffKind::Added => 'A',
                DiffKind::Modified => 'M',
                DiffKind::Deleted => 'D',
            };
            format!("{marker} {}", entry.path)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
