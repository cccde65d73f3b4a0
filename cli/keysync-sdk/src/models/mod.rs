pub mod diff;
pub mod discovery;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod source;
pub mod store;
pub mod target;

use indexmap::IndexMap;
use keysync_core::{SecretPath, SecretTree};

/// A fully resolved `path -> value` map for one scope: the global
/// merge-phase output, or one target after import resolution and
/// override application.
pub type MergedBundle = IndexMap<SecretPath, SecretTree>;
