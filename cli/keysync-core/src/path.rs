use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A validated, normalized secret path.
///
/// Secret paths are forward-slash delimited hierarchical keys,
/// e.g. `app/prod/db-credentials`. Stores index secrets by these paths,
/// the blob merge store derives object keys from them,
/// and the differ orders its output by them.
/// Rather than re-validating strings at every boundary,
/// validation happens once in [`SecretPath::parse`]
/// and the rest of the code passes `SecretPath` around.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    derive_more::Deref,
    derive_more::AsRef,
)]
#[deref(forward)]
#[as_ref(forward)]
pub struct SecretPath(String);

#[derive(Debug, Error, PartialEq)]
pub enum PathError {
    #[error("secret path is empty")]
    Empty,
    #[error("secret path {0:?} contains a '..' segment")]
    ParentTraversal(String),
    #[error("secret path contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("secret path {0:?} contains an empty segment")]
    EmptySegment(String),
}

/// Normalize a raw path: collapse repeated `/` into one and strip the
/// leading `/`. Returns an error for `..` segments and NUL bytes.
///
/// A single trailing `/` is preserved so callers can distinguish
/// directory paths from leaf paths.
pub fn normalize(raw: &str) -> Result<String, PathError> {
    if raw.contains('\0') {
        return Err(PathError::EmbeddedNul);
    }

    let trailing_slash = raw.ends_with('/');
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" => continue,
            ".." => return Err(PathError::ParentTraversal(raw.to_string())),
            other => segments.push(other),
        }
    }

    let mut normalized = segments.join("/");
    if trailing_slash && !normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

impl SecretPath {
    /// Parse and normalize a leaf secret path.
    ///
    /// `//` collapses to `/` and a leading `/` is stripped;
    /// `..` segments, NUL bytes, and empty results are rejected.
    /// A trailing `/` marks a directory, not a leaf, and is rejected here.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let raw = raw.as_ref();
        // A path like `a//b` normalizes cleanly, but `a/ /b`-style genuinely
        // empty segments can only come from consecutive slashes, so the
        // explicit empty-segment error fires for inputs that are *only*
        // slashes or that end in one.
        let normalized = normalize(raw)?;
        if normalized.is_empty() {
            return Err(PathError::Empty);
        }
        if normalized.ends_with('/') {
            return Err(PathError::EmptySegment(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    /// Append a child segment, validating the result.
    pub fn join(&self, child: &str) -> Result<Self, PathError> {
        Self::parse(format!("{}/{child}", self.0))
    }

    /// The final path segment.
    pub fn leaf_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for SecretPath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for SecretPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
