pub mod path;
#[cfg(any(test, feature = "tests"))]
pub mod test_helpers;
pub mod tree;

use std::io::Write;
use std::path::{Path, PathBuf};

pub use path::{PathError, SecretPath};
use thiserror::Error;
pub use tree::SecretTree;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("file stored in an invalid location: {0}")]
    InvalidLocation(PathBuf),
    #[error("failed to create parent directory")]
    CreateParent(#[source] std::io::Error),
    #[error("failed to open temporary file")]
    OpenTmpFile(#[source] std::io::Error),
    #[error("failed to write temporary file")]
    WriteTmpFile(#[source] std::io::Error),
    #[error("failed to rename temporary file")]
    RenameTmpFile(#[source] tempfile::PersistError),
}

/// Write bytes to disk atomically.
///
/// The bytes are first written to a temporary file in the target's parent
/// directory and then renamed into place, so readers never observe a
/// partially written file. Parent directories are created as needed.
/// `path` must have a parent directory.
pub fn write_atomically(bytes: &[u8], path: &impl AsRef<Path>) -> Result<(), WriteError> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| WriteError::InvalidLocation(path.to_path_buf()))?;
    std::fs::create_dir_all(parent).map_err(WriteError::CreateParent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(WriteError::OpenTmpFile)?;
    tmp.write_all(bytes).map_err(WriteError::WriteTmpFile)?;
    tmp.persist(path).map_err(WriteError::RenameTmpFile)?;
    Ok(())
}
