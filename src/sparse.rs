//! Assignment-based sparse checkout.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::git::{self, GitCli, GitError};
use crate::patterns::PatternSet;

#[derive(Debug, Error)]
#[error("sparse checkout failed: {0}")]
pub struct SparseCheckoutError(#[from] pub GitError);

/// Restricts the working tree to the HEAD directories matching the
/// assignment patterns.
#[derive(Debug, Clone)]
pub struct SparseCheckoutManager {
    git: GitCli,
    repository_root: PathBuf,
}

impl SparseCheckoutManager {
    pub fn new(git: GitCli, repository_root: &Path) -> Self {
        Self {
            git,
            repository_root: repository_root.to_path_buf(),
        }
    }

    /// Directories of HEAD matching `assignment`.
    pub fn matching_dirs(&self, assignment: &PatternSet) -> Result<Vec<String>, SparseCheckoutError> {
        let repo = git::open_repository(&self.repository_root)?;
        Ok(git::head_tree_dirs(&repo)?
            .into_iter()
            .filter(|dir| assignment.is_match(dir))
            .collect())
    }

    /// Returns the directories kept, or an empty list when nothing changed.
    pub fn apply(&self, assignment: &PatternSet) -> Result<Vec<String>, SparseCheckoutError> {
        if assignment.is_empty() {
            log::debug!("no assignment patterns configured");
            return Ok(Vec::new());
        }
        let dirs = self.matching_dirs(assignment)?;
        if dirs.is_empty() {
            log::info!("no directories match the assignment patterns");
            return Ok(dirs);
        }
        self.git.sparse_checkout_set(&self.repository_root, &dirs)?;
        log::info!("sparse checkout set to {}", dirs.join(", "));
        Ok(dirs)
    }
}
