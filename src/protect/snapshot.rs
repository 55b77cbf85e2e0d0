use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;

use crate::git::{GitCli, GitError};
use crate::patterns::MatchedPaths;

/// Random characters appended to the staging prefix.
const STAGE_SUFFIX_LEN: usize = 12;

const INDEX_PREFIX: &str = "githook-protect-index-";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to create staging directory under {temp_root}: {source}")]
    Stage {
        temp_root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create temporary index: {0}")]
    Index(#[source] io::Error),
    #[error("failed to extract HEAD content: {0}")]
    Git(#[from] GitError),
}

/// Staging directory holding HEAD content for one protection run.
///
/// The directory and everything in it is deleted on drop.
#[derive(Debug)]
pub struct Snapshot {
    dir: TempDir,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the staging directory, reporting failures.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Extracts the HEAD content of matched paths through an isolated index.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    git: GitCli,
    temp_root: PathBuf,
    stage_prefix: String,
}

impl SnapshotBuilder {
    pub fn new(git: GitCli, temp_root: impl Into<PathBuf>, stage_prefix: impl Into<String>) -> Self {
        Self {
            git,
            temp_root: temp_root.into(),
            stage_prefix: stage_prefix.into(),
        }
    }

    pub fn build(
        &self,
        repository_root: &Path,
        matched: &MatchedPaths,
    ) -> Result<Snapshot, SnapshotError> {
        let stage = tempfile::Builder::new()
            .prefix(&self.stage_prefix)
            .rand_bytes(STAGE_SUFFIX_LEN)
            .tempdir_in(&self.temp_root)
            .map_err(|source| SnapshotError::Stage {
                temp_root: self.temp_root.clone(),
                source,
            })?;
        let snapshot = Snapshot { dir: stage };
        if matched.is_empty() {
            return Ok(snapshot);
        }

        // Kept outside the staging tree; removed on every exit path.
        let index_dir = tempfile::Builder::new()
            .prefix(INDEX_PREFIX)
            .tempdir_in(&self.temp_root)
            .map_err(SnapshotError::Index)?;
        let index_file = index_dir.path().join("index");

        let paths = matched.relative_paths();
        self.git.read_tree(repository_root, &index_file, "HEAD")?;
        let files = self.git.ls_files(repository_root, Some(&index_file), &paths)?;
        if files.is_empty() {
            log::debug!("no matched path is tracked in HEAD");
            return Ok(snapshot);
        }
        self.git
            .checkout_index(repository_root, &index_file, snapshot.path(), &files)?;
        log::debug!(
            "staged {} file(s) from HEAD in {}",
            files.len(),
            snapshot.path().display()
        );
        Ok(snapshot)
    }
}
