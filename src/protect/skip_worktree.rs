use std::path::Path;

use thiserror::Error;

use crate::git::{GitCli, GitError};
use crate::patterns::MatchedPaths;

#[derive(Debug, Error)]
#[error("failed to set skip-worktree bits: {0}")]
pub struct SkipWorktreeError(#[from] pub GitError);

/// Marks every tracked file under the matched paths as skip-worktree in the
/// real index. Runs as the invoking user.
#[derive(Debug, Clone)]
pub struct SkipWorktreeApplier {
    git: GitCli,
}

impl SkipWorktreeApplier {
    pub fn new(git: GitCli) -> Self {
        Self { git }
    }

    /// Returns the number of files flagged.
    pub fn apply(
        &self,
        repository_root: &Path,
        matched: &MatchedPaths,
    ) -> Result<usize, SkipWorktreeError> {
        if matched.is_empty() {
            return Ok(0);
        }
        let files = self
            .git
            .ls_files(repository_root, None, &matched.relative_paths())?;
        self.git.set_skip_worktree(repository_root, &files)?;
        log::debug!("flagged {} file(s) skip-worktree", files.len());
        Ok(files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::{commit_all, git_available, init_repo, write};
    use crate::patterns::{FindOptions, PatternSet, find};

    #[test]
    fn flags_only_tracked_files_under_matches() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        write(dir.path(), "tutorials/readme.md", "v1\n");
        write(dir.path(), "tutorials/part1/intro.md", "intro\n");
        write(dir.path(), "notes.md", "mine\n");
        commit_all(&repo, "init");
        write(dir.path(), "tutorials/untracked.md", "new\n");

        let set = PatternSet::compile(["^tutorials$"]).unwrap();
        let matched = find(dir.path(), &set, FindOptions::default()).unwrap();
        let flagged = SkipWorktreeApplier::new(GitCli::new())
            .apply(dir.path(), &matched)
            .unwrap();
        assert_eq!(flagged, 2);

        // `ls-files -v` prints skip-worktree entries with an `S` tag.
        let out = std::process::Command::new("git")
            .args(["ls-files", "-v"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        let listing = String::from_utf8(out.stdout).unwrap();
        assert!(listing.contains("S tutorials/readme.md"));
        assert!(listing.contains("S tutorials/part1/intro.md"));
        assert!(listing.contains("H notes.md"));
    }

    #[test]
    fn nothing_matched_runs_nothing() {
        let runner = std::sync::Arc::new(crate::exec::testing::RecordingRunner::new());
        let applied = SkipWorktreeApplier::new(GitCli::with_runner(runner.clone()))
            .apply(Path::new("/repo"), &MatchedPaths::default())
            .unwrap();
        assert_eq!(applied, 0);
        assert!(runner.rendered_calls().is_empty());
    }
}
