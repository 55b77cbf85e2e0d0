//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for everything that touches an index or the working tree:**
//! - `read_tree` / `checkout_index` - populate and extract an isolated index
//! - `ls_files` / `unmerged_entries` - enumerate tracked and conflicted paths
//! - `set_skip_worktree` - annotate the real index
//! - `sparse_checkout_set` - restrict the materialized tree
//!
//! **libgit2 for read operations:**
//! - `is_worktree_root` - confirm a directory is the top of a non-bare checkout
//! - `head_tree_dirs` - list directories of the HEAD tree

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{ObjectType, Repository, TreeWalkMode, TreeWalkResult};
use thiserror::Error;

use crate::exec::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// A git subcommand exited unsuccessfully.
    #[error("`{command}` failed (exit code: {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Validate that a repository-relative path is safe to hand to git or to join
/// onto a destination directory.
///
/// Rejects:
/// - Empty strings
/// - Absolute paths
/// - `.` / `..` components (path traversal)
/// - `.git` components (repository metadata)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_relative_path(value: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput("path cannot be empty".to_string()));
    }
    if value.starts_with('/') {
        return Err(GitError::InvalidInput(format!(
            "path '{value}' must be relative"
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "path '{value}' cannot start with '-'"
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20 || b == 0x7f) {
        return Err(GitError::InvalidInput(format!(
            "path {value:?} cannot contain null or control characters"
        )));
    }
    for component in value.split('/') {
        match component {
            "" | "." | ".." => {
                return Err(GitError::InvalidInput(format!(
                    "path '{value}' contains an empty, '.' or '..' component"
                )));
            }
            ".git" => {
                return Err(GitError::InvalidInput(format!(
                    "path '{value}' reaches into repository metadata"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_all(paths: &[String]) -> Result<(), GitError> {
    paths.iter().try_for_each(|p| validate_relative_path(p))
}

/// Split NUL-terminated git output into owned strings.
fn split_nul(stdout: &[u8]) -> Result<Vec<String>, GitError> {
    stdout
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            String::from_utf8(chunk.to_vec())
                .map_err(|_| GitError::ParseError("git emitted a non UTF-8 path".to_string()))
        })
        .collect()
}

fn nul_joined(items: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(item.as_bytes());
        out.push(0);
    }
    out
}

/// Git CLI wrapper with security hardening.
#[derive(Clone)]
pub struct GitCli {
    git_path: String,
    runner: Arc<dyn CommandRunner>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GitCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCli")
            .field("git_path", &self.git_path)
            .finish_non_exhaustive()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    /// Create a GitCli that executes through the given runner.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            git_path: "git".into(),
            runner,
        }
    }

    /// Create a hardened command rooted at `dir`.
    ///
    /// Applies:
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `GIT_LITERAL_PATHSPECS=1` - matched paths are never glob or magic
    /// - `core.hooksPath=` - disable hooks execution (we usually run inside one)
    /// - drops an inherited `GIT_INDEX_FILE`
    fn command(&self, dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.git_path)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_LITERAL_PATHSPECS", "1")
            .env_remove("GIT_INDEX_FILE")
            .args(["-c", "core.hooksPath="])
            .current_dir(dir)
    }

    fn run(&self, spec: CommandSpec) -> Result<CommandOutput, GitError> {
        log::debug!("running {}", spec.display());
        let output = self.runner.run(&spec)?;
        if !output.success {
            return Err(GitError::CommandFailed {
                command: spec.display(),
                code: output.code,
                stderr: output.stderr_lossy(),
            });
        }
        Ok(output)
    }

    fn run_stdout(&self, spec: CommandSpec) -> Result<String, GitError> {
        let output = self.run(spec)?;
        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| GitError::ParseError("git emitted non UTF-8 output".to_string()))
    }

    /// Resolve the repository's metadata directory.
    ///
    /// Goes through `git rev-parse` instead of assuming `<root>/.git` so linked
    /// worktrees and submodules (where `.git` is a file) resolve correctly.
    pub fn git_dir(&self, repository_root: &Path) -> Result<PathBuf, GitError> {
        let raw = self.run_stdout(self.command(repository_root).args(["rev-parse", "--git-dir"]))?;
        if raw.is_empty() {
            return Err(GitError::ParseError("rev-parse returned no git dir".to_string()));
        }
        let git_dir = PathBuf::from(raw);
        let git_dir = if git_dir.is_absolute() {
            git_dir
        } else {
            repository_root.join(git_dir)
        };
        std::fs::metadata(&git_dir)?;
        Ok(git_dir)
    }

    /// Top-level directory of the working tree containing `dir`.
    pub fn show_toplevel(&self, dir: &Path) -> Result<PathBuf, GitError> {
        let raw = self.run_stdout(self.command(dir).args(["rev-parse", "--show-toplevel"]))?;
        if raw.is_empty() {
            return Err(GitError::ParseError(
                "rev-parse returned no top-level directory".to_string(),
            ));
        }
        Ok(PathBuf::from(raw))
    }

    /// Paths under `paths` that have unmerged (conflict stage) index entries.
    pub fn unmerged_entries(
        &self,
        repository_root: &Path,
        paths: &[String],
    ) -> Result<Vec<String>, GitError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        validate_all(paths)?;
        let output = self.run(
            self.command(repository_root)
                .args(["ls-files", "-u", "-z", "--"])
                .args(paths),
        )?;
        // Records look like "<mode> <sha> <stage>\t<path>".
        let mut conflicted: Vec<String> = split_nul(&output.stdout)?
            .into_iter()
            .filter_map(|record| record.split_once('\t').map(|(_, p)| p.to_string()))
            .collect();
        conflicted.dedup();
        Ok(conflicted)
    }

    /// Populate the index at `index_file` from `treeish`.
    pub fn read_tree(
        &self,
        repository_root: &Path,
        index_file: &Path,
        treeish: &str,
    ) -> Result<(), GitError> {
        if treeish.starts_with('-') || treeish.is_empty() {
            return Err(GitError::InvalidInput(format!("invalid tree-ish '{treeish}'")));
        }
        self.run(
            self.command(repository_root)
                .env("GIT_INDEX_FILE", index_file)
                .args(["read-tree", treeish]),
        )?;
        Ok(())
    }

    /// Tracked files under `paths`, read from `index_file` or the real index.
    pub fn ls_files(
        &self,
        repository_root: &Path,
        index_file: Option<&Path>,
        paths: &[String],
    ) -> Result<Vec<String>, GitError> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        validate_all(paths)?;
        let mut spec = self.command(repository_root);
        if let Some(index) = index_file {
            spec = spec.env("GIT_INDEX_FILE", index);
        }
        let output = self.run(spec.args(["ls-files", "-z", "--"]).args(paths))?;
        split_nul(&output.stdout)
    }

    /// Write `files` from `index_file` below `prefix`, regardless of any
    /// skip-worktree bits recorded in that index.
    pub fn checkout_index(
        &self,
        repository_root: &Path,
        index_file: &Path,
        prefix: &Path,
        files: &[String],
    ) -> Result<(), GitError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut prefix_arg = OsString::from("--prefix=");
        prefix_arg.push(prefix.as_os_str());
        prefix_arg.push("/");
        self.run(
            self.command(repository_root)
                .env("GIT_INDEX_FILE", index_file)
                .args(["checkout-index", "--ignore-skip-worktree-bits"])
                .arg(prefix_arg)
                .args(["-z", "--stdin"])
                .stdin(nul_joined(files)),
        )?;
        Ok(())
    }

    /// Set the skip-worktree bit on each of `files` in the real index.
    pub fn set_skip_worktree(
        &self,
        repository_root: &Path,
        files: &[String],
    ) -> Result<(), GitError> {
        if files.is_empty() {
            return Ok(());
        }
        self.run(
            self.command(repository_root)
                .args(["update-index", "--skip-worktree", "-z", "--stdin"])
                .stdin(nul_joined(files)),
        )?;
        Ok(())
    }

    /// Restrict the working tree to `dirs` using cone-mode sparse checkout.
    pub fn sparse_checkout_set(
        &self,
        repository_root: &Path,
        dirs: &[String],
    ) -> Result<(), GitError> {
        if dirs.is_empty() {
            return Err(GitError::InvalidInput(
                "no paths provided for sparse-checkout".to_string(),
            ));
        }
        validate_all(dirs)?;
        let mut input = dirs.join("\n").into_bytes();
        input.push(b'\n');
        self.run(
            self.command(repository_root)
                .args(["sparse-checkout", "set", "--cone", "--stdin"])
                .stdin(input),
        )?;
        Ok(())
    }

    /// Check that git can be executed at all.
    pub fn version(&self) -> Result<String, GitError> {
        self.run_stdout(CommandSpec::new(&self.git_path).arg("--version"))
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    Ok(Repository::open(path)?)
}

/// True when `dir` is the top of a non-bare working tree.
pub fn is_worktree_root(dir: &Path) -> bool {
    let Ok(repo) = open_repository(dir) else {
        return false;
    };
    let Some(workdir) = repo.workdir() else {
        return false;
    };
    match (std::fs::canonicalize(workdir), std::fs::canonicalize(dir)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Every directory of the HEAD tree, as slash-separated relative paths.
pub fn head_tree_dirs(repo: &Repository) -> Result<Vec<String>, GitError> {
    let tree = repo.head()?.peel_to_tree()?;
    let mut dirs = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Tree) {
            if let Some(name) = entry.name() {
                dirs.push(format!("{root}{name}"));
            }
        }
        TreeWalkResult::Ok
    })?;
    dirs.sort();
    Ok(dirs)
}
