//! Structural validation applied on both sides of the privilege boundary.
//!
//! Nothing here mutates the filesystem; every check is a read-only `lstat`,
//! `canonicalize` or string comparison, so a rejection always happens before
//! any privileged action.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use crate::git::validate_relative_path;

/// Minimum number of random characters after the staging prefix.
pub const MIN_STAGE_SUFFIX_LEN: usize = 10;

/// Prefixes a destination may never fall under.
pub const SYSTEM_PREFIXES: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/sys", "/proc", "/dev",
];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("source {0} is not a staging directory under the temporary root")]
    SourcePattern(PathBuf),
    #[error("source {0} is a symlink")]
    SourceSymlink(PathBuf),
    #[error("source {0} is not a directory")]
    SourceNotDirectory(PathBuf),
    #[error("{path} is owned by uid {actual}, expected uid {expected}")]
    SourceOwner {
        path: PathBuf,
        actual: u32,
        expected: u32,
    },
    #[error("destination {0} is a symlink")]
    DestinationSymlink(PathBuf),
    #[error("destination {0} is not a directory")]
    DestinationNotDirectory(PathBuf),
    #[error("{0} does not resolve to itself")]
    NotCanonical(PathBuf),
    #[error("destination {0} is under a system directory")]
    SystemPath(PathBuf),
    #[error("destination {path} is not inside {mount_root}")]
    OutsideMountRoot { path: PathBuf, mount_root: PathBuf },
    #[error("destination {0} is not the root of a git working tree")]
    NotWorktree(PathBuf),
    #[error("parent of {path} is owned by uid {actual}, expected uid {expected}")]
    ParentOwner {
        path: PathBuf,
        actual: u32,
        expected: u32,
    },
    #[error("invalid relative path: {0}")]
    RelativePath(String),
    #[error("no paths to synchronize")]
    NoPaths,
    #[error("failed to inspect {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A validated synchronization request.
///
/// Only [`GatewayPolicy::validate`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOperation {
    source: PathBuf,
    destination: PathBuf,
    paths: Vec<String>,
}

impl SyncOperation {
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Repository-relative paths to mirror, each validated.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayPolicy {
    temp_root: PathBuf,
    stage_prefix: String,
    mount_root: PathBuf,
    min_suffix_len: usize,
    system_prefixes: Vec<PathBuf>,
}

impl GatewayPolicy {
    pub fn new(temp_root: &Path, stage_prefix: &str, mount_root: &Path) -> Self {
        Self {
            temp_root: temp_root.to_path_buf(),
            stage_prefix: stage_prefix.to_string(),
            mount_root: mount_root.to_path_buf(),
            min_suffix_len: MIN_STAGE_SUFFIX_LEN,
            system_prefixes: SYSTEM_PREFIXES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    fn source_pattern(&self) -> Option<Regex> {
        let root = self.temp_root.to_str()?.trim_end_matches('/');
        let pattern = format!(
            "^{}/{}[A-Za-z0-9]{{{},}}$",
            regex::escape(root),
            regex::escape(&self.stage_prefix),
            self.min_suffix_len
        );
        Regex::new(&pattern).ok()
    }

    /// Validate a complete request on behalf of the user with `real_uid`.
    pub fn validate(
        &self,
        source: &Path,
        destination: &Path,
        paths: &[String],
        real_uid: u32,
    ) -> Result<SyncOperation, ValidationError> {
        let source = self.validate_source(source, real_uid)?;
        let destination = self.validate_destination(destination, real_uid)?;
        if paths.is_empty() {
            return Err(ValidationError::NoPaths);
        }
        for path in paths {
            validate_relative_path(path)
                .map_err(|e| ValidationError::RelativePath(e.to_string()))?;
        }
        Ok(SyncOperation {
            source,
            destination,
            paths: paths.to_vec(),
        })
    }

    pub fn validate_source(&self, source: &Path, real_uid: u32) -> Result<PathBuf, ValidationError> {
        let absolute = absolute(source)?;
        let matches = match (absolute.to_str(), self.source_pattern()) {
            (Some(s), Some(re)) => re.is_match(s),
            _ => false,
        };
        if !matches {
            return Err(ValidationError::SourcePattern(absolute));
        }

        let meta = lstat(&absolute)?;
        if meta.file_type().is_symlink() {
            return Err(ValidationError::SourceSymlink(absolute));
        }
        if !meta.is_dir() {
            return Err(ValidationError::SourceNotDirectory(absolute));
        }
        ensure_canonical(&absolute)?;
        if meta.uid() != real_uid {
            return Err(ValidationError::SourceOwner {
                path: absolute,
                actual: meta.uid(),
                expected: real_uid,
            });
        }
        Ok(absolute)
    }

    pub fn validate_destination(
        &self,
        destination: &Path,
        real_uid: u32,
    ) -> Result<PathBuf, ValidationError> {
        let absolute = absolute(destination)?;
        let meta = lstat(&absolute)?;
        if meta.file_type().is_symlink() {
            return Err(ValidationError::DestinationSymlink(absolute));
        }
        if !meta.is_dir() {
            return Err(ValidationError::DestinationNotDirectory(absolute));
        }
        ensure_canonical(&absolute)?;

        if absolute == Path::new("/")
            || self.system_prefixes.iter().any(|p| absolute.starts_with(p))
        {
            return Err(ValidationError::SystemPath(absolute));
        }
        if absolute == self.mount_root || !absolute.starts_with(&self.mount_root) {
            return Err(ValidationError::OutsideMountRoot {
                path: absolute,
                mount_root: self.mount_root.clone(),
            });
        }

        match std::fs::symlink_metadata(absolute.join(".git")) {
            Ok(git) if !git.file_type().is_symlink() => {}
            _ => return Err(ValidationError::NotWorktree(absolute)),
        }

        let parent = absolute
            .parent()
            .ok_or_else(|| ValidationError::SystemPath(absolute.clone()))?;
        let parent_meta = lstat(parent)?;
        if parent_meta.uid() != real_uid {
            return Err(ValidationError::ParentOwner {
                path: absolute.clone(),
                actual: parent_meta.uid(),
                expected: real_uid,
            });
        }
        Ok(absolute)
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ValidationError> {
    std::path::absolute(path).map_err(|source| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn lstat(path: &Path) -> Result<std::fs::Metadata, ValidationError> {
    std::fs::symlink_metadata(path).map_err(|source| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Rejects paths with symlinked ancestors or `..` components.
fn ensure_canonical(path: &Path) -> Result<(), ValidationError> {
    let canonical = std::fs::canonicalize(path).map_err(|source| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if canonical != path {
        return Err(ValidationError::NotCanonical(path.to_path_buf()));
    }
    Ok(())
}
