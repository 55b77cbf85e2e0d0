use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use super::lock::{LockError, LockManager};
use super::skip_worktree::{SkipWorktreeApplier, SkipWorktreeError};
use super::snapshot::{SnapshotBuilder, SnapshotError};
use crate::config::ProtectConfig;
use crate::gateway::{Elevator, GatewayError, PrivilegeGateway};
use crate::git::{GitCli, GitError};
use crate::identity::Account;
use crate::patterns::{FindError, FindOptions, PatternSet, find};

/// States of one protection run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Locked,
    Matched,
    ConflictChecked,
    Snapshotted,
    Synced,
    Flagged,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Locked => "locked",
            Phase::Matched => "matched",
            Phase::ConflictChecked => "conflict-checked",
            Phase::Snapshotted => "snapshotted",
            Phase::Synced => "synced",
            Phase::Flagged => "flagged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ProtectError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to match protected paths: {0}")]
    Find(#[from] FindError),
    #[error("failed to check for merge conflicts: {0}")]
    ConflictCheck(#[source] GitError),
    #[error("protected paths have unresolved merge conflicts: {}", .paths.join(", "))]
    UnmergedConflict { paths: Vec<String> },
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    SkipWorktree(#[from] SkipWorktreeError),
}

impl ProtectError {
    /// The last phase the run reached before failing.
    pub fn phase(&self) -> Phase {
        match self {
            ProtectError::Lock(_) => Phase::Idle,
            ProtectError::Find(_) => Phase::Locked,
            ProtectError::ConflictCheck(_) | ProtectError::UnmergedConflict { .. } => {
                Phase::Matched
            }
            ProtectError::Snapshot(_) => Phase::ConflictChecked,
            ProtectError::Gateway(_) => Phase::Snapshotted,
            ProtectError::SkipWorktree(_) => Phase::Synced,
        }
    }
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtectOutcome {
    NoPatterns,
    NoMatches,
    Protected { paths: Vec<String>, flagged: usize },
}

/// Drives one protection run against a repository.
pub struct ProtectionOrchestrator {
    git: GitCli,
    locks: LockManager,
    snapshots: SnapshotBuilder,
    gateway: PrivilegeGateway,
    skip_worktree: SkipWorktreeApplier,
    lock_timeout: Duration,
}

impl ProtectionOrchestrator {
    pub fn new(
        git: GitCli,
        locks: LockManager,
        snapshots: SnapshotBuilder,
        gateway: PrivilegeGateway,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            skip_worktree: SkipWorktreeApplier::new(git.clone()),
            git,
            locks,
            snapshots,
            gateway,
            lock_timeout,
        }
    }

    /// Wire every component from `config`.
    pub fn from_config(
        config: &ProtectConfig,
        git: GitCli,
        real_user: Account,
        elevator: Box<dyn Elevator>,
    ) -> Self {
        let locks = LockManager::new(git.clone()).with_poll_interval(config.lock_poll_interval());
        let snapshots =
            SnapshotBuilder::new(git.clone(), &config.temp_root, config.stage_prefix.clone());
        let gateway = PrivilegeGateway::new(config.gateway_policy(), real_user, elevator);
        Self::new(git, locks, snapshots, gateway, config.lock_timeout())
    }

    /// Run protection for `patterns` in the repository at `repository_root`.
    ///
    /// The lock is released on every path out of this function.
    pub fn run(
        &self,
        repository_root: &Path,
        patterns: &PatternSet,
    ) -> Result<ProtectOutcome, ProtectError> {
        let lock = self.locks.acquire(repository_root, self.lock_timeout)?;
        log::debug!("phase {}: {}", Phase::Locked, lock.path().display());

        let result = self.run_locked(repository_root, patterns);

        if let Err(e) = lock.release() {
            log::warn!("{e}");
        }
        result
    }

    fn run_locked(
        &self,
        repository_root: &Path,
        patterns: &PatternSet,
    ) -> Result<ProtectOutcome, ProtectError> {
        if patterns.is_empty() {
            log::info!("no protected path patterns configured");
            return Ok(ProtectOutcome::NoPatterns);
        }

        let matched = find(repository_root, patterns, FindOptions::default())?.outermost();
        if matched.is_empty() {
            log::info!("no paths match {} protected pattern(s)", patterns.len());
            return Ok(ProtectOutcome::NoMatches);
        }
        let paths = matched.relative_paths();
        log::debug!("phase {}: {}", Phase::Matched, paths.join(", "));

        let conflicted = self
            .git
            .unmerged_entries(repository_root, &paths)
            .map_err(ProtectError::ConflictCheck)?;
        if !conflicted.is_empty() {
            return Err(ProtectError::UnmergedConflict { paths: conflicted });
        }
        log::debug!("phase {}", Phase::ConflictChecked);

        let snapshot = self.snapshots.build(repository_root, &matched)?;
        log::debug!("phase {}: {}", Phase::Snapshotted, snapshot.path().display());

        self.gateway.sync(snapshot.path(), repository_root, &paths)?;
        log::debug!("phase {}", Phase::Synced);
        if let Err(e) = snapshot.close() {
            log::warn!("failed to remove staging directory: {e}");
        }

        let flagged = self.skip_worktree.apply(repository_root, &matched)?;
        log::debug!("phase {}", Phase::Flagged);
        log::info!(
            "protected {} path(s), {} file(s) flagged skip-worktree",
            paths.len(),
            flagged
        );
        Ok(ProtectOutcome::Protected { paths, flagged })
    }
}
