//! The privilege boundary.
//!
//! [`PrivilegeGateway`] validates a sync request as the invoking user, then
//! hands it to an [`Elevator`]. The privileged side ([`helper::serve`], run
//! by `githook-sync`) re-runs [`GatewayPolicy::validate`] itself before
//! calling [`mirror`].

mod elevate;
pub mod helper;
mod mirror;
mod policy;

pub use elevate::{Elevator, InProcess, SudoHelper};
pub use mirror::{MirrorStats, mirror};
pub use policy::{
    GatewayPolicy, MIN_STAGE_SUFFIX_LEN, SYSTEM_PREFIXES, SyncOperation, ValidationError,
};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::git;
use crate::identity::Account;

/// Failure after validation succeeded; the destination may be partially
/// updated.
#[derive(Debug, Error)]
pub enum SyncExecutionError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refusing to write through {0}: not a real directory")]
    UnsafeParent(PathBuf),
    #[error("{0} no longer holds a .git entry")]
    NotWorktree(PathBuf),
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed (exit code: {code:?}): {stderr}")]
    HelperFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("sync request rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("sync failed: {0}")]
    Execution(#[from] SyncExecutionError),
}

pub struct PrivilegeGateway {
    policy: GatewayPolicy,
    real_user: Account,
    elevator: Box<dyn Elevator>,
}

impl PrivilegeGateway {
    pub fn new(policy: GatewayPolicy, real_user: Account, elevator: Box<dyn Elevator>) -> Self {
        Self {
            policy,
            real_user,
            elevator,
        }
    }

    /// Mirror `paths` of the staging directory `source` into the working
    /// tree `destination`.
    pub fn sync(
        &self,
        source: &Path,
        destination: &Path,
        paths: &[String],
    ) -> Result<(), GatewayError> {
        let op = self
            .policy
            .validate(source, destination, paths, self.real_user.uid)?;
        if !git::is_worktree_root(op.destination()) {
            return Err(ValidationError::NotWorktree(op.destination().to_path_buf()).into());
        }
        log::info!(
            "syncing {} protected path(s) into {}",
            op.paths().len(),
            op.destination().display()
        );
        self.elevator.elevate(&op)?;
        Ok(())
    }
}
