use std::path::PathBuf;
use std::sync::Arc;

use super::SyncExecutionError;
use super::mirror::mirror;
use super::policy::SyncOperation;
use crate::exec::{CommandRunner, CommandSpec, SystemRunner};
use crate::identity::Account;

/// Crosses the privilege boundary for exactly one operation shape.
pub trait Elevator: Send + Sync {
    fn elevate(&self, op: &SyncOperation) -> Result<(), SyncExecutionError>;
}

/// Runs the installed helper through `sudo -n`; the helper validates the
/// request again on its own before touching anything.
#[derive(Clone)]
pub struct SudoHelper {
    sudo_path: PathBuf,
    helper_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SudoHelper {
    pub fn new(sudo_path: impl Into<PathBuf>, helper_path: impl Into<PathBuf>) -> Self {
        Self::with_runner(sudo_path, helper_path, Arc::new(SystemRunner))
    }

    pub fn with_runner(
        sudo_path: impl Into<PathBuf>,
        helper_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            sudo_path: sudo_path.into(),
            helper_path: helper_path.into(),
            runner,
        }
    }

    fn command(&self, op: &SyncOperation) -> CommandSpec {
        CommandSpec::new(&self.sudo_path)
            .args(["-n", "--"])
            .arg(&self.helper_path)
            .arg(op.source())
            .arg(op.destination())
            .args(op.paths())
    }
}

impl Elevator for SudoHelper {
    fn elevate(&self, op: &SyncOperation) -> Result<(), SyncExecutionError> {
        let spec = self.command(op);
        log::debug!("running {}", spec.display());
        let output = self
            .runner
            .run(&spec)
            .map_err(|source| SyncExecutionError::Spawn {
                command: spec.display(),
                source,
            })?;
        if !output.success {
            return Err(SyncExecutionError::HelperFailed {
                command: spec.display(),
                code: output.code,
                stderr: output.stderr_lossy(),
            });
        }
        Ok(())
    }
}

/// Mirrors in the current process, for callers that already hold the
/// needed privileges.
#[derive(Debug, Clone, Default)]
pub struct InProcess {
    owner: Option<Account>,
}

impl InProcess {
    /// Hand written entries to `owner`, or keep the current owner with `None`.
    pub fn new(owner: Option<Account>) -> Self {
        Self { owner }
    }
}

impl Elevator for InProcess {
    fn elevate(&self, op: &SyncOperation) -> Result<(), SyncExecutionError> {
        mirror(op, self.owner.as_ref()).map(|_| ())
    }
}
