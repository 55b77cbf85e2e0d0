//! The protection run: lock, match, conflict check, snapshot, sync, flag.

mod lock;
mod orchestrator;
mod skip_worktree;
mod snapshot;

pub use lock::{LOCK_FILE_NAME, LockError, LockManager, ProcessProbe, RepoLock, SignalProbe};
pub use orchestrator::{Phase, ProtectError, ProtectOutcome, ProtectionOrchestrator};
pub use skip_worktree::{SkipWorktreeApplier, SkipWorktreeError};
pub use snapshot::{Snapshot, SnapshotBuilder, SnapshotError};
