use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;

use crate::git::{GitCli, GitError};

/// Name of the marker file inside the repository's git directory.
pub const LOCK_FILE_NAME: &str = "protect-paths.lock";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for {path}")]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("failed to release {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve git directory: {0}")]
    GitDir(#[from] GitError),
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Answers whether a process id still names a running process.
///
/// Implementations must answer `true` when they cannot tell.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes liveness with a zero signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return true;
        };
        if pid <= 0 {
            return true;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM means the process exists under another user.
        io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

/// Serializes protection runs per repository.
#[derive(Clone)]
pub struct LockManager {
    git: GitCli,
    probe: Arc<dyn ProcessProbe>,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(git: GitCli) -> Self {
        Self {
            git,
            probe: Arc::new(SignalProbe),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Acquire the protection lock of the repository at `repository_root`.
    pub fn acquire(&self, repository_root: &Path, timeout: Duration) -> Result<RepoLock, LockError> {
        let git_dir = self.git.git_dir(repository_root)?;
        self.acquire_at(&git_dir.join(LOCK_FILE_NAME), timeout)
    }

    /// Acquire a lock file at an explicit path.
    ///
    /// Polls until `timeout` elapses. A holder whose process is gone is
    /// reclaimed immediately.
    pub fn acquire_at(&self, lock_path: &Path, timeout: Duration) -> Result<RepoLock, LockError> {
        let io_err = |source| LockError::Io {
            path: lock_path.to_path_buf(),
            source,
        };
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o644)
                .open(lock_path)
            {
                Ok(mut file) => {
                    // Advisory lock first, then the pid.
                    file.lock_exclusive().map_err(io_err)?;
                    writeln!(file, "{}", std::process::id()).map_err(io_err)?;
                    file.sync_all().map_err(io_err)?;
                    log::debug!("acquired {}", lock_path.display());
                    return Ok(RepoLock {
                        path: lock_path.to_path_buf(),
                        file: Some(file),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(lock_path, timeout)? {
                        continue;
                    }
                    if start.elapsed() >= timeout {
                        return Err(LockError::Timeout {
                            path: lock_path.to_path_buf(),
                            timeout,
                        });
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    /// Remove `lock_path` if its holder is gone. Returns `true` when the
    /// caller should retry creation immediately.
    fn reclaim_if_stale(&self, lock_path: &Path, timeout: Duration) -> Result<bool, LockError> {
        let mut file = match File::open(lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => {
                return Err(LockError::Io {
                    path: lock_path.to_path_buf(),
                    source,
                });
            }
        };
        let mut contents = String::new();
        if file.read_to_string(&mut contents).is_err() {
            return Ok(false);
        }

        match parse_pid(&contents) {
            Some(pid) if self.probe.is_alive(pid) => return Ok(false),
            Some(pid) => log::debug!("lock holder pid {pid} is gone"),
            None => {
                let age = file
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok());
                match age {
                    Some(age) if age >= timeout => {
                        log::debug!("unreadable lock {} is {age:?} old", lock_path.display());
                    }
                    _ => return Ok(false),
                }
            }
        }

        // A holder keeps the advisory lock for its whole lifetime.
        if file.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        match same_file(&file, lock_path) {
            Ok(true) => {}
            Ok(false) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(_) => return Ok(false),
        }
        match std::fs::remove_file(lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: lock_path.to_path_buf(),
                    source,
                });
            }
        }
        log::warn!(
            "reclaimed stale lock {} (recorded holder: {})",
            lock_path.display(),
            contents.trim()
        );
        Ok(true)
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// True when `path` still names the open `file`.
fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let open = file.metadata()?;
    let on_disk = std::fs::symlink_metadata(path)?;
    Ok(open.dev() == on_disk.dev() && open.ino() == on_disk.ino())
}

/// A held protection lock.
///
/// The marker file is removed by [`RepoLock::release`], or best-effort when
/// the guard is dropped.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
    file: Option<File>,
    released: bool,
}

impl RepoLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker file and drop the advisory lock.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let result = self.remove_marker();
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
        result.map_err(|source| LockError::Release {
            path: self.path.clone(),
            source,
        })
    }

    fn remove_marker(&self) -> io::Result<()> {
        if let Some(file) = &self.file {
            if !same_file(file, &self.path)? {
                return Err(io::Error::other("lock file was replaced by another holder"));
            }
        }
        std::fs::remove_file(&self.path)
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.remove_marker() {
                log::warn!("failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}
