//! Native mirror of a staging directory into a working tree.
//!
//! Each relative path of a [`SyncOperation`] is mirrored independently:
//! entries missing from the staging tree are removed from the destination,
//! directories lose children the staging tree does not have, and every
//! written entry is handed to the protection identity with normalized
//! permissions. `.git` is never read, written or removed.
//!
//! Both trees are walked through directory descriptors opened with
//! `O_NOFOLLOW`. Every create, rename and unlink is relative to an open
//! directory, and ownership and modes are set on open descriptors, so a
//! symlink swapped into either tree mid-run is never followed.

use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag, open, openat, readlinkat, renameat};
use nix::sys::stat::{FileStat, Mode, fchmod, fstat, fstatat, mkdirat};
use nix::unistd::{Gid, Uid, UnlinkatFlags, fchown, fchownat, symlinkat, unlinkat};

use super::SyncExecutionError;
use super::policy::SyncOperation;
use crate::identity::Account;

const GIT_DIR: &str = ".git";
const DIR_MODE: libc::mode_t = 0o755;
const EXEC_FILE_MODE: libc::mode_t = 0o755;
const FILE_MODE: libc::mode_t = 0o644;
const TEMP_PREFIX: &str = ".githook-protect-";
const TEMP_ATTEMPTS: u32 = 16;

/// Counters reported after a mirror run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorStats {
    pub files_written: usize,
    pub files_unchanged: usize,
    pub dirs_created: usize,
    pub symlinks_written: usize,
    pub symlinks_skipped: usize,
    pub removed: usize,
}

/// Mirror every path of `op` from its source into its destination.
///
/// With `owner` set, every written entry is chowned to that account.
pub fn mirror(op: &SyncOperation, owner: Option<&Account>) -> Result<MirrorStats, SyncExecutionError> {
    let source = open_root(op.source())?;
    let dest = open_root(op.destination())?;
    let source_uid = fstat(&source).map_err(errno_at(op.source()))?.st_uid;
    match fstatat(&dest, GIT_DIR, AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(stat) if Kind::of(&stat) != Kind::Symlink => {}
        _ => return Err(SyncExecutionError::NotWorktree(op.destination().to_path_buf())),
    }

    let mut mirror = Mirror {
        source_root: op.source(),
        dest_root: op.destination(),
        source_uid,
        owner: owner.map(|a| (Uid::from_raw(a.uid), Gid::from_raw(a.gid))),
        temp_seq: 0,
        stats: MirrorStats::default(),
    };
    for rel in op.paths() {
        mirror.sync_path(&source, &dest, Path::new(rel))?;
    }
    log::info!(
        "mirrored {} path(s) into {}: {:?}",
        op.paths().len(),
        op.destination().display(),
        mirror.stats
    );
    Ok(mirror.stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
    Other,
}

impl Kind {
    fn of(stat: &FileStat) -> Self {
        match stat.st_mode & libc::S_IFMT {
            libc::S_IFDIR => Kind::Dir,
            libc::S_IFREG => Kind::File,
            libc::S_IFLNK => Kind::Symlink,
            _ => Kind::Other,
        }
    }
}

fn dir_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC
}

fn read_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC
}

fn io_err(path: &Path, errno: Errno) -> SyncExecutionError {
    SyncExecutionError::Io {
        path: path.to_path_buf(),
        source: errno.into(),
    }
}

fn errno_at(path: &Path) -> impl FnOnce(Errno) -> SyncExecutionError + '_ {
    move |errno| io_err(path, errno)
}

fn std_err(path: &Path) -> impl FnOnce(io::Error) -> SyncExecutionError + '_ {
    move |source| SyncExecutionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Open an absolute directory one component at a time, refusing a symlink
/// at every level.
fn open_root(path: &Path) -> Result<OwnedFd, SyncExecutionError> {
    let mut dir = open("/", dir_flags(), Mode::empty()).map_err(errno_at(path))?;
    for component in path.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(name) => {
                dir = openat(&dir, name, dir_flags(), Mode::empty()).map_err(|e| match e {
                    Errno::ELOOP | Errno::ENOTDIR => {
                        SyncExecutionError::UnsafeParent(path.to_path_buf())
                    }
                    e => io_err(path, e),
                })?;
            }
            _ => return Err(SyncExecutionError::UnsafeParent(path.to_path_buf())),
        }
    }
    Ok(dir)
}

fn stat_at(dir: &OwnedFd, name: &OsStr, path: &Path) -> Result<Option<FileStat>, SyncExecutionError> {
    match fstatat(dir, name, AtFlags::AT_SYMLINK_NOFOLLOW) {
        Ok(stat) => Ok(Some(stat)),
        Err(Errno::ENOENT) => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Names in `dir`, without `.` and `..`.
fn list(dir: &OwnedFd, path: &Path) -> Result<Vec<OsString>, SyncExecutionError> {
    let mut handle = Dir::openat(dir, ".", dir_flags(), Mode::empty()).map_err(errno_at(path))?;
    let mut names = Vec::new();
    for entry in handle.iter() {
        let entry = entry.map_err(errno_at(path))?;
        let bytes = entry.file_name().to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(OsStr::from_bytes(bytes).to_os_string());
    }
    Ok(names)
}

fn unlink(dir: &OwnedFd, name: &OsStr, flag: UnlinkatFlags, path: &Path) -> Result<(), SyncExecutionError> {
    match unlinkat(dir, name, flag) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Remove the directory `name` under `dir` and everything below it.
fn remove_tree(dir: &OwnedFd, name: &OsStr, path: &Path) -> Result<(), SyncExecutionError> {
    let child_dir = match openat(dir, name, dir_flags(), Mode::empty()) {
        Ok(fd) => fd,
        // Replaced by a non-directory since it was inspected.
        Err(Errno::ELOOP | Errno::ENOTDIR) => {
            return unlink(dir, name, UnlinkatFlags::NoRemoveDir, path);
        }
        Err(Errno::ENOENT) => return Ok(()),
        Err(e) => return Err(io_err(path, e)),
    };
    for child in list(&child_dir, path)? {
        let child_path = path.join(&child);
        match stat_at(&child_dir, &child, &child_path)? {
            Some(stat) if Kind::of(&stat) == Kind::Dir => {
                remove_tree(&child_dir, &child, &child_path)?
            }
            Some(_) => unlink(&child_dir, &child, UnlinkatFlags::NoRemoveDir, &child_path)?,
            None => {}
        }
    }
    unlink(dir, name, UnlinkatFlags::RemoveDir, path)
}

/// True when a symlink at `link_rel` pointing at `target` resolves inside
/// the tree it lives in.
fn is_safe_link(link_rel: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }
    let mut depth = link_rel.components().count().saturating_sub(1);
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

struct Mirror<'a> {
    source_root: &'a Path,
    dest_root: &'a Path,
    /// Owner of the staging directory; staged files owned by anyone else
    /// are not copied.
    source_uid: libc::uid_t,
    owner: Option<(Uid, Gid)>,
    temp_seq: u64,
    stats: MirrorStats,
}

impl Mirror<'_> {
    fn sync_path(&mut self, source: &OwnedFd, dest: &OwnedFd, rel: &Path) -> Result<(), SyncExecutionError> {
        let (Some(parent), Some(name)) = (rel.parent(), rel.file_name()) else {
            return Ok(());
        };
        let dst_dir = self.dest_parent(dest, parent)?;
        match self.source_parent(source, parent)? {
            Some(src_dir) => self.sync_entry(&src_dir, &dst_dir, name, rel),
            None => {
                log::debug!("{} is not in HEAD, removing it", rel.display());
                self.remove_entry(&dst_dir, name, rel)
            }
        }
    }

    /// Open every ancestor of a path below the destination root as a real
    /// directory, creating missing ones.
    fn dest_parent(&mut self, dest: &OwnedFd, parent: &Path) -> Result<OwnedFd, SyncExecutionError> {
        let mut dir = dest.try_clone().map_err(std_err(self.dest_root))?;
        let mut rel = PathBuf::new();
        for component in parent.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            rel.push(name);
            dir = match openat(&dir, name, dir_flags(), Mode::empty()) {
                Ok(fd) => fd,
                Err(Errno::ENOENT) => self.create_dir(&dir, name, &rel)?,
                Err(Errno::ELOOP | Errno::ENOTDIR) => {
                    return Err(SyncExecutionError::UnsafeParent(self.dest_root.join(&rel)));
                }
                Err(e) => return Err(io_err(&self.dest_root.join(&rel), e)),
            };
        }
        Ok(dir)
    }

    /// `None` when some ancestor is missing from the staging tree or is not
    /// a real directory there.
    fn source_parent(&self, source: &OwnedFd, parent: &Path) -> Result<Option<OwnedFd>, SyncExecutionError> {
        let mut dir = source.try_clone().map_err(std_err(self.source_root))?;
        let mut rel = PathBuf::new();
        for component in parent.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            rel.push(name);
            dir = match openat(&dir, name, dir_flags(), Mode::empty()) {
                Ok(fd) => fd,
                Err(Errno::ENOENT | Errno::ENOTDIR | Errno::ELOOP) => return Ok(None),
                Err(e) => return Err(io_err(&self.source_root.join(&rel), e)),
            };
        }
        Ok(Some(dir))
    }

    fn sync_entry(
        &mut self,
        src_dir: &OwnedFd,
        dst_dir: &OwnedFd,
        name: &OsStr,
        rel: &Path,
    ) -> Result<(), SyncExecutionError> {
        let Some(stat) = stat_at(src_dir, name, &self.source_root.join(rel))? else {
            return self.remove_entry(dst_dir, name, rel);
        };
        match Kind::of(&stat) {
            Kind::Symlink => self.sync_symlink(src_dir, dst_dir, name, rel),
            Kind::Dir => self.sync_dir(src_dir, dst_dir, name, rel),
            Kind::File => self.sync_file(src_dir, dst_dir, name, rel),
            Kind::Other => {
                log::warn!("skipping special file {}", self.source_root.join(rel).display());
                Ok(())
            }
        }
    }

    fn sync_dir(
        &mut self,
        src_dir: &OwnedFd,
        dst_dir: &OwnedFd,
        name: &OsStr,
        rel: &Path,
    ) -> Result<(), SyncExecutionError> {
        let src_path = self.source_root.join(rel);
        let dst_path = self.dest_root.join(rel);
        let src = openat(src_dir, name, dir_flags(), Mode::empty()).map_err(errno_at(&src_path))?;
        let dst = match openat(dst_dir, name, dir_flags(), Mode::empty()) {
            Ok(fd) => {
                self.apply_metadata(&fd, DIR_MODE, &dst_path)?;
                fd
            }
            Err(Errno::ENOENT) => self.create_dir(dst_dir, name, rel)?,
            Err(Errno::ELOOP | Errno::ENOTDIR) => {
                self.remove_entry(dst_dir, name, rel)?;
                self.create_dir(dst_dir, name, rel)?
            }
            Err(e) => return Err(io_err(&dst_path, e)),
        };

        let mut wanted: BTreeSet<OsString> = list(&src, &src_path)?.into_iter().collect();
        wanted.remove(OsStr::new(GIT_DIR));

        for child in list(&dst, &dst_path)? {
            if child.as_os_str() != OsStr::new(GIT_DIR) && !wanted.contains(&child) {
                self.remove_entry(&dst, &child, &rel.join(&child))?;
            }
        }
        for child in wanted {
            self.sync_entry(&src, &dst, &child, &rel.join(&child))?;
        }
        Ok(())
    }

    fn sync_file(
        &mut self,
        src_dir: &OwnedFd,
        dst_dir: &OwnedFd,
        name: &OsStr,
        rel: &Path,
    ) -> Result<(), SyncExecutionError> {
        let src_path = self.source_root.join(rel);
        let dst_path = self.dest_root.join(rel);

        let mut src = File::from(
            openat(src_dir, name, read_flags(), Mode::empty()).map_err(errno_at(&src_path))?,
        );
        let src_stat = fstat(&src).map_err(errno_at(&src_path))?;
        if Kind::of(&src_stat) != Kind::File {
            log::warn!("skipping {}: no longer a regular file", src_path.display());
            return Ok(());
        }
        if src_stat.st_uid != self.source_uid {
            log::warn!(
                "skipping {}: owned by uid {}, not the staging owner",
                src_path.display(),
                src_stat.st_uid
            );
            return Ok(());
        }
        let mode = if src_stat.st_mode & 0o111 != 0 {
            EXEC_FILE_MODE
        } else {
            FILE_MODE
        };
        let mut content = Vec::new();
        src.read_to_end(&mut content).map_err(std_err(&src_path))?;

        match stat_at(dst_dir, name, &dst_path)?.map(|stat| Kind::of(&stat)) {
            Some(Kind::File) => {
                if let Some(existing) = open_unchanged(dst_dir, name, &content, &dst_path)? {
                    self.apply_metadata(&existing, mode, &dst_path)?;
                    self.stats.files_unchanged += 1;
                    return Ok(());
                }
            }
            Some(Kind::Dir) => self.remove_entry(dst_dir, name, rel)?,
            _ => {}
        }

        self.replace_file(dst_dir, name, &content, mode, &dst_path)?;
        self.stats.files_written += 1;
        Ok(())
    }

    /// Write `content` to a fresh file beside `name` and rename it over
    /// `name`. rename(2) replaces a symlink rather than following it.
    fn replace_file(
        &mut self,
        dir: &OwnedFd,
        name: &OsStr,
        content: &[u8],
        mode: libc::mode_t,
        path: &Path,
    ) -> Result<(), SyncExecutionError> {
        let (temp_name, mut file) = self.create_temp(dir, path)?;
        let written = file
            .write_all(content)
            .map_err(std_err(path))
            .and_then(|()| self.apply_metadata(&file, mode, path))
            .and_then(|()| {
                renameat(dir, temp_name.as_os_str(), dir, name).map_err(errno_at(path))
            });
        if written.is_err() {
            let _ = unlinkat(dir, temp_name.as_os_str(), UnlinkatFlags::NoRemoveDir);
        }
        written
    }

    fn create_temp(&mut self, dir: &OwnedFd, path: &Path) -> Result<(OsString, File), SyncExecutionError> {
        let flags = OFlag::O_WRONLY
            | OFlag::O_CREAT
            | OFlag::O_EXCL
            | OFlag::O_NOFOLLOW
            | OFlag::O_CLOEXEC;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        for _ in 0..TEMP_ATTEMPTS {
            self.temp_seq += 1;
            let name = OsString::from(format!(
                "{TEMP_PREFIX}{}-{nanos:x}-{}",
                std::process::id(),
                self.temp_seq
            ));
            match openat(dir, name.as_os_str(), flags, Mode::S_IRUSR | Mode::S_IWUSR) {
                Ok(fd) => return Ok((name, File::from(fd))),
                Err(Errno::EEXIST) => continue,
                Err(e) => return Err(io_err(path, e)),
            }
        }
        Err(io_err(path, Errno::EEXIST))
    }

    fn sync_symlink(
        &mut self,
        src_dir: &OwnedFd,
        dst_dir: &OwnedFd,
        name: &OsStr,
        rel: &Path,
    ) -> Result<(), SyncExecutionError> {
        let target = readlinkat(src_dir, name).map_err(errno_at(&self.source_root.join(rel)))?;
        self.remove_entry(dst_dir, name, rel)?;
        if !is_safe_link(rel, Path::new(&target)) {
            log::warn!(
                "skipping symlink {} -> {}: it leaves the working tree",
                rel.display(),
                Path::new(&target).display()
            );
            self.stats.symlinks_skipped += 1;
            return Ok(());
        }
        let dst_path = self.dest_root.join(rel);
        symlinkat(target.as_os_str(), dst_dir, name).map_err(errno_at(&dst_path))?;
        if let Some((uid, gid)) = self.owner {
            fchownat(dst_dir, name, Some(uid), Some(gid), AtFlags::AT_SYMLINK_NOFOLLOW)
                .map_err(errno_at(&dst_path))?;
        }
        self.stats.symlinks_written += 1;
        Ok(())
    }

    /// Create `name` under `dir` and return it opened, owned by the
    /// protection identity.
    fn create_dir(&mut self, dir: &OwnedFd, name: &OsStr, rel: &Path) -> Result<OwnedFd, SyncExecutionError> {
        let path = self.dest_root.join(rel);
        mkdirat(dir, name, Mode::S_IRWXU).map_err(errno_at(&path))?;
        let fd = openat(dir, name, dir_flags(), Mode::empty()).map_err(|e| match e {
            Errno::ELOOP | Errno::ENOTDIR => SyncExecutionError::UnsafeParent(path.clone()),
            e => io_err(&path, e),
        })?;
        self.apply_metadata(&fd, DIR_MODE, &path)?;
        self.stats.dirs_created += 1;
        Ok(fd)
    }

    /// Chown then chmod an open descriptor.
    fn apply_metadata<F: AsFd>(&self, fd: F, mode: libc::mode_t, path: &Path) -> Result<(), SyncExecutionError> {
        if let Some((uid, gid)) = self.owner {
            fchown(fd.as_fd(), Some(uid), Some(gid)).map_err(errno_at(path))?;
        }
        fchmod(fd.as_fd(), Mode::from_bits_truncate(mode)).map_err(errno_at(path))
    }

    fn remove_entry(&mut self, dir: &OwnedFd, name: &OsStr, rel: &Path) -> Result<(), SyncExecutionError> {
        let path = self.dest_root.join(rel);
        let Some(stat) = stat_at(dir, name, &path)? else {
            return Ok(());
        };
        if Kind::of(&stat) == Kind::Dir {
            remove_tree(dir, name, &path)?;
        } else {
            unlink(dir, name, UnlinkatFlags::NoRemoveDir, &path)?;
        }
        self.stats.removed += 1;
        Ok(())
    }
}

/// Open `name` when it is a singly linked regular file holding exactly
/// `content`.
fn open_unchanged(
    dir: &OwnedFd,
    name: &OsStr,
    content: &[u8],
    path: &Path,
) -> Result<Option<File>, SyncExecutionError> {
    let mut file = match openat(dir, name, read_flags(), Mode::empty()) {
        Ok(fd) => File::from(fd),
        Err(Errno::ENOENT | Errno::ELOOP) => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    let stat = fstat(&file).map_err(errno_at(path))?;
    if Kind::of(&stat) != Kind::File
        || stat.st_nlink != 1
        || u64::try_from(stat.st_size).ok() != Some(content.len() as u64)
    {
        return Ok(None);
    }
    let mut existing = Vec::with_capacity(content.len());
    file.read_to_end(&mut existing).map_err(std_err(path))?;
    Ok((existing == content).then_some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::policy::GatewayPolicy;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const PREFIX: &str = "githook-protect-stage-";

    struct Fixture {
        _temp_root: tempfile::TempDir,
        _mount_root: tempfile::TempDir,
        stage: PathBuf,
        repo: PathBuf,
        policy: GatewayPolicy,
    }

    fn fixture() -> Fixture {
        let temp_root = tempfile::tempdir().unwrap();
        let mount_root = tempfile::tempdir().unwrap();
        let temp = fs::canonicalize(temp_root.path()).unwrap();
        let mount = fs::canonicalize(mount_root.path()).unwrap();
        let stage = temp.join(format!("{PREFIX}Q1w2E3r4T5y6"));
        fs::create_dir(&stage).unwrap();
        let repo = mount.join("course");
        fs::create_dir_all(repo.join(".git")).unwrap();
        Fixture {
            policy: GatewayPolicy::new(&temp, PREFIX, &mount),
            _temp_root: temp_root,
            _mount_root: mount_root,
            stage,
            repo,
        }
    }

    impl Fixture {
        fn op(&self, paths: &[&str]) -> SyncOperation {
            let paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
            self.policy
                .validate(
                    &self.stage,
                    &self.repo,
                    &paths,
                    nix::unistd::Uid::current().as_raw(),
                )
                .unwrap()
        }

        fn stage_file(&self, rel: &str, content: &str, mode: u32) {
            let path = self.stage.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }

        fn repo_file(&self, rel: &str, content: &str) {
            let path = self.repo.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn mode_of(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().mode() & 0o777
    }

    #[test]
    fn overwrites_edits_and_normalizes_modes() {
        let fx = fixture();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o600);
        fx.stage_file("tutorials/run.sh", "#!/bin/sh\n", 0o700);
        fx.repo_file("tutorials/readme.md", "v2\n");

        let stats = mirror(&fx.op(&["tutorials"]), None).unwrap();
        assert_eq!(
            fs::read_to_string(fx.repo.join("tutorials/readme.md")).unwrap(),
            "v1\n"
        );
        assert_eq!(mode_of(&fx.repo.join("tutorials/readme.md")), 0o644);
        assert_eq!(mode_of(&fx.repo.join("tutorials/run.sh")), 0o755);
        assert_eq!(mode_of(&fx.repo.join("tutorials")), 0o755);
        assert_eq!(stats.files_written, 2);
    }

    #[test]
    fn removes_extraneous_entries_but_not_git() {
        let fx = fixture();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        fx.repo_file("tutorials/extra.md", "planted\n");
        fx.repo_file("tutorials/sub/deep.md", "planted\n");
        fx.repo_file("tutorials/.git/HEAD", "keep\n");
        fx.repo_file("notes.md", "untouched\n");

        mirror(&fx.op(&["tutorials"]), None).unwrap();
        assert!(!fx.repo.join("tutorials/extra.md").exists());
        assert!(!fx.repo.join("tutorials/sub").exists());
        assert!(fx.repo.join("tutorials/.git/HEAD").exists());
        assert!(fx.repo.join("notes.md").exists());
    }

    #[test]
    fn path_absent_from_stage_is_removed() {
        let fx = fixture();
        fx.repo_file("scratch/file.md", "local\n");
        let stats = mirror(&fx.op(&["scratch"]), None).unwrap();
        assert!(!fx.repo.join("scratch").exists());
        assert_eq!(stats.removed, 1);
    }

    #[test]
    fn replaces_symlink_in_destination_without_following_it() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        fs::write(&victim, "do not touch\n").unwrap();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        fs::create_dir_all(fx.repo.join("tutorials")).unwrap();
        symlink(&victim, fx.repo.join("tutorials/readme.md")).unwrap();

        mirror(&fx.op(&["tutorials"]), None).unwrap();
        assert_eq!(fs::read_to_string(&victim).unwrap(), "do not touch\n");
        let meta = fs::symlink_metadata(fx.repo.join("tutorials/readme.md")).unwrap();
        assert!(meta.is_file());
    }

    #[test]
    fn symlinked_destination_directory_is_replaced() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("keep.md"), "outside\n").unwrap();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        symlink(outside.path(), fx.repo.join("tutorials")).unwrap();

        mirror(&fx.op(&["tutorials"]), None).unwrap();
        assert!(fs::symlink_metadata(fx.repo.join("tutorials")).unwrap().is_dir());
        assert!(outside.path().join("keep.md").exists());
        assert!(!outside.path().join("readme.md").exists());
    }

    #[test]
    fn intermediate_symlink_aborts() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        fx.stage_file("docs/guide/intro.md", "hi\n", 0o644);
        symlink(outside.path(), fx.repo.join("docs")).unwrap();

        let err = mirror(&fx.op(&["docs/guide"]), None).unwrap_err();
        assert!(matches!(err, SyncExecutionError::UnsafeParent(_)));
        assert_eq!(fs::read_dir(outside.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_parents_are_created() {
        let fx = fixture();
        fx.stage_file("docs/guide/intro.md", "hi\n", 0o644);
        let stats = mirror(&fx.op(&["docs/guide"]), None).unwrap();
        assert_eq!(
            fs::read_to_string(fx.repo.join("docs/guide/intro.md")).unwrap(),
            "hi\n"
        );
        assert_eq!(mode_of(&fx.repo.join("docs")), 0o755);
        assert_eq!(stats.dirs_created, 2);
    }

    #[test]
    fn only_in_tree_symlinks_are_recreated() {
        let fx = fixture();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        symlink("readme.md", fx.stage.join("tutorials/latest.md")).unwrap();
        symlink("../../etc/passwd", fx.stage.join("tutorials/escape")).unwrap();
        symlink("/etc/passwd", fx.stage.join("tutorials/absolute")).unwrap();

        let stats = mirror(&fx.op(&["tutorials"]), None).unwrap();
        assert_eq!(
            fs::read_link(fx.repo.join("tutorials/latest.md")).unwrap(),
            PathBuf::from("readme.md")
        );
        assert!(fs::symlink_metadata(fx.repo.join("tutorials/escape")).is_err());
        assert!(fs::symlink_metadata(fx.repo.join("tutorials/absolute")).is_err());
        assert_eq!(stats.symlinks_written, 1);
        assert_eq!(stats.symlinks_skipped, 2);
    }

    #[test]
    fn second_run_changes_nothing() {
        let fx = fixture();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        fx.stage_file("tutorials/part1/intro.md", "intro\n", 0o644);
        fx.repo_file("tutorials/readme.md", "v2\n");
        let op = fx.op(&["tutorials"]);

        mirror(&op, None).unwrap();
        let stats = mirror(&op, None).unwrap();
        assert_eq!(stats.files_written, 0);
        assert_eq!(stats.files_unchanged, 2);
        assert_eq!(stats.removed, 0);
        assert_eq!(
            fs::read_to_string(fx.repo.join("tutorials/readme.md")).unwrap(),
            "v1\n"
        );
    }

    #[test]
    fn safe_link_rules() {
        assert!(is_safe_link(Path::new("a/link"), Path::new("file")));
        assert!(is_safe_link(Path::new("a/b/link"), Path::new("../file")));
        assert!(!is_safe_link(Path::new("a/link"), Path::new("../../file")));
        assert!(!is_safe_link(Path::new("link"), Path::new("../file")));
        assert!(!is_safe_link(Path::new("a/link"), Path::new("/etc/passwd")));
    }

    #[test]
    fn destination_swapped_after_validation_is_refused() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        fs::create_dir(outside.path().join(".git")).unwrap();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        let op = fx.op(&["tutorials"]);

        fs::rename(&fx.repo, fx.repo.with_file_name("parked")).unwrap();
        symlink(outside.path(), &fx.repo).unwrap();
        let err = mirror(&op, None).unwrap_err();
        assert!(matches!(err, SyncExecutionError::UnsafeParent(_)));
        assert!(!outside.path().join("tutorials").exists());
    }

    #[test]
    fn destination_without_git_dir_is_refused() {
        let fx = fixture();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        let op = fx.op(&["tutorials"]);
        fs::remove_dir(fx.repo.join(".git")).unwrap();
        assert!(matches!(
            mirror(&op, None),
            Err(SyncExecutionError::NotWorktree(_))
        ));
        assert!(!fx.repo.join("tutorials").exists());
    }

    #[test]
    fn concurrent_symlink_swap_never_escapes_destination() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim");
        fs::create_dir(&victim).unwrap();
        fs::write(victim.join("keep.txt"), "keep\n").unwrap();
        fs::set_permissions(&victim, fs::Permissions::from_mode(0o700)).unwrap();
        fx.stage_file("tutorials/readme.md", "v1\n", 0o644);
        fx.stage_file("tutorials/part1/intro.md", "intro\n", 0o644);
        fx.repo_file("tutorials/readme.md", "edited\n");
        let op = fx.op(&["tutorials"]);

        let stop = Arc::new(AtomicBool::new(false));
        let swapper = {
            let stop = Arc::clone(&stop);
            let target = fx.repo.join("tutorials");
            let parked = fx.repo.join("parked");
            let victim = victim.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = fs::rename(&target, &parked);
                    let _ = symlink(&victim, &target);
                    std::thread::yield_now();
                    let _ = fs::remove_file(&target);
                    let _ = fs::rename(&parked, &target);
                }
            })
        };
        for _ in 0..300 {
            // Individual runs may fail when they lose the race.
            let _ = mirror(&op, None);
        }
        stop.store(true, Ordering::Relaxed);
        swapper.join().unwrap();

        let names: Vec<_> = fs::read_dir(&victim)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("keep.txt")]);
        assert_eq!(fs::read_to_string(victim.join("keep.txt")).unwrap(), "keep\n");
        assert_eq!(mode_of(&victim), 0o700);
    }
}
