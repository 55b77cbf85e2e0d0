//! Runtime configuration.
//!
//! Every field has a compiled-in default, so a missing file is never an
//! error. The privileged helper only ever reads [`SYSTEM_CONFIG_PATH`], and
//! only when that file is root-owned and not writable by group or others.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayPolicy;

/// System-wide configuration file, installed next to the hook binaries.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/git/hooks/githook-protect.json";

/// Environment variable that points the unprivileged hook at another file.
pub const CONFIG_ENV_VAR: &str = "GITHOOK_PROTECT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How the unprivileged side crosses into the protection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Elevation {
    /// Run the installed helper through `sudo -n`.
    Sudo,
    /// Mirror in-process; only useful when the hook already runs privileged.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectConfig {
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub temp_root: PathBuf,
    pub stage_prefix: String,
    pub mount_root: PathBuf,
    pub protection_user: String,
    pub helper_path: PathBuf,
    pub sudo_path: PathBuf,
    pub elevation: Elevation,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            lock_poll_interval_ms: 100,
            temp_root: PathBuf::from("/tmp"),
            stage_prefix: "githook-protect-stage-".to_string(),
            mount_root: PathBuf::from("/workspaces"),
            protection_user: "githook-protect".to_string(),
            helper_path: PathBuf::from("/etc/git/hooks/githook-sync"),
            sudo_path: PathBuf::from("sudo"),
            elevation: Elevation::Sudo,
        }
    }
}

impl ProtectConfig {
    /// Path the unprivileged hook reads its configuration from.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH))
    }

    /// Load the unprivileged hook's configuration.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the configuration the privileged helper is allowed to trust.
    pub fn load_trusted() -> Result<Self, ConfigError> {
        Self::load_trusted_from(Path::new(SYSTEM_CONFIG_PATH), 0)
    }

    /// Load `path` only if it is owned by `owner` and not group/world
    /// writable; otherwise ignore it and use defaults.
    pub fn load_trusted_from(path: &Path, owner: u32) -> Result<Self, ConfigError> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if !meta.file_type().is_file() {
            log::warn!("ignoring {}: not a regular file", path.display());
            return Ok(Self::default());
        }
        if meta.uid() != owner || meta.mode() & 0o022 != 0 {
            log::warn!(
                "ignoring {}: must be owned by uid {} and not group/world writable",
                path.display(),
                owner
            );
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.max(1))
    }

    /// Validation rules both sides of the privilege boundary apply.
    pub fn gateway_policy(&self) -> GatewayPolicy {
        GatewayPolicy::new(&self.temp_root, &self.stage_prefix, &self.mount_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_config(dir: &Path, body: &str, mode: u32) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn current_uid() -> u32 {
        nix::unistd::Uid::current().as_raw()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtectConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ProtectConfig::default());
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.lock_poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"mount_root": "/srv/repos", "elevation": "direct"}"#,
            0o644,
        );
        let config = ProtectConfig::load_from(&path).unwrap();
        assert_eq!(config.mount_root, PathBuf::from("/srv/repos"));
        assert_eq!(config.elevation, Elevation::Direct);
        assert_eq!(config.stage_prefix, "githook-protect-stage-");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{not json", 0o644);
        assert!(matches!(
            ProtectConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn trusted_load_accepts_owner_controlled_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"protection_user": "keeper"}"#, 0o644);
        let config = ProtectConfig::load_trusted_from(&path, current_uid()).unwrap();
        assert_eq!(config.protection_user, "keeper");
    }

    #[test]
    fn trusted_load_ignores_writable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"mount_root": "/"}"#, 0o666);
        let config = ProtectConfig::load_trusted_from(&path, current_uid()).unwrap();
        assert_eq!(config.mount_root, PathBuf::from("/workspaces"));
    }

    #[test]
    fn trusted_load_ignores_foreign_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"mount_root": "/"}"#, 0o644);
        let config = ProtectConfig::load_trusted_from(&path, current_uid() + 1).unwrap();
        assert_eq!(config, ProtectConfig::default());
    }

    #[test]
    fn gateway_policy_follows_config() {
        let config = ProtectConfig {
            temp_root: PathBuf::from("/var/tmp"),
            ..ProtectConfig::default()
        };
        let policy = config.gateway_policy();
        assert_eq!(policy.temp_root(), Path::new("/var/tmp"));
        assert_eq!(policy.mount_root(), Path::new("/workspaces"));
    }
}
