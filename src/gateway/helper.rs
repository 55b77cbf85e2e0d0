//! Privileged side of the boundary, as run by `githook-sync`.
//!
//! The caller's validation counts for nothing here: the real user comes
//! from `SUDO_USER` only, policy from the trusted configuration only, and
//! the request is validated again before [`mirror`] runs.

use std::path::PathBuf;

use thiserror::Error;

use super::{MirrorStats, SyncExecutionError, ValidationError, mirror};
use crate::config::ProtectConfig;
use crate::identity::{Account, IdentityError, IdentityResolver, Mode};

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("protection user {0} must not be the superuser")]
    SuperuserOwner(String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("sync request rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("sync failed: {0}")]
    Execution(#[from] SyncExecutionError),
}

/// A request as received on the helper's command line.
#[derive(Debug, Clone)]
pub struct HelperRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub paths: Vec<String>,
}

/// Serve `request`, mirroring as `owner`.
///
/// `config` must come from [`ProtectConfig::load_trusted`].
pub fn serve(
    request: &HelperRequest,
    resolver: &IdentityResolver,
    config: &ProtectConfig,
    owner: &Account,
) -> Result<MirrorStats, HelperError> {
    if owner.is_superuser() {
        return Err(HelperError::SuperuserOwner(owner.name.clone()));
    }
    let real_user = resolver.real_user(Mode::SudoOnly)?;
    serve_as(request, &real_user, config, owner)
}

fn serve_as(
    request: &HelperRequest,
    real_user: &Account,
    config: &ProtectConfig,
    owner: &Account,
) -> Result<MirrorStats, HelperError> {
    let op = config.gateway_policy().validate(
        &request.source,
        &request.destination,
        &request.paths,
        real_user.uid,
    )?;
    log::info!(
        "syncing {} path(s) into {} for {}",
        op.paths().len(),
        op.destination().display(),
        real_user.name
    );
    Ok(mirror(&op, Some(owner))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Gid, Uid};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    const PREFIX: &str = "githook-protect-stage-";

    struct Fixture {
        _temp_root: tempfile::TempDir,
        _mount_root: tempfile::TempDir,
        temp: PathBuf,
        mount: PathBuf,
        request: HelperRequest,
    }

    fn fixture() -> Fixture {
        let temp_root = tempfile::tempdir().unwrap();
        let mount_root = tempfile::tempdir().unwrap();
        let temp = fs::canonicalize(temp_root.path()).unwrap();
        let mount = fs::canonicalize(mount_root.path()).unwrap();
        let stage = temp.join(format!("{PREFIX}Hq7Lm2Np4Rs9"));
        fs::create_dir_all(stage.join("tutorials")).unwrap();
        fs::write(stage.join("tutorials/readme.md"), "v1\n").unwrap();
        let repo = mount.join("course");
        fs::create_dir_all(repo.join(".git")).unwrap();
        Fixture {
            request: HelperRequest {
                source: stage,
                destination: repo,
                paths: vec!["tutorials".to_string()],
            },
            _temp_root: temp_root,
            _mount_root: mount_root,
            temp,
            mount,
        }
    }

    /// The invoking account, under any name.
    fn caller() -> Account {
        Account {
            name: "student".to_string(),
            uid: Uid::current().as_raw(),
            gid: Gid::current().as_raw(),
        }
    }

    fn protection() -> Account {
        Account {
            name: "githook-protect".to_string(),
            ..caller()
        }
    }

    fn user_config(fx: &Fixture) -> ProtectConfig {
        ProtectConfig {
            temp_root: fx.temp.clone(),
            mount_root: fx.mount.clone(),
            ..ProtectConfig::default()
        }
    }

    #[test]
    fn superuser_owner_is_refused() {
        let fx = fixture();
        let root = Account {
            name: "root".to_string(),
            uid: 0,
            gid: 0,
        };
        let resolver = IdentityResolver::default().with_sudo_user("student");
        assert!(matches!(
            serve(&fx.request, &resolver, &user_config(&fx), &root),
            Err(HelperError::SuperuserOwner(_))
        ));
        assert!(!fx.request.destination.join("tutorials").exists());
    }

    #[test]
    fn identity_comes_only_from_sudo_user() {
        let fx = fixture();
        let owner = Account {
            name: "githook-protect".to_string(),
            uid: 4242,
            gid: 4242,
        };
        let resolver = IdentityResolver::default()
            .with_user("student")
            .with_logname("student");
        assert!(matches!(
            serve(&fx.request, &resolver, &user_config(&fx), &owner),
            Err(HelperError::Identity(IdentityError::MissingSudoUser))
        ));
        assert!(!fx.request.destination.join("tutorials").exists());
    }

    #[test]
    fn untrusted_config_cannot_widen_policy() {
        let fx = fixture();
        let written = fx.temp.join("githook-protect.json");
        fs::write(&written, serde_json::to_string(&user_config(&fx)).unwrap()).unwrap();
        fs::set_permissions(&written, fs::Permissions::from_mode(0o666)).unwrap();

        // The unprivileged side would accept the request under this file.
        let unprivileged = ProtectConfig::load_from(&written).unwrap();
        let req = &fx.request;
        unprivileged
            .gateway_policy()
            .validate(&req.source, &req.destination, &req.paths, caller().uid)
            .unwrap();

        let trusted = ProtectConfig::load_trusted_from(&written, caller().uid).unwrap();
        assert_eq!(trusted, ProtectConfig::default());
        assert!(matches!(
            serve_as(req, &caller(), &trusted, &protection()),
            Err(HelperError::Validation(_))
        ));
        assert!(!req.destination.join("tutorials").exists());
    }

    #[test]
    fn trusted_policy_mirrors_as_owner() {
        let fx = fixture();
        let stats = serve_as(&fx.request, &caller(), &user_config(&fx), &protection()).unwrap();
        assert_eq!(stats.files_written, 1);
        assert_eq!(
            fs::read_to_string(fx.request.destination.join("tutorials/readme.md")).unwrap(),
            "v1\n"
        );
    }

    #[test]
    fn request_outside_trusted_mount_root_is_rejected() {
        let fx = fixture();
        let narrowed = ProtectConfig {
            mount_root: fx.mount.join("elsewhere"),
            ..user_config(&fx)
        };
        let err = serve_as(&fx.request, &caller(), &narrowed, &protection()).unwrap_err();
        assert!(matches!(
            err,
            HelperError::Validation(ValidationError::OutsideMountRoot { .. })
        ));
        assert!(!fx.request.destination.join("tutorials").exists());
    }
}
