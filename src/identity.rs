//! Who is the real, non-privileged user behind this process?
//!
//! Resolution is an explicit ordered chain so every caller agrees on the
//! answer, and every chain ends in the same superuser guard.

use nix::unistd::{Uid, User};
use thiserror::Error;

/// Variable set by sudo naming the invoking user.
pub const SUDO_USER_VAR: &str = "SUDO_USER";

const SUPERUSER: &str = "root";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("SUDO_USER is not set; cannot determine the original user")]
    MissingSudoUser,
    #[error("refusing to operate on behalf of the superuser")]
    Superuser,
    #[error("could not determine the current user")]
    Unresolved,
    #[error("no such user: {0}")]
    UnknownUser(String),
    #[error("user lookup for {name} failed: {reason}")]
    Lookup { name: String, reason: String },
}

/// A resolved system account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl Account {
    /// Look up an account by name in the system user database.
    pub fn lookup(name: &str) -> Result<Self, IdentityError> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(IdentityError::UnknownUser(name.to_string())),
            Err(errno) => Err(IdentityError::Lookup {
                name: name.to_string(),
                reason: errno.to_string(),
            }),
        }
    }

    fn by_uid(uid: u32) -> Option<Self> {
        User::from_uid(Uid::from_raw(uid)).ok().flatten().map(Into::into)
    }

    pub fn is_superuser(&self) -> bool {
        self.uid == 0 || self.name == SUPERUSER
    }
}

impl From<User> for Account {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }
    }
}

/// How strictly the real user must be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Privileged helper: the identity must come from `SUDO_USER`.
    SudoOnly,
    /// Unprivileged caller: walk the full fallback chain.
    Fallback,
}

/// Ordered identity sources, captured once at construction.
///
/// Chain: `SUDO_USER`, then the passwd entry of the real uid, then `USER`,
/// then `LOGNAME`.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    sudo_user: Option<String>,
    real_uid: Option<u32>,
    user: Option<String>,
    logname: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl IdentityResolver {
    /// Capture identity sources from the current process.
    pub fn from_env() -> Self {
        Self {
            sudo_user: non_empty(std::env::var(SUDO_USER_VAR).ok()),
            real_uid: Some(Uid::current().as_raw()),
            user: non_empty(std::env::var("USER").ok()),
            logname: non_empty(std::env::var("LOGNAME").ok()),
        }
    }

    pub fn with_sudo_user(mut self, name: impl Into<String>) -> Self {
        self.sudo_user = non_empty(Some(name.into()));
        self
    }

    pub fn with_real_uid(mut self, uid: u32) -> Self {
        self.real_uid = Some(uid);
        self
    }

    pub fn with_user(mut self, name: impl Into<String>) -> Self {
        self.user = non_empty(Some(name.into()));
        self
    }

    pub fn with_logname(mut self, name: impl Into<String>) -> Self {
        self.logname = non_empty(Some(name.into()));
        self
    }

    /// The name of the real user, without the superuser guard.
    fn candidate(&self, mode: Mode) -> Result<String, IdentityError> {
        if let Some(name) = &self.sudo_user {
            return Ok(name.clone());
        }
        if mode == Mode::SudoOnly {
            return Err(IdentityError::MissingSudoUser);
        }
        if let Some(account) = self.real_uid.and_then(Account::by_uid) {
            return Ok(account.name);
        }
        self.user
            .clone()
            .or_else(|| self.logname.clone())
            .ok_or(IdentityError::Unresolved)
    }

    /// Resolve the real user's name, rejecting the superuser.
    pub fn real_user_name(&self, mode: Mode) -> Result<String, IdentityError> {
        let name = self.candidate(mode)?;
        if name == SUPERUSER {
            return Err(IdentityError::Superuser);
        }
        Ok(name)
    }

    /// Resolve the real user to a full account, rejecting the superuser.
    pub fn real_user(&self, mode: Mode) -> Result<Account, IdentityError> {
        let account = Account::lookup(&self.real_user_name(mode)?)?;
        if account.is_superuser() {
            return Err(IdentityError::Superuser);
        }
        Ok(account)
    }
}
