//! Which actions a git hook firing should trigger.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported hook: {0}")]
pub struct UnknownHook(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PostCheckout,
    PostMerge,
    PostRewrite,
    PostApplypatch,
    PostCommit,
    PostReset,
}

impl HookKind {
    pub const ALL: [HookKind; 6] = [
        HookKind::PostCheckout,
        HookKind::PostMerge,
        HookKind::PostRewrite,
        HookKind::PostApplypatch,
        HookKind::PostCommit,
        HookKind::PostReset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HookKind::PostCheckout => "post-checkout",
            HookKind::PostMerge => "post-merge",
            HookKind::PostRewrite => "post-rewrite",
            HookKind::PostApplypatch => "post-applypatch",
            HookKind::PostCommit => "post-commit",
            HookKind::PostReset => "post-reset",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HookKind {
    type Err = UnknownHook;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Hooks are often installed as symlinks, so accept a path too.
        let name = s.rsplit('/').next().unwrap_or(s);
        HookKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| UnknownHook(s.to_string()))
    }
}

/// Actions to run for one hook firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookActions {
    pub sparse_checkout: bool,
    pub protect: bool,
}

/// A hook name plus the arguments git passed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInvocation {
    pub kind: HookKind,
    pub args: Vec<String>,
}

impl HookInvocation {
    pub fn new(kind: HookKind, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    pub fn parse(name: &str, args: Vec<String>) -> Result<Self, UnknownHook> {
        Ok(Self::new(name.parse()?, args))
    }

    /// post-checkout receives `<old-ref> <new-ref> <branch-flag>`; the flag
    /// is `1` for a branch checkout and `0` for a file checkout.
    fn is_branch_checkout(&self) -> bool {
        self.args.get(2).map(String::as_str) == Some("1")
    }

    pub fn actions(&self) -> HookActions {
        HookActions {
            sparse_checkout: self.kind == HookKind::PostCheckout && self.is_branch_checkout(),
            protect: true,
        }
    }
}
