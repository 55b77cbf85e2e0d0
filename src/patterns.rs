//! Regex pattern sets and the working-tree walk that matches them.
//!
//! Patterns are matched against repository-relative, slash-separated paths and
//! are *not* anchored for the caller: `^tutorials$` matches only the top-level
//! `tutorials` entry, `tutorials` matches any path containing that text.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

/// An uncompilable pattern; the whole set is rejected.
#[derive(Debug, Error)]
#[error("invalid regex pattern '{pattern}': {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Errors from walking the working tree.
#[derive(Debug, Error)]
pub enum FindError {
    #[error("failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Ordered, deduplicated regex sources with their compiled forms.
///
/// Compilation happens eagerly on every mutation, so `compiled` always
/// mirrors `sources`.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    sources: Vec<String>,
    compiled: Vec<Regex>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `patterns` into a new set. Empty strings are ignored.
    pub fn compile<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        set.add(patterns)?;
        Ok(set)
    }

    /// Parse a newline-separated list; lines are trimmed and blank lines dropped.
    pub fn from_newline_separated(patterns: &str) -> Result<Self, PatternError> {
        Self::compile(parse_newline_separated(patterns))
    }

    /// Add patterns, skipping duplicates and empty strings.
    ///
    /// Either every new pattern compiles and is added, or the set is unchanged.
    pub fn add<I, S>(&mut self, patterns: I) -> Result<(), PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut new_sources: Vec<String> = Vec::new();
        let mut new_compiled = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty()
                || self.sources.iter().any(|p| p == pattern)
                || new_sources.iter().any(|p| p == pattern)
            {
                continue;
            }
            let regex = Regex::new(pattern).map_err(|source| PatternError {
                pattern: pattern.to_string(),
                source,
            })?;
            new_sources.push(pattern.to_string());
            new_compiled.push(regex);
        }
        self.sources.extend(new_sources);
        self.compiled.extend(new_compiled);
        Ok(())
    }

    pub fn patterns(&self) -> &[String] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True if any pattern matches the slash-normalized relative path.
    pub fn is_match(&self, relative: &str) -> bool {
        self.compiled.iter().any(|re| re.is_match(relative))
    }
}

fn parse_newline_separated(patterns: &str) -> Vec<String> {
    patterns
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// A filesystem entry that matched a [`PatternSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPath {
    /// Absolute path on disk.
    pub absolute: PathBuf,
    /// Root-relative path with `/` separators.
    pub relative: String,
}

/// Result of one matching pass, sorted by absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedPaths {
    paths: Vec<MatchedPath>,
}

impl MatchedPaths {
    pub fn new(mut paths: Vec<MatchedPath>) -> Self {
        paths.sort_by(|a, b| a.absolute.cmp(&b.absolute));
        paths.dedup_by(|a, b| a.absolute == b.absolute);
        Self { paths }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchedPath> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn relative_paths(&self) -> Vec<String> {
        self.paths.iter().map(|p| p.relative.clone()).collect()
    }

    /// Drop every path that lies inside another matched path.
    pub fn outermost(&self) -> Self {
        let mut kept: Vec<MatchedPath> = Vec::new();
        for path in &self.paths {
            let nested = kept
                .iter()
                .any(|outer| Path::new(&path.relative).starts_with(&outer.relative));
            if !nested {
                kept.push(path.clone());
            }
        }
        Self { paths: kept }
    }
}

/// Which kinds of entries [`find`] reports.
#[derive(Debug, Clone, Copy)]
pub struct FindOptions {
    pub include_files: bool,
    pub include_dirs: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            include_files: true,
            include_dirs: true,
        }
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Walk `root` once and collect every entry matching `patterns`.
///
/// Dot-prefixed entries below the root are pruned entirely, directories
/// included. Symlinks are reported as files and never followed. Entries
/// whose relative path is not UTF-8 cannot be matched and are skipped, but
/// the walk still descends into them.
pub fn find(
    root: &Path,
    patterns: &PatternSet,
    options: FindOptions,
) -> Result<MatchedPaths, FindError> {
    let FindOptions {
        mut include_files,
        mut include_dirs,
    } = options;
    if !include_files && !include_dirs {
        include_files = true;
        include_dirs = true;
    }

    let mut matched = Vec::new();
    let mut checked = 0usize;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker {
        let entry = entry.map_err(|source| FindError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        let is_dir = entry.file_type().is_dir();
        if (is_dir && !include_dirs) || (!is_dir && !include_files) {
            continue;
        }
        checked += 1;

        let Some(relative) = entry
            .path()
            .strip_prefix(root)
            .ok()
            .and_then(Path::to_str)
        else {
            log::warn!("skipping {}: not valid UTF-8", entry.path().display());
            continue;
        };
        let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");

        if patterns.is_match(&relative) {
            matched.push(MatchedPath {
                absolute: entry.path().to_path_buf(),
                relative,
            });
        }
    }

    let matched = MatchedPaths::new(matched);
    log::debug!(
        "matched {} of {} checked paths under {}",
        matched.len(),
        checked,
        root.display()
    );
    Ok(matched)
}
