//! Pattern lists declared in GitHub workflow files.
//!
//! Workflows carry two newline-separated inputs, usually under a step's
//! `with:` block:
//!
//! ```yaml
//! with:
//!   assignment-regex: |
//!     ^assignments/a[0-9]+$
//!   protected-paths-regex: |
//!     ^tutorials$
//! ```
//!
//! Keys are found at any depth, and values from every workflow file are
//! merged. Each list compiles on its own, so a bad pattern in one never
//! disables the action driven by the other.

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;

use crate::patterns::{PatternError, PatternSet};

pub const ASSIGNMENT_KEY: &str = "assignment-regex";
pub const PROTECTED_PATHS_KEY: &str = "protected-paths-regex";

const WORKFLOWS_DIR: &str = ".github/workflows";

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The two pattern lists driving a hook run.
#[derive(Debug)]
pub struct WorkflowPatterns {
    pub assignment: Result<PatternSet, PatternError>,
    pub protected: Result<PatternSet, PatternError>,
}

pub trait WorkflowConfigLoader {
    fn load(&self) -> Result<WorkflowPatterns, WorkflowError>;
}

/// Reads `<repo>/.github/workflows/*.yml` and `*.yaml`.
#[derive(Debug, Clone)]
pub struct WorkflowDirectory {
    dir: PathBuf,
}

impl WorkflowDirectory {
    pub fn new(repository_root: &Path) -> Self {
        Self {
            dir: repository_root.join(WORKFLOWS_DIR),
        }
    }

    fn workflow_files(&self) -> Result<Vec<PathBuf>, WorkflowError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(WorkflowError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| WorkflowError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml" | "yaml")
            );
            if is_yaml && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl WorkflowConfigLoader for WorkflowDirectory {
    fn load(&self) -> Result<WorkflowPatterns, WorkflowError> {
        let mut assignment = Vec::new();
        let mut protected = Vec::new();
        for path in self.workflow_files()? {
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let doc: Value = match serde_yaml::from_str(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    log::warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            collect(&doc, ASSIGNMENT_KEY, &mut assignment);
            collect(&doc, PROTECTED_PATHS_KEY, &mut protected);
        }
        let patterns = WorkflowPatterns {
            assignment: PatternSet::from_newline_separated(&assignment.join("\n")),
            protected: PatternSet::from_newline_separated(&protected.join("\n")),
        };
        log::debug!(
            "workflow patterns: assignment {:?}, protected {:?}",
            patterns.assignment.as_ref().map(PatternSet::len),
            patterns.protected.as_ref().map(PatternSet::len)
        );
        Ok(patterns)
    }
}

/// Push every string stored under `key`, at any depth.
fn collect(value: &Value, key: &str, out: &mut Vec<String>) {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                match (k.as_str(), v) {
                    (Some(k), Value::String(s)) if k == key => out.push(s.clone()),
                    _ => collect(v, key, out),
                }
            }
        }
        Value::Sequence(items) => items.iter().for_each(|v| collect(v, key, out)),
        Value::Tagged(tagged) => collect(&tagged.value, key, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
name: Assignment
on: [push]
jobs:
  setup:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: majikmate/assignment-pull-request@v1
        with:
          assignment-regex: |
            ^assignments/a[0-9]+$
          protected-paths-regex: |
            ^\.github$
            ^tutorials$
"#;

    fn workflows(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join(WORKFLOWS_DIR);
        std::fs::create_dir_all(&workflows).unwrap();
        for (name, body) in files {
            std::fs::write(workflows.join(name), body).unwrap();
        }
        dir
    }

    #[test]
    fn reads_nested_pattern_lists() {
        let dir = workflows(&[("assignment.yml", WORKFLOW)]);
        let patterns = WorkflowDirectory::new(dir.path()).load().unwrap();
        assert_eq!(
            patterns.assignment.unwrap().patterns(),
            &[r"^assignments/a[0-9]+$".to_string()]
        );
        assert_eq!(
            patterns.protected.unwrap().patterns(),
            &[r"^\.github$".to_string(), "^tutorials$".to_string()]
        );
    }

    #[test]
    fn merges_files_and_deduplicates() {
        let second = "jobs:\n  x:\n    with:\n      protected-paths-regex: \"^tutorials$\\n^rubric$\"\n";
        let dir = workflows(&[
            ("a.yml", WORKFLOW),
            ("b.yaml", second),
            ("notes.txt", "protected-paths-regex: ^ignored$"),
        ]);
        let patterns = WorkflowDirectory::new(dir.path()).load().unwrap();
        assert_eq!(
            patterns.protected.unwrap().patterns(),
            &[
                r"^\.github$".to_string(),
                "^tutorials$".to_string(),
                "^rubric$".to_string()
            ]
        );
    }

    #[test]
    fn broken_yaml_is_skipped() {
        let dir = workflows(&[("a.yml", "jobs: [unclosed"), ("b.yml", WORKFLOW)]);
        let patterns = WorkflowDirectory::new(dir.path()).load().unwrap();
        assert_eq!(patterns.protected.unwrap().len(), 2);
    }

    #[test]
    fn missing_directory_yields_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = WorkflowDirectory::new(dir.path()).load().unwrap();
        assert!(patterns.assignment.unwrap().is_empty());
        assert!(patterns.protected.unwrap().is_empty());
    }

    #[test]
    fn invalid_regex_fails_only_its_own_list() {
        let body = "with:\n  assignment-regex: \"(unclosed\"\n  protected-paths-regex: \"^tutorials$\"\n";
        let dir = workflows(&[("a.yml", body)]);
        let patterns = WorkflowDirectory::new(dir.path()).load().unwrap();
        assert_eq!(patterns.assignment.unwrap_err().pattern, "(unclosed");
        assert_eq!(
            patterns.protected.unwrap().patterns(),
            &["^tutorials$".to_string()]
        );

        let body = "with:\n  assignment-regex: \"^assignments$\"\n  protected-paths-regex: \"[bad\"\n";
        let dir = workflows(&[("a.yml", body)]);
        let patterns = WorkflowDirectory::new(dir.path()).load().unwrap();
        assert!(patterns.protected.is_err());
        assert_eq!(patterns.assignment.unwrap().len(), 1);
    }
}
