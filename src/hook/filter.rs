use std::path::{Component, Path};

use crate::coverage::normalize_path;

/// Path fragments that never get motivation lookups: tests, motive's own
/// state, lockfiles. Matched against `/` + the workspace-relative path.
const SKIPPED_FRAGMENTS: &[&str] = &[
    "/tests/",
    "/test/",
    "/test_",
    "_test.",
    "_tests.",
    ".test.",
    ".spec.",
    "conftest.py",
    "catalog.json",
    "index.json",
    "edit-log.json",
    "session-seen.json",
    ".lock",
    "-lock.json",
    "-lock.yaml",
    "go.sum",
];

/// Fixed skip list plus user-configured glob excludes.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    excludes: Vec<glob::Pattern>,
}

impl PathFilter {
    pub fn new(patterns: &[String]) -> Result<Self, glob::PatternError> {
        let excludes = patterns
            .iter()
            .map(|pattern| pattern.trim())
            .filter(|pattern| !pattern.is_empty())
            .map(glob::Pattern::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { excludes })
    }

    pub fn is_skipped(&self, relative: &str) -> bool {
        let relative = normalize_path(relative);
        let rooted = format!("/{relative}");
        if SKIPPED_FRAGMENTS
            .iter()
            .any(|fragment| rooted.contains(fragment))
        {
            return true;
        }
        if is_dotfile(Path::new(&relative)) {
            return true;
        }
        self.excludes
            .iter()
            .any(|pattern| pattern.matches(&relative))
    }
}

fn is_dotfile(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}
