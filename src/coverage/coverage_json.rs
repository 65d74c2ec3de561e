use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use super::{CoverageError, CoverageFormat, normalize_path};

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    meta: RawMeta,
    files: BTreeMap<String, RawFile>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMeta {
    #[serde(default)]
    show_contexts: bool,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    executed_lines: Vec<u32>,
    #[serde(default)]
    contexts: Option<BTreeMap<String, Vec<String>>>,
}

/// coverage.py JSON report. With `--show-contexts` every executed line
/// carries the tests that ran it; without, only aggregate hits exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageJsonReport {
    PerTest(BTreeMap<String, BTreeMap<u32, BTreeSet<String>>>),
    Aggregate(BTreeMap<String, BTreeSet<u32>>),
}

impl CoverageJsonReport {
    pub fn parse(raw: &str) -> Result<Self, CoverageError> {
        let report: RawReport = serde_json::from_str(raw)
            .map_err(|err| CoverageError::parse(CoverageFormat::CoverageJson, err.to_string()))?;

        let has_contexts = report.meta.show_contexts
            || report
                .files
                .values()
                .any(|file| file.contexts.as_ref().is_some_and(|c| !c.is_empty()));

        if !has_contexts {
            let files = report
                .files
                .into_iter()
                .map(|(path, file)| {
                    (
                        normalize_path(&path),
                        file.executed_lines
                            .into_iter()
                            .filter(|&n| n > 0)
                            .collect::<BTreeSet<u32>>(),
                    )
                })
                .filter(|(_, lines)| !lines.is_empty())
                .collect();
            return Ok(Self::Aggregate(files));
        }

        let mut files: BTreeMap<String, BTreeMap<u32, BTreeSet<String>>> = BTreeMap::new();
        for (path, file) in report.files {
            let path = normalize_path(&path);
            let Some(contexts) = file.contexts else {
                if !file.executed_lines.is_empty() {
                    tracing::warn!(file = %path, "executed lines without contexts cannot be attributed to tests");
                }
                continue;
            };
            for (line, labels) in contexts {
                let number = line.trim().parse::<u32>().map_err(|_| {
                    CoverageError::parse(
                        CoverageFormat::CoverageJson,
                        format!("context key `{line}` in {path} is not a line number"),
                    )
                })?;
                let tests = labels
                    .iter()
                    .filter_map(|label| test_from_context(label))
                    .collect::<BTreeSet<_>>();
                if tests.is_empty() || number == 0 {
                    continue;
                }
                files
                    .entry(path.clone())
                    .or_default()
                    .entry(number)
                    .or_default()
                    .extend(tests);
            }
        }
        Ok(Self::PerTest(files))
    }
}

/// `tests/test_x.py::test_y|run` → `tests/test_x.py::test_y`. The empty
/// context marks code executed outside any test.
fn test_from_context(label: &str) -> Option<String> {
    let test = match label.rsplit_once('|') {
        Some((test, phase)) if matches!(phase, "run" | "setup" | "teardown") => test,
        _ => label,
    };
    let test = test.trim();
    if test.is_empty() {
        None
    } else {
        Some(test.to_string())
    }
}
