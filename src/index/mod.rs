pub mod rebuild;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, Status};
use crate::coverage::affinity::test_targets_file;
use crate::coverage::{Attribution, LineCoverage, NormalizedCoverage, TestOutcome, normalize_path};
use crate::store::{self, StoreError};

/// Persisted line → facet mapping built from coverage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotivationIndex {
    pub forward: BTreeMap<String, BTreeMap<u32, Vec<String>>>,
    pub located_in: BTreeMap<String, String>,
    #[serde(default)]
    pub file_map: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub test_map: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub attribution: Attribution,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no motivation index at {0}; run `motive rebuild` first")]
    Missing(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IndexError {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }
}

/// Counts produced by [`update_facet_statuses`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub passing: usize,
    pub failing: usize,
    pub unlinked: usize,
    /// Linked facets whose test was absent from the report; they keep their
    /// previous status.
    pub not_reported: Vec<String>,
}

/// Applies test outcomes to linked facets.
///
/// A test missing from `outcomes` leaves its facet at its last known status,
/// so a facet that was never observed stays `untested`.
pub fn update_facet_statuses(
    catalog: &mut Catalog,
    outcomes: &BTreeMap<String, TestOutcome>,
) -> StatusUpdate {
    let mut update = StatusUpdate::default();
    let assignments = catalog
        .facets()
        .map(|facet| (facet.id.clone(), facet.test.clone()))
        .collect::<Vec<_>>();

    for (facet_id, test) in assignments {
        let status = match test.as_deref() {
            None => {
                update.unlinked += 1;
                Status::Untested
            }
            Some(test) => match outcomes.get(test) {
                Some(TestOutcome::Pass) => {
                    update.passing += 1;
                    Status::Passing
                }
                Some(TestOutcome::Fail) => {
                    update.failing += 1;
                    Status::Failing
                }
                None => {
                    update.not_reported.push(facet_id);
                    continue;
                }
            },
        };
        if let Err(err) = catalog.set_facet_status(&facet_id, status) {
            tracing::warn!(facet = %facet_id, error = %err, "failed to update facet status");
        }
    }
    update
}

/// Joins coverage with the catalog's facet → test links.
pub fn build_index(catalog: &Catalog, coverage: &NormalizedCoverage) -> MotivationIndex {
    let mut facets_by_test: HashMap<&str, Vec<&str>> = HashMap::new();
    for facet in catalog.facets() {
        if let Some(test) = facet.test.as_deref() {
            facets_by_test.entry(test).or_default().push(facet.id.as_str());
        }
    }

    let mut forward: BTreeMap<String, BTreeMap<u32, BTreeSet<String>>> = BTreeMap::new();
    match &coverage.lines {
        LineCoverage::None => {}
        LineCoverage::PerTest(files) => {
            for (file, lines) in files {
                for (line, tests) in lines {
                    for test in tests {
                        let Some(facets) = facets_by_test.get(test.as_str()) else {
                            continue;
                        };
                        forward
                            .entry(file.clone())
                            .or_default()
                            .entry(*line)
                            .or_default()
                            .extend(facets.iter().map(|id| id.to_string()));
                    }
                }
            }
        }
        LineCoverage::Aggregate(files) => {
            for (test, facets) in &facets_by_test {
                for (file, lines) in files {
                    if !test_targets_file(test, file) {
                        continue;
                    }
                    let by_line = forward.entry(file.clone()).or_default();
                    for line in lines {
                        by_line
                            .entry(*line)
                            .or_default()
                            .extend(facets.iter().map(|id| id.to_string()));
                    }
                }
            }
        }
    }

    let mut located: BTreeMap<String, (u32, String)> = BTreeMap::new();
    let mut file_map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (file, lines) in &forward {
        for (line, facets) in lines {
            for facet in facets {
                file_map
                    .entry(file.clone())
                    .or_default()
                    .insert(facet.clone());
                let candidate = (*line, file.clone());
                located
                    .entry(facet.clone())
                    .and_modify(|best| {
                        if candidate < *best {
                            *best = candidate.clone();
                        }
                    })
                    .or_insert_with(|| candidate.clone());
            }
        }
    }

    let mut test_map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (test, facets) in &facets_by_test {
        test_map
            .entry(test_file(test))
            .or_default()
            .extend(facets.iter().map(|id| id.to_string()));
    }

    MotivationIndex {
        forward: forward
            .into_iter()
            .map(|(file, lines)| {
                let lines = lines
                    .into_iter()
                    .map(|(line, facets)| (line, facets.into_iter().collect()))
                    .collect();
                (file, lines)
            })
            .collect(),
        located_in: located
            .into_iter()
            .map(|(facet, (line, file))| (facet, format!("{file}:{line}")))
            .collect(),
        file_map: into_sorted_lists(file_map),
        test_map: into_sorted_lists(test_map),
        attribution: coverage.attribution(),
    }
}

fn into_sorted_lists(map: BTreeMap<String, BTreeSet<String>>) -> BTreeMap<String, Vec<String>> {
    map.into_iter()
        .map(|(key, ids)| (key, ids.into_iter().collect()))
        .collect()
}

fn test_file(test_id: &str) -> String {
    let module = test_id.split_once("::").map_or(test_id, |(module, _)| module);
    normalize_path(module)
}

impl MotivationIndex {
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        store::load_json(path)?.ok_or_else(|| IndexError::Missing(path.to_path_buf()))
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        store::save_json(path, self)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Maps a path as the agent sees it (often absolute) onto an index key.
    ///
    /// A relative path, or one under `root`, is workspace-relative: it only
    /// matches a key equal to it or a key that is one of its suffixes. A key
    /// that extends the path (`cli.py` vs `taskboard/cli.py`) is a different
    /// file unless the path is absolute outside `root` or the key itself is
    /// absolute.
    pub fn resolve_file(&self, path: &str, root: Option<&Path>) -> Option<&str> {
        let mut candidate = normalize_path(path);
        if let Some(root) = root {
            let root = normalize_path(&root.to_string_lossy());
            let root = root.trim_end_matches('/');
            if !root.is_empty() {
                if let Some(rest) = candidate.strip_prefix(&format!("{root}/")) {
                    candidate = rest.to_string();
                }
            }
        }
        if let Some((key, _)) = self.forward.get_key_value(candidate.as_str()) {
            return Some(key.as_str());
        }

        let rooted = !candidate.starts_with('/');
        self.forward
            .keys()
            .filter(|key| {
                candidate.ends_with(&format!("/{key}"))
                    || ((!rooted || key.starts_with('/'))
                        && key.ends_with(&format!("/{candidate}")))
            })
            .max_by_key(|key| key.len())
            .map(String::as_str)
    }

    /// Facets on lines within `range` (inclusive), each with its matching
    /// lines in ascending order.
    pub fn facets_in(&self, file: &str, range: Option<(u32, u32)>) -> BTreeMap<String, Vec<u32>> {
        let mut out: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        let Some(lines) = self.forward.get(file) else {
            return out;
        };
        let selected: Box<dyn Iterator<Item = (&u32, &Vec<String>)>> = match range {
            Some((start, end)) => Box::new(lines.range(start..=end.max(start))),
            None => Box::new(lines.iter()),
        };
        for (line, facets) in selected {
            for facet in facets {
                out.entry(facet.clone()).or_default().push(*line);
            }
        }
        out
    }

    /// Every line of `file` a facet covers.
    pub fn facet_lines(&self, file: &str, facet: &str) -> Vec<u32> {
        self.forward
            .get(file)
            .map(|lines| {
                lines
                    .iter()
                    .filter(|(_, facets)| facets.iter().any(|id| id == facet))
                    .map(|(line, _)| *line)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// file → lines for one facet.
    pub fn locations_of(&self, facet: &str) -> BTreeMap<String, Vec<u32>> {
        let mut out = BTreeMap::new();
        for file in self.forward.keys() {
            let lines = self.facet_lines(file, facet);
            if !lines.is_empty() {
                out.insert(file.clone(), lines);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::{facet, sample_catalog};
    use crate::catalog::{Catalog, NodeKind};
    use crate::coverage::{CoverageFormat, parse};

    fn per_test(entries: &[(&str, u32, &[&str])]) -> NormalizedCoverage {
        let mut files: BTreeMap<String, BTreeMap<u32, BTreeSet<String>>> = BTreeMap::new();
        for (file, line, tests) in entries {
            files
                .entry(file.to_string())
                .or_default()
                .entry(*line)
                .or_default()
                .extend(tests.iter().map(|t| t.to_string()));
        }
        NormalizedCoverage {
            lines: LineCoverage::PerTest(files),
            outcomes: BTreeMap::new(),
        }
    }

    #[test]
    fn per_test_coverage_maps_lines_to_linked_facets() {
        let catalog = sample_catalog();
        let coverage = per_test(&[
            ("cli.py", 42, &["t1"]),
            ("cli.py", 7, &["t1", "t2"]),
            ("store.py", 3, &["t2", "unlinked"]),
        ]);
        let index = build_index(&catalog, &coverage);

        assert_eq!(index.forward["cli.py"][&42], vec!["f-001".to_string()]);
        assert_eq!(
            index.forward["cli.py"][&7],
            vec!["f-001".to_string(), "f-002".to_string()]
        );
        assert_eq!(index.located_in["f-001"], "cli.py:7");
        assert_eq!(index.located_in["f-002"], "store.py:3");
        assert_eq!(index.file_map["cli.py"], vec!["f-001", "f-002"]);
        assert_eq!(index.test_map["t1"], vec!["f-001"]);
        assert_eq!(index.attribution, Attribution::PerTest);
    }

    #[test]
    fn located_in_breaks_line_ties_by_path() {
        let catalog = sample_catalog();
        let coverage = per_test(&[("z.py", 5, &["t1"]), ("a.py", 5, &["t1"]), ("m.py", 9, &["t1"])]);
        let index = build_index(&catalog, &coverage);
        assert_eq!(index.located_in["f-001"], "a.py:5");
    }

    #[test]
    fn aggregate_coverage_spreads_hits_over_file_level_tests() {
        let catalog = Catalog::from_nodes(vec![
            crate::catalog::tests::node("g-001", NodeKind::Goal, None),
            crate::catalog::tests::node("e-001", NodeKind::Expectation, Some("g-001")),
            facet("f-001", "e-001", "tests/test_store.py::test_add", Status::Untested),
            facet("f-002", "e-001", "tests/test_store.py::test_remove", Status::Untested),
            facet("f-003", "e-001", "tests/test_cli.py::test_help", Status::Untested),
        ])
        .expect("catalog");
        let coverage = parse(
            r#"<coverage><packages><package><classes>
                <class filename="store.py"><lines><line number="10" hits="1"/></lines></class>
            </classes></package></packages></coverage>"#,
            CoverageFormat::Cobertura,
        )
        .expect("cobertura");

        let index = build_index(&catalog, &coverage);
        assert_eq!(index.attribution, Attribution::Aggregate);
        assert_eq!(
            index.forward["store.py"][&10],
            vec!["f-001".to_string(), "f-002".to_string()]
        );
        assert!(!index.located_in.contains_key("f-003"));
        assert_eq!(
            index.test_map["tests/test_store.py"],
            vec!["f-001".to_string(), "f-002".to_string()]
        );
    }

    #[test]
    fn rebuilding_from_same_inputs_is_byte_identical() {
        let catalog = sample_catalog();
        let coverage = per_test(&[("cli.py", 42, &["t1"]), ("store.py", 1, &["t2", "t1"])]);
        let first = serde_json::to_vec(&build_index(&catalog, &coverage)).expect("first");
        let second = serde_json::to_vec(&build_index(&catalog, &coverage)).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn outcomes_update_linked_facets_and_absent_tests_keep_status() {
        let mut catalog = sample_catalog();
        let mut outcomes = BTreeMap::new();
        outcomes.insert("t2".to_string(), TestOutcome::Pass);

        let update = update_facet_statuses(&mut catalog, &outcomes);
        assert_eq!(update.passing, 1);
        assert_eq!(update.not_reported, vec!["f-001".to_string()]);
        assert_eq!(catalog.status_of("f-001").expect("f-001"), Status::Passing);
        assert_eq!(catalog.status_of("f-002").expect("f-002"), Status::Passing);
        assert_eq!(catalog.status_of("e-001").expect("e-001"), Status::Passing);
    }

    #[test]
    fn resolves_absolute_and_suffix_paths() {
        let catalog = sample_catalog();
        let index = build_index(
            &catalog,
            &per_test(&[("taskboard/cli.py", 1, &["t1"]), ("cli.py", 2, &["t1"])]),
        );
        assert_eq!(
            index.resolve_file("/work/repo/taskboard/cli.py", Some(Path::new("/work/repo"))),
            Some("taskboard/cli.py")
        );
        assert_eq!(index.resolve_file("./cli.py", None), Some("cli.py"));
        assert_eq!(
            index.resolve_file("/elsewhere/taskboard/cli.py", None),
            Some("taskboard/cli.py")
        );
        assert_eq!(index.resolve_file("missing.py", None), None);
    }

    #[test]
    fn root_level_file_does_not_resolve_to_a_nested_namesake() {
        let catalog = sample_catalog();
        let index = build_index(&catalog, &per_test(&[("taskboard/cli.py", 1, &["t1"])]));
        let root = Path::new("/work");

        assert_eq!(index.resolve_file("/work/cli.py", Some(root)), None);
        assert_eq!(index.resolve_file("cli.py", Some(root)), None);
        assert_eq!(index.resolve_file("cli.py", None), None);
        assert_eq!(
            index.resolve_file("/work/taskboard/cli.py", Some(root)),
            Some("taskboard/cli.py")
        );

        let absolute_keys = build_index(
            &catalog,
            &per_test(&[("/ci/checkout/taskboard/cli.py", 1, &["t1"])]),
        );
        assert_eq!(
            absolute_keys.resolve_file("/work/taskboard/cli.py", Some(root)),
            Some("/ci/checkout/taskboard/cli.py")
        );
    }

    #[test]
    fn facets_in_range_and_whole_file() {
        let catalog = sample_catalog();
        let index = build_index(
            &catalog,
            &per_test(&[("cli.py", 10, &["t1"]), ("cli.py", 20, &["t2"]), ("cli.py", 21, &["t1"])]),
        );
        let ranged = index.facets_in("cli.py", Some((15, 25)));
        assert_eq!(ranged["f-001"], vec![21]);
        assert_eq!(ranged["f-002"], vec![20]);
        assert_eq!(index.facets_in("cli.py", None)["f-001"], vec![10, 21]);
        assert_eq!(index.facet_lines("cli.py", "f-001"), vec![10, 21]);
        assert!(index.facets_in("other.py", None).is_empty());
    }

    #[test]
    fn missing_index_file_is_reported_as_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = MotivationIndex::load(&dir.path().join("index.json")).expect_err("missing");
        assert!(err.is_missing());
    }
}
