pub mod affinity;
pub mod cobertura;
pub mod coverage_json;
pub mod junit;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use cobertura::CoberturaReport;
use coverage_json::CoverageJsonReport;
use junit::JUnitReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageFormat {
    Junit,
    Cobertura,
    CoverageJson,
}

impl CoverageFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Junit => "junit",
            Self::Cobertura => "cobertura",
            Self::CoverageJson => "coverage-json",
        }
    }

    const fn extension(self) -> &'static str {
        match self {
            Self::Junit | Self::Cobertura => "xml",
            Self::CoverageJson => "json",
        }
    }
}

impl fmt::Display for CoverageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverageFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "junit" | "junit-xml" => Ok(Self::Junit),
            "cobertura" | "cobertura-xml" => Ok(Self::Cobertura),
            "coverage-json" | "coverage_json" | "json" => Ok(Self::CoverageJson),
            other => Err(format!("unknown coverage format `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
}

/// How precisely line coverage ties lines to tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attribution {
    #[default]
    None,
    Aggregate,
    PerTest,
}

impl Attribution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aggregate => "aggregate",
            Self::PerTest => "per-test",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LineCoverage {
    #[default]
    None,
    /// file → lines hit by some test.
    Aggregate(BTreeMap<String, BTreeSet<u32>>),
    /// file → line → tests that executed it.
    PerTest(BTreeMap<String, BTreeMap<u32, BTreeSet<String>>>),
}

impl LineCoverage {
    pub fn attribution(&self) -> Attribution {
        match self {
            Self::None => Attribution::None,
            Self::Aggregate(_) => Attribution::Aggregate,
            Self::PerTest(_) => Attribution::PerTest,
        }
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::None, other) | (other, Self::None) => other,
            (Self::Aggregate(mut left), Self::Aggregate(right)) => {
                for (file, lines) in right {
                    left.entry(file).or_default().extend(lines);
                }
                Self::Aggregate(left)
            }
            (Self::PerTest(mut left), Self::PerTest(right)) => {
                for (file, lines) in right {
                    let target = left.entry(file).or_default();
                    for (line, tests) in lines {
                        target.entry(line).or_default().extend(tests);
                    }
                }
                Self::PerTest(left)
            }
            (Self::PerTest(precise), Self::Aggregate(_))
            | (Self::Aggregate(_), Self::PerTest(precise)) => {
                tracing::warn!("mixing per-test and aggregate coverage; keeping per-test data only");
                Self::PerTest(precise)
            }
        }
    }
}

/// Format-independent result of one or more reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedCoverage {
    pub lines: LineCoverage,
    pub outcomes: BTreeMap<String, TestOutcome>,
}

impl NormalizedCoverage {
    pub fn attribution(&self) -> Attribution {
        self.lines.attribution()
    }

    /// Combines two reports, e.g. JUnit outcomes with Cobertura lines.
    /// Outcomes from `other` override those already present.
    pub fn merge(self, other: Self) -> Self {
        let mut outcomes = self.outcomes;
        outcomes.extend(other.outcomes);
        Self {
            lines: self.lines.merge(other.lines),
            outcomes,
        }
    }
}

/// One parsed report, tagged by the format it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageReport {
    JUnit(JUnitReport),
    Cobertura(CoberturaReport),
    CoverageJson(CoverageJsonReport),
}

impl CoverageReport {
    pub fn parse(raw: &str, format: CoverageFormat) -> Result<Self, CoverageError> {
        match format {
            CoverageFormat::Junit => JUnitReport::parse(raw).map(Self::JUnit),
            CoverageFormat::Cobertura => CoberturaReport::parse(raw).map(Self::Cobertura),
            CoverageFormat::CoverageJson => CoverageJsonReport::parse(raw).map(Self::CoverageJson),
        }
    }

    pub fn normalize(self) -> NormalizedCoverage {
        match self {
            Self::JUnit(report) => NormalizedCoverage {
                lines: LineCoverage::None,
                outcomes: report.outcomes(),
            },
            Self::Cobertura(report) => NormalizedCoverage {
                lines: LineCoverage::Aggregate(report.files),
                outcomes: BTreeMap::new(),
            },
            Self::CoverageJson(CoverageJsonReport::PerTest(files)) => NormalizedCoverage {
                lines: LineCoverage::PerTest(files),
                outcomes: BTreeMap::new(),
            },
            Self::CoverageJson(CoverageJsonReport::Aggregate(files)) => NormalizedCoverage {
                lines: LineCoverage::Aggregate(files),
                outcomes: BTreeMap::new(),
            },
        }
    }
}

pub fn parse(raw: &str, format: CoverageFormat) -> Result<NormalizedCoverage, CoverageError> {
    Ok(CoverageReport::parse(raw, format)?.normalize())
}

/// Parses a report file, or every report with the format's extension below
/// a directory, merging them in path order.
pub fn load_reports(path: &Path, format: CoverageFormat) -> Result<NormalizedCoverage, CoverageError> {
    let files = if path.is_dir() {
        let mut files = WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .map(|entry| entry.into_path())
            .filter(|candidate| {
                candidate.is_file()
                    && candidate.extension().and_then(|ext| ext.to_str()) == Some(format.extension())
            })
            .collect::<Vec<_>>();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    if files.is_empty() {
        return Err(CoverageError::NoReports(path.to_path_buf()));
    }

    let mut merged = NormalizedCoverage::default();
    for file in files {
        let raw = fs::read_to_string(&file).map_err(|source| CoverageError::Io {
            path: file.clone(),
            source,
        })?;
        tracing::debug!(path = %file.display(), format = %format, "parsing report");
        merged = merged.merge(parse(&raw, format)?);
    }
    Ok(merged)
}

#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    #[error("malformed {format} report: {message}")]
    Parse {
        format: CoverageFormat,
        message: String,
    },
    #[error("cannot read report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no reports found under {0}")]
    NoReports(PathBuf),
}

impl CoverageError {
    pub(crate) fn parse(format: CoverageFormat, message: impl Into<String>) -> Self {
        Self::Parse {
            format,
            message: message.into(),
        }
    }
}

pub(crate) fn xml_document(
    raw: &str,
    format: CoverageFormat,
) -> Result<roxmltree::Document<'_>, CoverageError> {
    let mut options = roxmltree::ParsingOptions::default();
    options.allow_dtd = true;
    roxmltree::Document::parse_with_options(raw, options)
        .map_err(|err| CoverageError::parse(format, err.to_string()))
}

/// Report paths are compared as forward-slash paths without a leading `./`.
pub fn normalize_path(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    const COBERTURA: &str = r#"<coverage><packages><package><classes>
        <class filename="store.py"><lines><line number="10" hits="1"/></lines></class>
    </classes></package></packages></coverage>"#;

    const JUNIT: &str = r#"<testsuite>
        <testcase classname="tests.test_store" name="test_add"/>
        <testcase classname="tests.test_store" name="test_remove"><failure/></testcase>
    </testsuite>"#;

    #[test]
    fn format_selects_parser_and_attribution() {
        let lines = parse(COBERTURA, CoverageFormat::Cobertura).expect("cobertura");
        assert_eq!(lines.attribution(), Attribution::Aggregate);
        assert!(lines.outcomes.is_empty());

        let outcomes = parse(JUNIT, CoverageFormat::Junit).expect("junit");
        assert_eq!(outcomes.attribution(), Attribution::None);
        assert_eq!(
            outcomes.outcomes["tests/test_store.py::test_add"],
            TestOutcome::Pass
        );

        assert!(parse(COBERTURA, CoverageFormat::CoverageJson).is_err());
    }

    #[test]
    fn merge_joins_outcomes_with_lines() {
        let merged = parse(JUNIT, CoverageFormat::Junit)
            .expect("junit")
            .merge(parse(COBERTURA, CoverageFormat::Cobertura).expect("cobertura"));
        assert_eq!(merged.attribution(), Attribution::Aggregate);
        assert_eq!(
            merged.outcomes["tests/test_store.py::test_remove"],
            TestOutcome::Fail
        );
    }

    #[test]
    fn directory_of_reports_is_walked_and_merged() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("shard-2")).expect("shard dir");
        std::fs::write(dir.path().join("a.xml"), COBERTURA).expect("report a");
        std::fs::write(
            dir.path().join("shard-2/b.xml"),
            r#"<coverage><packages><package><classes>
                <class filename="cli.py"><lines><line number="3" hits="2"/></lines></class>
            </classes></package></packages></coverage>"#,
        )
        .expect("report b");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("noise");

        let merged = load_reports(dir.path(), CoverageFormat::Cobertura).expect("load");
        let LineCoverage::Aggregate(files) = merged.lines else {
            panic!("expected aggregate coverage");
        };
        assert_eq!(files.keys().cloned().collect::<Vec<_>>(), vec!["cli.py", "store.py"]);
    }

    #[test]
    fn empty_directory_reports_nothing_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            load_reports(dir.path(), CoverageFormat::Junit),
            Err(CoverageError::NoReports(_))
        ));
    }

    #[test]
    fn normalizes_report_paths() {
        assert_eq!(normalize_path("./././src\\cli.py"), "src/cli.py");
    }
}
