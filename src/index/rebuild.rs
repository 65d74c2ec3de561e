use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use wait_timeout::ChildExt;

use super::{IndexError, MotivationIndex, StatusUpdate, build_index, update_facet_statuses};
use crate::catalog::{Catalog, CatalogError};
use crate::coverage::{
    Attribution, CoverageError, CoverageFormat, NormalizedCoverage, load_reports,
};

/// A report location plus the format it is written in.
#[derive(Debug, Clone)]
pub struct ReportSource {
    pub path: PathBuf,
    pub format: CoverageFormat,
}

#[derive(Debug, Clone)]
pub struct RebuildInputs {
    pub catalog: PathBuf,
    pub index: PathBuf,
    pub coverage: Option<ReportSource>,
    /// JUnit results read alongside line coverage for pass/fail outcomes.
    pub results: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildSummary {
    pub attribution: Attribution,
    pub files: usize,
    pub mapped_lines: usize,
    pub located_facets: usize,
    pub outcomes: usize,
    pub statuses: StatusUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    pub rebuild: RebuildSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("nothing to rebuild from: configure `coverage` and/or `results`")]
    NoInputs,
    #[error("no catalog at {0}; run `motive init` first")]
    MissingCatalog(PathBuf),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("cannot start test command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("test command exceeded {0:?}; previous index kept")]
    Timeout(Duration),
}

/// Parses reports, refreshes facet statuses and replaces the index.
///
/// Every input is read before anything is written, so a read failure leaves
/// both the catalog and the previous index untouched. The index is written
/// first: statuses reach the catalog only once the new index is in place.
pub fn rebuild(inputs: &RebuildInputs) -> Result<RebuildSummary, RebuildError> {
    let result = try_rebuild(inputs);
    if let Err(err) = &result {
        tracing::warn!(
            index = %inputs.index.display(),
            error = %err,
            "index rebuild skipped; previous index kept"
        );
    }
    result
}

fn try_rebuild(inputs: &RebuildInputs) -> Result<RebuildSummary, RebuildError> {
    if inputs.coverage.is_none() && inputs.results.is_none() {
        return Err(RebuildError::NoInputs);
    }
    if !inputs.catalog.is_file() {
        return Err(RebuildError::MissingCatalog(inputs.catalog.clone()));
    }
    let mut catalog = Catalog::load(&inputs.catalog)?;

    let mut coverage = NormalizedCoverage::default();
    if let Some(source) = &inputs.coverage {
        coverage = coverage.merge(load_reports(&source.path, source.format)?);
    }
    if let Some(results) = &inputs.results {
        coverage = coverage.merge(load_reports(results, CoverageFormat::Junit)?);
    }
    if coverage.attribution() == Attribution::Aggregate {
        tracing::info!("aggregate coverage: lines are attributed to tests at file granularity");
    }

    let statuses = update_facet_statuses(&mut catalog, &coverage.outcomes);
    let index = build_index(&catalog, &coverage);

    index.save(&inputs.index)?;
    catalog.save(&inputs.catalog)?;

    let summary = summarize(&index, coverage.outcomes.len(), statuses);
    tracing::info!(
        files = summary.files,
        lines = summary.mapped_lines,
        facets = summary.located_facets,
        attribution = summary.attribution.as_str(),
        "motivation index rebuilt"
    );
    Ok(summary)
}

fn summarize(index: &MotivationIndex, outcomes: usize, statuses: StatusUpdate) -> RebuildSummary {
    RebuildSummary {
        attribution: index.attribution,
        files: index.forward.len(),
        mapped_lines: index.forward.values().map(|lines| lines.len()).sum(),
        located_facets: index.located_in.len(),
        outcomes,
        statuses,
    }
}

/// Runs the project's test command through the shell, then rebuilds.
///
/// Failing tests (non-zero exit) still produce reports worth indexing. A
/// command that outlives `timeout` is killed and nothing is rebuilt.
pub fn run_tests_and_rebuild_index(
    inputs: &RebuildInputs,
    command: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<TestRun, RebuildError> {
    let started = Instant::now();
    let status = run_shell(command, cwd, timeout)?;
    let exit_code = status.code();
    if !status.success() {
        tracing::info!(?exit_code, "test command reported failures");
    }
    let rebuild = rebuild(inputs)?;
    Ok(TestRun {
        exit_code,
        duration_ms: started.elapsed().as_millis(),
        rebuild,
    })
}

fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> Result<ExitStatus, RebuildError> {
    let spawn_error = |source| RebuildError::Spawn {
        command: command.to_string(),
        source,
    };
    // Test output goes to stderr so stdout stays a JSON channel.
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(std::io::stderr()))
        .stderr(Stdio::from(std::io::stderr()))
        .spawn()
        .map_err(spawn_error)?;
    tracing::debug!(command, pid = child.id(), "test command started");

    match child.wait_timeout(timeout).map_err(spawn_error)? {
        Some(status) => Ok(status),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(command, ?timeout, "test command timed out");
            Err(RebuildError::Timeout(timeout))
        }
    }
}
