//! Agent tool-use hook: turns Read/Write/Edit events into motivation
//! context or a permission decision.
//!
//! Everything here is advisory. [`HookRuntime::run`] swallows every error
//! and produces no output rather than disturbing the agent's tool call.

pub mod affected;
pub mod edit_log;
pub mod filter;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogError, Modification};
use crate::coverage::normalize_path;
use crate::index::{IndexError, MotivationIndex};
use crate::query::render::{compact_lines, render_motivation, render_nodes};
use crate::query::{QueryError, best_chain, chain_tree, motivation};
use crate::session::{SessionStore, Surface, chain_signature};
use crate::store::StoreError;

pub use affected::{affected_lines, written_lines};
pub use edit_log::EditLogEntry;
pub use filter::PathFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookVariant {
    /// Full deduplicated tree on every mapped edit.
    Standard,
    /// Only the single best-scoring chain.
    BestChain,
    /// Pre-tool permission decision for Write/Edit.
    Guard,
}

impl HookVariant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::BestChain => "best-chain",
            Self::Guard => "guard",
        }
    }
}

impl fmt::Display for HookVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookVariant {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "best-chain" | "best_chain" => Ok(Self::BestChain),
            "guard" => Ok(Self::Guard),
            other => Err(format!(
                "unknown hook variant `{other}` (expected standard, best-chain or guard)"
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolInput {
    #[serde(default, alias = "path")]
    pub file_path: Option<String>,
    #[serde(default)]
    pub old_string: Option<String>,
    #[serde(default)]
    pub new_string: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookEvent {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: ToolInput,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Read,
    Write,
    Edit,
}

impl Tool {
    fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "Read" | "read" => Some(Self::Read),
            "Write" | "write" => Some(Self::Write),
            "Edit" | "edit" => Some(Self::Edit),
            _ => None,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Edit => "Edit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HookOutput {
    Context {
        #[serde(rename = "additionalContext")]
        additional_context: String,
    },
    Decision {
        #[serde(rename = "permissionDecision")]
        decision: PermissionDecision,
        #[serde(rename = "permissionDecisionReason")]
        reason: String,
    },
}

impl HookOutput {
    fn context(text: impl Into<String>) -> Self {
        Self::Context {
            additional_context: text.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("malformed hook event: {0}")]
    Event(#[from] serde_json::Error),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Workspace state the hook reads and writes.
#[derive(Debug, Clone)]
pub struct HookRuntime {
    pub root: PathBuf,
    pub catalog: PathBuf,
    pub index: PathBuf,
    pub edit_log: PathBuf,
    pub session: SessionStore,
    pub variant: HookVariant,
    pub filter: PathFilter,
}

/// A hook event resolved against the workspace.
struct Target<'a> {
    tool: Tool,
    event: &'a HookEvent,
    absolute: PathBuf,
    relative: String,
}

impl HookRuntime {
    /// Handles one raw stdin payload. Errors become "no output".
    pub fn run(&self, raw: &str) -> Option<HookOutput> {
        let event = match serde_json::from_str::<HookEvent>(raw) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed hook event");
                return None;
            }
        };
        match self.handle(&event) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(tool = %event.tool_name, error = %err, "hook failed silently");
                None
            }
        }
    }

    pub fn handle(&self, event: &HookEvent) -> Result<Option<HookOutput>, HookError> {
        let Some(tool) = Tool::parse(&event.tool_name) else {
            return Ok(None);
        };
        let Some(file_path) = event
            .tool_input
            .file_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
        else {
            return Ok(None);
        };

        let (absolute, relative) = self.locate_file(file_path, event.cwd.as_deref());
        if self.filter.is_skipped(&relative) {
            tracing::debug!(file = %relative, "skipped by path filter");
            return Ok(None);
        }
        let target = Target {
            tool,
            event,
            absolute,
            relative,
        };

        let index = match MotivationIndex::load(&self.index) {
            Ok(index) => Some(index),
            Err(err) if err.is_missing() => None,
            Err(err) => return Err(err.into()),
        };
        match tool {
            Tool::Read => match index {
                Some(index) => self.on_read(&target, &index),
                None => Ok(None),
            },
            Tool::Write | Tool::Edit => self.on_write(&target, index.as_ref()),
        }
    }

    fn locate_file(&self, file_path: &str, cwd: Option<&str>) -> (PathBuf, String) {
        let raw = Path::new(file_path);
        let absolute = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            cwd.map(PathBuf::from)
                .unwrap_or_else(|| self.root.clone())
                .join(raw)
        };
        let relative = absolute
            .strip_prefix(&self.root)
            .map(|rest| rest.to_string_lossy().into_owned())
            .unwrap_or_else(|_| file_path.to_string());
        (absolute, normalize_path(&relative))
    }

    fn on_read(
        &self,
        target: &Target<'_>,
        index: &MotivationIndex,
    ) -> Result<Option<HookOutput>, HookError> {
        let Some(key) = index.resolve_file(&target.relative, Some(&self.root)) else {
            return Ok(None);
        };
        let input = &target.event.tool_input;
        let range = read_range(input.offset, input.limit);
        let catalog = Catalog::load_or_empty(&self.catalog);
        let tree = motivation(&catalog, index, key, range)?;
        if tree.is_empty() {
            return Ok(None);
        }

        let mut seen = self.session.open(target.event.session_id.as_deref())?;
        let surface = seen.surface(key, &tree.facets);
        self.session.save(&seen)?;
        match surface {
            Surface::Full(_) => Ok(Some(HookOutput::context(render_motivation(&tree)))),
            Surface::New(fresh) => {
                let text = render_new(&catalog, index, key, &fresh)?;
                Ok(Some(HookOutput::context(text)))
            }
            Surface::Unchanged => {
                tracing::debug!(
                    file = key,
                    signature = %chain_signature(&tree.facets),
                    "motivation already shown"
                );
                Ok(None)
            }
        }
    }

    fn on_write(
        &self,
        target: &Target<'_>,
        index: Option<&MotivationIndex>,
    ) -> Result<Option<HookOutput>, HookError> {
        let input = &target.event.tool_input;
        let lines = match target.tool {
            Tool::Write => match input.content.as_deref() {
                Some(content) => written_lines(content),
                None => written_lines(&self.read_file(&target.absolute)?),
            },
            _ => {
                let content = self.read_file(&target.absolute)?;
                affected_lines(
                    input.old_string.as_deref(),
                    input.new_string.as_deref(),
                    &content,
                )
            }
        };

        let key = index
            .and_then(|index| index.resolve_file(&target.relative, Some(&self.root)))
            .map(ToOwned::to_owned);
        let mut touched: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        if let (Some(index), Some(key)) = (index, key.as_deref()) {
            if let Some(by_line) = index.forward.get(key) {
                for line in &lines {
                    for facet in by_line.get(line).into_iter().flatten() {
                        touched.entry(facet.clone()).or_default().push(*line);
                    }
                }
            }
        }

        let file = key.clone().unwrap_or_else(|| target.relative.clone());
        let mut catalog = Catalog::load_or_empty(&self.catalog);
        touched.retain(|facet, _| catalog.get(facet).is_some_and(|node| node.is_facet()));
        let facet_ids = touched.keys().cloned().collect::<Vec<_>>();
        let ancestor_chains = facet_ids
            .iter()
            .map(|facet| {
                catalog
                    .ancestor_chain(facet)
                    .map(|chain| chain.into_iter().map(|node| node.id.clone()).collect())
            })
            .collect::<Result<Vec<Vec<String>>, _>>()?;

        let timestamp = now_iso8601();
        edit_log::append(
            &self.edit_log,
            EditLogEntry {
                timestamp: timestamp.clone(),
                tool: target.tool.as_str().to_string(),
                file: file.clone(),
                affected_lines: lines.clone(),
                facet_ids: facet_ids.clone(),
                ancestor_chains,
                session_id: target.event.session_id.clone(),
            },
        )?;

        let Some(index) = index.filter(|index| !index.is_empty()) else {
            // Nothing is mapped yet, so there is nothing to guard or nudge about.
            return Ok(None);
        };
        if facet_ids.is_empty() {
            let nudge = unmapped_nudge(&file, &lines);
            return Ok(Some(match self.variant {
                HookVariant::Guard => HookOutput::Decision {
                    decision: PermissionDecision::Deny,
                    reason: nudge,
                },
                _ => HookOutput::context(nudge),
            }));
        }

        for facet in &facet_ids {
            catalog.record_modification(
                facet,
                Modification {
                    timestamp: timestamp.clone(),
                    file: file.clone(),
                    tool: target.tool.as_str().to_string(),
                },
            )?;
        }
        if let Err(err) = catalog.save(&self.catalog) {
            tracing::warn!(error = %err, "could not record facet modifications");
        }

        match self.variant {
            HookVariant::Standard => {
                let mut seen = self.session.open(target.event.session_id.as_deref())?;
                let surface = seen.surface(&file, &facet_ids);
                self.session.save(&seen)?;
                let text = match surface {
                    Surface::Full(_) => {
                        let roots = chain_tree(&catalog, &touched)?;
                        format!(
                            "Edit to {file} lines {} serves:\n{}",
                            compact_lines(&lines),
                            render_nodes(&roots)
                        )
                    }
                    Surface::New(fresh) => render_new(&catalog, index, &file, &fresh)?,
                    Surface::Unchanged => unchanged_marker(&file, &facet_ids),
                };
                Ok(Some(HookOutput::context(text)))
            }
            HookVariant::BestChain | HookVariant::Guard => {
                let Some(best) = best_chain(&catalog, index, &file, &lines, &facet_ids)? else {
                    return Ok(None);
                };
                let text = format!(
                    "Edit to {file} lines {} most likely serves {} (score {:.1}):\n{}",
                    compact_lines(&lines),
                    best.facet,
                    best.score.total,
                    render_nodes(&best.chain)
                );
                if self.variant == HookVariant::Guard {
                    return Ok(Some(HookOutput::Decision {
                        decision: PermissionDecision::Allow,
                        reason: text,
                    }));
                }
                let mut seen = self.session.open(target.event.session_id.as_deref())?;
                let show = seen.should_show(&file, std::slice::from_ref(&best.facet));
                self.session.save(&seen)?;
                Ok(Some(HookOutput::context(if show {
                    text
                } else {
                    unchanged_marker(&file, std::slice::from_ref(&best.facet))
                })))
            }
        }
    }

    fn read_file(&self, path: &Path) -> Result<String, HookError> {
        fs::read_to_string(path).map_err(|source| HookError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Read tools pass a 1-based start line and a line count.
fn read_range(offset: Option<u32>, limit: Option<u32>) -> Option<(u32, u32)> {
    match (offset, limit) {
        (None, None) => None,
        (offset, limit) => {
            let start = offset.unwrap_or(1).max(1);
            let end = match limit {
                Some(limit) if limit > 0 => start.saturating_add(limit - 1),
                _ => u32::MAX,
            };
            Some((start, end))
        }
    }
}

fn render_new(
    catalog: &Catalog,
    index: &MotivationIndex,
    file: &str,
    fresh: &[String],
) -> Result<String, HookError> {
    let selected = fresh
        .iter()
        .map(|facet| (facet.clone(), index.facet_lines(file, facet)))
        .collect::<BTreeMap<_, _>>();
    let roots = chain_tree(catalog, &selected)?;
    Ok(format!(
        "New motivation for {file} since last shown:\n{}",
        render_nodes(&roots)
    ))
}

fn unchanged_marker(file: &str, facets: &[String]) -> String {
    format!(
        "Motivation for {file} unchanged since last shown ({}).",
        facets.join(", ")
    )
}

fn unmapped_nudge(file: &str, lines: &[u32]) -> String {
    let span = if lines.is_empty() {
        String::new()
    } else {
        format!(" lines {}", compact_lines(lines))
    };
    format!(
        "{file}{span} is unmapped: no catalog facet covers this code. If this is new \
         behaviour, register it with `motive add facet \"<what it does>\" --parent <e-id>` \
         and link a test with `motive link <f-id> <test-id>`."
    )
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
