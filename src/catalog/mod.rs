pub mod status;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::{self, StoreError};

pub use status::{Status, StatusFilter};

pub const CATALOG_VERSION: u32 = 1;
pub const DEFAULT_PRIORITY: i64 = 99;
pub const MODIFICATION_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Goal,
    Expectation,
    Facet,
}

impl NodeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Goal => "goal",
            Self::Expectation => "expectation",
            Self::Facet => "facet",
        }
    }

    pub const fn marker(self) -> char {
        match self {
            Self::Goal => 'G',
            Self::Expectation => 'E',
            Self::Facet => 'F',
        }
    }

    const fn id_prefix(self) -> &'static str {
        match self {
            Self::Goal => "g",
            Self::Expectation => "e",
            Self::Facet => "f",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = CatalogError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "goal" | "g" => Ok(Self::Goal),
            "expectation" | "e" => Ok(Self::Expectation),
            "facet" | "f" => Ok(Self::Facet),
            _ => Err(CatalogError::InvalidKind(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub timestamp: String,
    pub file: String,
    pub tool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub text: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifications: Vec<Modification>,
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

impl CatalogNode {
    pub fn is_facet(&self) -> bool {
        self.kind == NodeKind::Facet
    }

    /// Stored status of a facet. Non-facet nodes have no stored status.
    pub fn facet_status(&self) -> Status {
        self.status.unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub kind: NodeKind,
    pub text: String,
    pub parent: Option<String>,
    pub priority: Option<i64>,
    pub labels: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("node `{0}` not found")]
    NotFound(String),
    #[error("duplicate node id `{0}`")]
    DuplicateId(String),
    #[error("node `{id}` references missing parent `{parent}`")]
    MissingParent { id: String, parent: String },
    #[error("node `{id}`: {reason}")]
    InvalidParent { id: String, reason: String },
    #[error("parent chain of `{0}` contains a cycle")]
    Cycle(String),
    #[error("node `{0}` is not a facet")]
    NotAFacet(String),
    #[error("unknown node type `{0}` (expected goal, expectation or facet)")]
    InvalidKind(String),
    #[error("node text must not be empty")]
    EmptyText,
    #[error("unsupported catalog version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    #[serde(default)]
    nodes: Vec<CatalogNode>,
}

/// The goal/expectation/facet forest.
///
/// Nodes keep their insertion order for serialization; traversal helpers
/// always visit children in id order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    nodes: Vec<CatalogNode>,
    positions: HashMap<String, usize>,
    children: HashMap<String, Vec<String>>,
}

impl Catalog {
    pub fn from_nodes(nodes: Vec<CatalogNode>) -> Result<Self, CatalogError> {
        let mut catalog = Self {
            nodes,
            positions: HashMap::new(),
            children: HashMap::new(),
        };
        catalog.reindex()?;
        for node in &catalog.nodes {
            catalog.validate_parent(node.kind, &node.id, node.parent.as_deref())?;
        }
        for node in &catalog.nodes {
            catalog.ancestor_chain(&node.id)?;
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let Some(file) = store::load_json::<CatalogFile>(path)? else {
            return Ok(Self::default());
        };
        if file.version != CATALOG_VERSION {
            return Err(CatalogError::UnsupportedVersion(file.version));
        }
        Self::from_nodes(file.nodes)
    }

    /// Loads the catalog, treating any unreadable or invalid file as empty.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "catalog unreadable, using empty catalog");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let file = CatalogFile {
            version: CATALOG_VERSION,
            nodes: self.nodes.clone(),
        };
        store::save_json(path, &file)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CatalogNode] {
        &self.nodes
    }

    pub fn get(&self, id: &str) -> Option<&CatalogNode> {
        self.positions.get(id).map(|&pos| &self.nodes[pos])
    }

    pub fn require(&self, id: &str) -> Result<&CatalogNode, CatalogError> {
        self.get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub fn facets(&self) -> impl Iterator<Item = &CatalogNode> {
        self.nodes.iter().filter(|node| node.is_facet())
    }

    pub fn roots(&self) -> Vec<&CatalogNode> {
        let mut roots = self
            .nodes
            .iter()
            .filter(|node| node.parent.is_none())
            .collect::<Vec<_>>();
        roots.sort_by(|a, b| a.id.cmp(&b.id));
        roots
    }

    pub fn children(&self, id: &str) -> Vec<&CatalogNode> {
        self.children
            .get(id)
            .map(|ids| ids.iter().filter_map(|child| self.get(child)).collect())
            .unwrap_or_default()
    }

    /// Root-first path from the node's goal down to the node itself.
    pub fn ancestor_chain(&self, id: &str) -> Result<Vec<&CatalogNode>, CatalogError> {
        let mut chain = Vec::new();
        let mut cursor = Some(self.require(id)?);
        while let Some(node) = cursor {
            if chain.len() > self.nodes.len() {
                return Err(CatalogError::Cycle(id.to_string()));
            }
            chain.push(node);
            cursor = match node.parent.as_deref() {
                Some(parent) => Some(self.get(parent).ok_or_else(|| {
                    CatalogError::MissingParent {
                        id: node.id.clone(),
                        parent: parent.to_string(),
                    }
                })?),
                None => None,
            };
        }
        chain.reverse();
        Ok(chain)
    }

    /// Pre-order walk of the node and all of its descendants.
    pub fn subtree(&self, id: &str) -> Result<Vec<&CatalogNode>, CatalogError> {
        let root = self.require(id)?;
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            out.push(node);
            let mut kids = self.children(&node.id);
            kids.reverse();
            stack.extend(kids);
        }
        Ok(out)
    }

    /// Stored status for facets; computed from descendant facets otherwise.
    pub fn status_of(&self, id: &str) -> Result<Status, CatalogError> {
        let node = self.require(id)?;
        if node.is_facet() {
            return Ok(node.facet_status());
        }
        let subtree = self.subtree(id)?;
        Ok(Status::aggregate(
            subtree
                .iter()
                .filter(|node| node.is_facet())
                .map(|node| node.facet_status()),
        ))
    }

    /// Status of every node, computed in one bottom-up pass.
    pub fn status_map(&self) -> HashMap<String, Status> {
        let mut facet_statuses: HashMap<&str, Vec<Status>> = HashMap::new();
        for facet in self.facets() {
            let Ok(chain) = self.ancestor_chain(&facet.id) else {
                continue;
            };
            for ancestor in chain {
                facet_statuses
                    .entry(ancestor.id.as_str())
                    .or_default()
                    .push(facet.facet_status());
            }
        }

        self.nodes
            .iter()
            .map(|node| {
                let status = if node.is_facet() {
                    node.facet_status()
                } else {
                    Status::aggregate(
                        facet_statuses
                            .get(node.id.as_str())
                            .into_iter()
                            .flatten()
                            .copied(),
                    )
                };
                (node.id.clone(), status)
            })
            .collect()
    }

    pub fn add(&mut self, new: NewNode) -> Result<&CatalogNode, CatalogError> {
        let text = new.text.trim();
        if text.is_empty() {
            return Err(CatalogError::EmptyText);
        }
        let id = self.next_id(new.kind);
        self.validate_parent(new.kind, &id, new.parent.as_deref())?;

        let node = CatalogNode {
            id: id.clone(),
            kind: new.kind,
            text: text.to_string(),
            parent: new.parent,
            priority: new.priority.unwrap_or(DEFAULT_PRIORITY),
            labels: new
                .labels
                .into_iter()
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect(),
            test: None,
            status: (new.kind == NodeKind::Facet).then_some(Status::Untested),
            modifications: Vec::new(),
        };
        self.nodes.push(node);
        self.reindex()?;
        self.require(&id)
    }

    /// Links a facet to a test. Relinking to a different test forgets the
    /// previous outcome.
    pub fn link(&mut self, facet_id: &str, test_id: &str) -> Result<(), CatalogError> {
        let facet = self.facet_mut(facet_id)?;
        let test_id = test_id.trim().to_string();
        if facet.test.as_deref() != Some(test_id.as_str()) {
            facet.status = Some(Status::Untested);
        }
        facet.test = Some(test_id);
        Ok(())
    }

    pub fn set_facet_status(&mut self, facet_id: &str, status: Status) -> Result<(), CatalogError> {
        self.facet_mut(facet_id)?.status = Some(status);
        Ok(())
    }

    pub fn record_modification(
        &mut self,
        facet_id: &str,
        modification: Modification,
    ) -> Result<(), CatalogError> {
        let facet = self.facet_mut(facet_id)?;
        facet.modifications.push(modification);
        let overflow = facet.modifications.len().saturating_sub(MODIFICATION_LIMIT);
        if overflow > 0 {
            facet.modifications.drain(..overflow);
        }
        Ok(())
    }

    fn facet_mut(&mut self, facet_id: &str) -> Result<&mut CatalogNode, CatalogError> {
        let pos = *self
            .positions
            .get(facet_id)
            .ok_or_else(|| CatalogError::NotFound(facet_id.to_string()))?;
        let node = &mut self.nodes[pos];
        if !node.is_facet() {
            return Err(CatalogError::NotAFacet(facet_id.to_string()));
        }
        Ok(node)
    }

    fn next_id(&self, kind: NodeKind) -> String {
        let prefix = format!("{}-", kind.id_prefix());
        let next = self
            .nodes
            .iter()
            .filter_map(|node| node.id.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        format!("{prefix}{next:03}")
    }

    fn validate_parent(
        &self,
        kind: NodeKind,
        id: &str,
        parent: Option<&str>,
    ) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidParent {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        match (kind, parent) {
            (NodeKind::Goal, None) => Ok(()),
            (NodeKind::Goal, Some(_)) => Err(invalid("goals cannot have a parent")),
            (_, None) => Err(invalid("only goals may omit a parent")),
            (_, Some(parent_id)) => {
                let parent = self
                    .get(parent_id)
                    .ok_or_else(|| CatalogError::MissingParent {
                        id: id.to_string(),
                        parent: parent_id.to_string(),
                    })?;
                if parent.is_facet() {
                    return Err(invalid("facets cannot have children"));
                }
                Ok(())
            }
        }
    }

    fn reindex(&mut self) -> Result<(), CatalogError> {
        let mut positions = HashMap::with_capacity(self.nodes.len());
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for (pos, node) in self.nodes.iter().enumerate() {
            if positions.insert(node.id.clone(), pos).is_some() {
                return Err(CatalogError::DuplicateId(node.id.clone()));
            }
            if let Some(parent) = &node.parent {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        for ids in children.values_mut() {
            ids.sort();
        }
        self.positions = positions;
        self.children = children;
        Ok(())
    }
}
