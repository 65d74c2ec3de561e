pub mod best;
pub mod render;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::catalog::{Catalog, CatalogError, CatalogNode, NodeKind, Status, StatusFilter};
use crate::coverage::Attribution;
use crate::index::MotivationIndex;

pub use best::{BestChain, ChainScore, best_chain, score_candidate};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("node `{0}` not found")]
    NotFound(String),
    #[error("invalid line range {start}-{end}")]
    InvalidRange { start: u32, end: u32 },
    #[error(transparent)]
    Catalog(CatalogError),
}

impl From<CatalogError> for QueryError {
    fn from(value: CatalogError) -> Self {
        match value {
            CatalogError::NotFound(id) => Self::NotFound(id),
            other => Self::Catalog(other),
        }
    }
}

/// One node of a rendered motivation or catalog tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub text: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn from_node(node: &CatalogNode, status: Status) -> Self {
        Self {
            id: node.id.clone(),
            kind: node.kind,
            text: node.text.clone(),
            status,
            test: node.test.clone(),
            lines: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Facet ids in this subtree, in rendering order.
    pub fn facet_ids(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_facets(&mut out);
        out
    }

    fn collect_facets<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.kind == NodeKind::Facet {
            out.push(&self.id);
        }
        for child in &self.children {
            child.collect_facets(out);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MotivationTree {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<LineRange>,
    pub attribution: Attribution,
    pub facets: Vec<String>,
    pub roots: Vec<TreeNode>,
}

impl MotivationTree {
    /// No facet covers the requested lines.
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Explains `file` (optionally limited to `start..=end`) as the merged
/// goal → expectation → facet chains of every facet covering those lines.
pub fn motivation(
    catalog: &Catalog,
    index: &MotivationIndex,
    file: &str,
    range: Option<(u32, u32)>,
) -> Result<MotivationTree, QueryError> {
    if let Some((start, end)) = range {
        if start > end {
            return Err(QueryError::InvalidRange { start, end });
        }
    }
    let key = index.resolve_file(file, None).unwrap_or(file);
    let facet_lines = index.facets_in(key, range);
    let roots = chain_tree(catalog, &facet_lines)?;
    Ok(MotivationTree {
        file: key.to_string(),
        range: range.map(|(start, end)| LineRange { start, end }),
        attribution: index.attribution,
        facets: roots
            .iter()
            .flat_map(TreeNode::facet_ids)
            .map(ToOwned::to_owned)
            .collect(),
        roots,
    })
}

/// Merges the ancestor chains of `facet_lines`' facets into one forest.
///
/// Shared ancestors appear once; every level is sorted by id. Facets the
/// catalog no longer knows are skipped.
pub fn chain_tree(
    catalog: &Catalog,
    facet_lines: &BTreeMap<String, Vec<u32>>,
) -> Result<Vec<TreeNode>, QueryError> {
    let statuses = catalog.status_map();
    let mut included = BTreeSet::new();
    for facet in facet_lines.keys() {
        if catalog.get(facet).is_none() {
            tracing::debug!(facet = %facet, "index references a facet missing from the catalog");
            continue;
        }
        for node in catalog.ancestor_chain(facet)? {
            included.insert(node.id.as_str());
        }
    }

    let roots = catalog
        .roots()
        .into_iter()
        .filter(|root| included.contains(root.id.as_str()))
        .map(|root| build_chain_node(catalog, root, &included, facet_lines, &statuses))
        .collect();
    Ok(roots)
}

fn build_chain_node(
    catalog: &Catalog,
    node: &CatalogNode,
    included: &BTreeSet<&str>,
    facet_lines: &BTreeMap<String, Vec<u32>>,
    statuses: &HashMap<String, Status>,
) -> TreeNode {
    let mut out = TreeNode::from_node(node, status_for(statuses, node));
    if let Some(lines) = facet_lines.get(&node.id) {
        out.lines = lines.clone();
    }
    out.children = catalog
        .children(&node.id)
        .into_iter()
        .filter(|child| included.contains(child.id.as_str()))
        .map(|child| build_chain_node(catalog, child, included, facet_lines, statuses))
        .collect();
    out
}

fn status_for(statuses: &HashMap<String, Status>, node: &CatalogNode) -> Status {
    statuses.get(&node.id).copied().unwrap_or_default()
}

/// Files a node's facets were observed in, with the facets found in each.
pub fn locate(
    catalog: &Catalog,
    index: &MotivationIndex,
    node_id: &str,
) -> Result<BTreeMap<String, Vec<String>>, QueryError> {
    let facets = catalog
        .subtree(node_id)?
        .into_iter()
        .filter(|node| node.is_facet())
        .map(|node| node.id.as_str())
        .collect::<BTreeSet<_>>();

    let mut out = BTreeMap::new();
    for (file, file_facets) in &index.file_map {
        let matched = file_facets
            .iter()
            .filter(|facet| facets.contains(facet.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !matched.is_empty() {
            out.insert(file.clone(), matched);
        }
    }
    Ok(out)
}

/// Catalog view rooted at `node_id`, or at every goal.
///
/// `filter` hides nodes whose status does not match unless a descendant
/// matches. `max_depth` counts levels from the top; 0 shows everything.
pub fn tree(
    catalog: &Catalog,
    node_id: Option<&str>,
    filter: Option<StatusFilter>,
    max_depth: usize,
) -> Result<Vec<TreeNode>, QueryError> {
    let tops = match node_id {
        Some(id) => vec![catalog.require(id)?],
        None => catalog.roots(),
    };
    let statuses = catalog.status_map();
    let view = TreeView {
        catalog,
        statuses: &statuses,
        filter,
        max_depth,
    };
    Ok(tops
        .into_iter()
        .filter_map(|node| view.build(node, 1))
        .collect())
}

struct TreeView<'a> {
    catalog: &'a Catalog,
    statuses: &'a HashMap<String, Status>,
    filter: Option<StatusFilter>,
    max_depth: usize,
}

impl TreeView<'_> {
    fn build(&self, node: &CatalogNode, depth: usize) -> Option<TreeNode> {
        let status = status_for(self.statuses, node);
        let children = self
            .catalog
            .children(&node.id)
            .into_iter()
            .filter_map(|child| self.build(child, depth + 1))
            .collect::<Vec<_>>();

        let matches = self.filter.is_none_or(|filter| filter.matches(status));
        if !matches && children.is_empty() {
            return None;
        }

        let mut out = TreeNode::from_node(node, status);
        if self.max_depth == 0 || depth < self.max_depth {
            out.children = children;
        }
        Some(out)
    }
}
