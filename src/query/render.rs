use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::{MotivationTree, TreeNode};
use crate::coverage::Attribution;

/// Depth-first text rendering, one node per line, children indented.
pub fn render_nodes(nodes: &[TreeNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        render_node(&mut out, node, 0);
    }
    out
}

fn render_node(out: &mut String, node: &TreeNode, depth: usize) {
    let _ = write!(
        out,
        "{:indent$}[{}] {} {} ({})",
        "",
        node.kind.marker(),
        node.id,
        node.text,
        node.status,
        indent = depth * 2
    );
    if !node.lines.is_empty() {
        let _ = write!(out, " lines {}", compact_lines(&node.lines));
    }
    out.push('\n');
    for child in &node.children {
        render_node(out, child, depth + 1);
    }
}

pub fn render_motivation(tree: &MotivationTree) -> String {
    let target = match tree.range {
        Some(range) => format!("{}:{}-{}", tree.file, range.start, range.end),
        None => tree.file.clone(),
    };
    if tree.is_empty() {
        return format!("No motivation recorded for {target}.\n");
    }
    let mut out = format!("Motivation for {target}:\n");
    out.push_str(&render_nodes(&tree.roots));
    if tree.attribution == Attribution::Aggregate {
        out.push_str("(aggregate coverage: facets are matched to this file by test module, not per line)\n");
    }
    out
}

pub fn render_locations(node_id: &str, locations: &BTreeMap<String, Vec<String>>) -> String {
    if locations.is_empty() {
        return format!("{node_id} is not located in any covered file.\n");
    }
    let mut out = String::new();
    for (file, facets) in locations {
        let _ = writeln!(out, "{file}: {}", facets.join(", "));
    }
    out
}

/// `[1, 2, 3, 7]` → `1-3, 7`.
pub fn compact_lines(lines: &[u32]) -> String {
    let mut spans: Vec<(u32, u32)> = Vec::new();
    for &line in lines {
        match spans.last_mut() {
            Some((_, end)) if line == *end + 1 => *end = line,
            Some((_, end)) if line == *end => {}
            _ => spans.push((line, line)),
        }
    }
    spans
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NodeKind, Status};
    use crate::query::LineRange;

    fn leaf(id: &str, lines: Vec<u32>) -> TreeNode {
        TreeNode {
            id: id.to_string(),
            kind: NodeKind::Facet,
            text: "export writes csv".to_string(),
            status: Status::Passing,
            test: Some("t1".to_string()),
            lines,
            children: Vec::new(),
        }
    }

    #[test]
    fn renders_markers_and_indentation() {
        let tree = MotivationTree {
            file: "cli.py".to_string(),
            range: Some(LineRange { start: 42, end: 42 }),
            attribution: Attribution::PerTest,
            facets: vec!["f-001".to_string()],
            roots: vec![TreeNode {
                id: "g-001".to_string(),
                kind: NodeKind::Goal,
                text: "Users trust their data".to_string(),
                status: Status::Failing,
                test: None,
                lines: Vec::new(),
                children: vec![TreeNode {
                    id: "e-001".to_string(),
                    kind: NodeKind::Expectation,
                    text: "Exports are lossless".to_string(),
                    status: Status::Failing,
                    test: None,
                    lines: Vec::new(),
                    children: vec![leaf("f-001", vec![42])],
                }],
            }],
        };
        assert_eq!(
            render_motivation(&tree),
            "Motivation for cli.py:42-42:\n\
             [G] g-001 Users trust their data (failing)\n\
             \x20\x20[E] e-001 Exports are lossless (failing)\n\
             \x20\x20\x20\x20[F] f-001 export writes csv (passing) lines 42\n"
        );
    }

    #[test]
    fn empty_tree_says_so() {
        let tree = MotivationTree {
            file: "cli.py".to_string(),
            range: None,
            attribution: Attribution::None,
            facets: Vec::new(),
            roots: Vec::new(),
        };
        assert_eq!(render_motivation(&tree), "No motivation recorded for cli.py.\n");
    }

    #[test]
    fn compacts_line_runs() {
        assert_eq!(compact_lines(&[1, 2, 3, 7, 9, 10]), "1-3, 7, 9-10");
        assert_eq!(compact_lines(&[]), "");
    }
}
