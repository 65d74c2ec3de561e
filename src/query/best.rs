//! Picks the one motivation chain an edit most likely belongs to.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{QueryError, TreeNode, chain_tree};
use crate::catalog::{Catalog, Status};
use crate::index::MotivationIndex;

const CLOSENESS_MAX: f64 = 100.0;
const COMPACTNESS_MAX: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChainScore {
    pub closeness: f64,
    pub compactness: f64,
    pub status_bonus: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestChain {
    pub facet: String,
    pub score: ChainScore,
    pub chain: Vec<TreeNode>,
}

fn status_bonus(status: Status) -> f64 {
    match status {
        Status::Failing => 20.0,
        Status::Untested => 10.0,
        Status::Passing => 0.0,
    }
}

fn mean(lines: &[u32]) -> Option<f64> {
    if lines.is_empty() {
        return None;
    }
    Some(lines.iter().map(|&line| f64::from(line)).sum::<f64>() / lines.len() as f64)
}

/// Scores one candidate facet against the edited lines.
///
/// Closeness rewards a facet whose lines sit near the edit, compactness
/// rewards small facets, and unresolved facets get a bonus.
pub fn score_candidate(edited_lines: &[u32], facet_lines: &[u32], status: Status) -> ChainScore {
    let closeness = match (mean(edited_lines), mean(facet_lines)) {
        (Some(edited), Some(facet)) => (CLOSENESS_MAX - (edited - facet).abs()).max(0.0),
        _ => 0.0,
    };
    let compactness = (COMPACTNESS_MAX - facet_lines.len() as f64).max(0.0);
    let status_bonus = status_bonus(status);
    ChainScore {
        closeness,
        compactness,
        status_bonus,
        total: closeness + compactness + status_bonus,
    }
}

/// Highest scoring candidate in `file`; ties go to the lowest facet id.
/// `None` when no candidate is a known facet.
pub fn best_chain(
    catalog: &Catalog,
    index: &MotivationIndex,
    file: &str,
    edited_lines: &[u32],
    candidates: &[String],
) -> Result<Option<BestChain>, QueryError> {
    let mut scored = Vec::new();
    for facet_id in candidates {
        let Some(facet) = catalog.get(facet_id).filter(|node| node.is_facet()) else {
            continue;
        };
        let lines = index.facet_lines(file, facet_id);
        let score = score_candidate(edited_lines, &lines, facet.facet_status());
        scored.push((facet_id.as_str(), score, lines));
    }

    scored.sort_by(|(left_id, left, _), (right_id, right, _)| {
        right
            .total
            .total_cmp(&left.total)
            .then_with(|| left_id.cmp(right_id))
    });
    let Some((facet, score, lines)) = scored.into_iter().next() else {
        return Ok(None);
    };

    let mut selected = BTreeMap::new();
    selected.insert(facet.to_string(), lines);
    let chain = chain_tree(catalog, &selected)?;
    tracing::debug!(facet, total = score.total, "best chain selected");
    Ok(Some(BestChain {
        facet: facet.to_string(),
        score,
        chain,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::catalog::NodeKind;
    use crate::catalog::tests::{facet, node};
    use crate::coverage::{LineCoverage, NormalizedCoverage};
    use crate::index::build_index;

    fn catalog() -> Catalog {
        Catalog::from_nodes(vec![
            node("g-001", NodeKind::Goal, None),
            node("e-001", NodeKind::Expectation, Some("g-001")),
            facet("f-001", "e-001", "near", Status::Passing),
            facet("f-002", "e-001", "far", Status::Passing),
            facet("f-003", "e-001", "twin", Status::Passing),
            facet("f-004", "e-001", "broken", Status::Failing),
        ])
        .expect("catalog")
    }

    fn index(catalog: &Catalog, entries: &[(u32, &str)]) -> MotivationIndex {
        let mut lines: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for (line, test) in entries {
            lines.entry(*line).or_default().insert(test.to_string());
        }
        let mut files = BTreeMap::new();
        files.insert("cli.py".to_string(), lines);
        build_index(
            catalog,
            &NormalizedCoverage {
                lines: LineCoverage::PerTest(files),
                outcomes: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn score_combines_closeness_compactness_and_status() {
        let score = score_candidate(&[10, 12], &[11], Status::Failing);
        assert_eq!(score.closeness, 100.0);
        assert_eq!(score.compactness, 49.0);
        assert_eq!(score.status_bonus, 20.0);
        assert_eq!(score.total, 169.0);

        let far = score_candidate(&[1], &[500], Status::Passing);
        assert_eq!(far.closeness, 0.0);

        let sprawling = score_candidate(&[1], &(1..=80).collect::<Vec<_>>(), Status::Untested);
        assert_eq!(sprawling.compactness, 0.0);
        assert_eq!(sprawling.status_bonus, 10.0);
    }

    #[test]
    fn nearest_compact_facet_wins() {
        let catalog = catalog();
        let index = index(&catalog, &[(10, "near"), (90, "far")]);
        let best = best_chain(
            &catalog,
            &index,
            "cli.py",
            &[11],
            &["f-002".to_string(), "f-001".to_string()],
        )
        .expect("best chain")
        .expect("some chain");
        assert_eq!(best.facet, "f-001");
        assert_eq!(best.chain[0].id, "g-001");
        assert_eq!(best.chain[0].children[0].children[0].id, "f-001");
    }

    #[test]
    fn failing_bonus_can_outweigh_distance() {
        let catalog = catalog();
        let index = index(&catalog, &[(10, "near"), (20, "broken")]);
        let best = best_chain(
            &catalog,
            &index,
            "cli.py",
            &[10],
            &["f-001".to_string(), "f-004".to_string()],
        )
        .expect("best chain")
        .expect("some chain");
        assert_eq!(best.facet, "f-004");
    }

    #[test]
    fn ties_break_by_lowest_id_regardless_of_order() {
        let catalog = catalog();
        let index = index(&catalog, &[(10, "near"), (10, "twin")]);
        for candidates in [
            vec!["f-003".to_string(), "f-001".to_string()],
            vec!["f-001".to_string(), "f-003".to_string()],
        ] {
            let best = best_chain(&catalog, &index, "cli.py", &[10], &candidates)
                .expect("best chain")
                .expect("some chain");
            assert_eq!(best.facet, "f-001");
        }
    }

    #[test]
    fn unknown_candidates_yield_none() {
        let catalog = catalog();
        let index = index(&catalog, &[(10, "near")]);
        assert!(
            best_chain(&catalog, &index, "cli.py", &[10], &["f-999".to_string()])
                .expect("best chain")
                .is_none()
        );
    }
}
