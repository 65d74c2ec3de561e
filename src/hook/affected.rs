//! Approximates which lines of a file an edit touched.
//!
//! This is a textual heuristic, not a diff: a fragment that also occurs
//! elsewhere in the file can be attributed to the wrong lines.

use std::collections::BTreeSet;

/// 1-based lines of `content` touched by replacing `old` with `new`.
///
/// `new` is looked up first (the file already holds the edit), then `old`
/// (the edit is still pending). Each fragment is tried as a whole and then
/// line by line.
pub fn affected_lines(old: Option<&str>, new: Option<&str>, content: &str) -> Vec<u32> {
    for fragment in [new, old].into_iter().flatten() {
        if fragment.trim().is_empty() {
            continue;
        }
        if let Some(lines) = whole_match(fragment, content) {
            return lines;
        }
        let lines = per_line_match(fragment, content);
        if !lines.is_empty() {
            return lines;
        }
    }
    Vec::new()
}

/// Every line of a freshly written file.
pub fn written_lines(content: &str) -> Vec<u32> {
    (1..=line_number(content.lines().count())).collect()
}

fn whole_match(fragment: &str, content: &str) -> Option<Vec<u32>> {
    let fragment = fragment.trim_end_matches('\n');
    let offset = content.find(fragment)?;
    let start = line_number(content[..offset].matches('\n').count()) + 1;
    let span = line_number(fragment.matches('\n').count());
    Some((start..=start + span).collect())
}

fn per_line_match(fragment: &str, content: &str) -> Vec<u32> {
    let needles = fragment
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<BTreeSet<_>>();
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && needles.iter().any(|needle| line.contains(needle))
        })
        .map(|(idx, _)| line_number(idx) + 1)
        .collect()
}

fn line_number(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::{affected_lines, written_lines};

    const FILE: &str = "import os\n\ndef add(task):\n    tasks.append(task)\n    save()\n\ndef remove(task):\n    tasks.remove(task)\n";

    #[test]
    fn new_fragment_locates_multi_line_span() {
        assert_eq!(
            affected_lines(
                Some("tasks.append(t)"),
                Some("    tasks.append(task)\n    save()\n"),
                FILE
            ),
            vec![4, 5]
        );
    }

    #[test]
    fn falls_back_to_old_fragment_before_the_edit_lands() {
        assert_eq!(
            affected_lines(Some("tasks.remove(task)"), Some("tasks.discard(task)"), FILE),
            vec![8]
        );
    }

    #[test]
    fn reflowed_fragment_matches_line_by_line() {
        assert_eq!(
            affected_lines(None, Some("def add(task):\n  save()"), FILE),
            vec![3, 5]
        );
    }

    #[test]
    fn unmatched_or_blank_fragments_touch_nothing() {
        assert!(affected_lines(Some("   "), Some("nowhere()"), FILE).is_empty());
        assert!(affected_lines(None, None, FILE).is_empty());
    }

    #[test]
    fn write_covers_every_line() {
        assert_eq!(written_lines("a\nb\nc"), vec![1, 2, 3]);
        assert!(written_lines("").is_empty());
    }
}
