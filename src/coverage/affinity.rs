//! File-level association between tests and source files.
//!
//! Aggregate coverage reports say which lines ran but not which test ran
//! them. In that mode a test is assumed to exercise every hit line of the
//! source files it targets, where the target is derived from the test's own
//! module name (`tests/test_store.py` → `store.py`). This is deliberately
//! coarse; per-test reports avoid it.

use std::path::Path;

/// True when `test_id` targets `source_file` at file granularity.
pub fn test_targets_file(test_id: &str, source_file: &str) -> bool {
    let Some(test_module) = test_module(test_id) else {
        return false;
    };
    if same_file(&test_module, source_file) {
        return true;
    }
    match (subject_stem(&test_module), file_stem(source_file)) {
        (Some(subject), Some(stem)) => subject == stem,
        _ => false,
    }
}

fn test_module(test_id: &str) -> Option<String> {
    let test_id = test_id.trim();
    if let Some((module, _)) = test_id.split_once("::") {
        return Some(module.to_string());
    }
    // Dotted ids such as `tests.test_store.TestStore.test_add`.
    test_id
        .split('.')
        .find(|segment| is_test_name(segment))
        .map(|segment| format!("{segment}.py"))
}

fn is_test_name(segment: &str) -> bool {
    segment.starts_with("test_") || segment.ends_with("_test") || segment.ends_with("_tests")
}

fn subject_stem(test_module: &str) -> Option<String> {
    let stem = file_stem(test_module)?;
    let subject = stem
        .strip_suffix(".test")
        .or_else(|| stem.strip_suffix(".spec"))
        .or_else(|| stem.strip_prefix("test_"))
        .or_else(|| stem.strip_suffix("_tests"))
        .or_else(|| stem.strip_suffix("_test"))?;
    if subject.is_empty() {
        None
    } else {
        Some(subject.to_string())
    }
}

fn file_stem(path: &str) -> Option<String> {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(ToOwned::to_owned)
}

fn same_file(left: &str, right: &str) -> bool {
    left == right
        || left.ends_with(&format!("/{right}"))
        || right.ends_with(&format!("/{left}"))
}
