use std::collections::BTreeMap;

use super::{CoverageError, CoverageFormat, TestOutcome, normalize_path, xml_document};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JUnitCase {
    pub id: String,
    pub aliases: Vec<String>,
    /// `None` when the case was skipped and therefore never ran.
    pub outcome: Option<TestOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JUnitReport {
    pub cases: Vec<JUnitCase>,
}

impl JUnitReport {
    pub fn parse(raw: &str) -> Result<Self, CoverageError> {
        let doc = xml_document(raw, CoverageFormat::Junit)?;
        let root = doc.root_element();
        if !root.has_tag_name("testsuites") && !root.has_tag_name("testsuite") {
            return Err(CoverageError::parse(
                CoverageFormat::Junit,
                format!("unexpected root element <{}>", root.tag_name().name()),
            ));
        }

        let mut cases = Vec::new();
        for case in doc.descendants().filter(|node| node.has_tag_name("testcase")) {
            let name = case.attribute("name").unwrap_or("").trim();
            if name.is_empty() {
                return Err(CoverageError::parse(
                    CoverageFormat::Junit,
                    "testcase without a name attribute",
                ));
            }
            let classname = case.attribute("classname").unwrap_or("").trim();
            let file = case.attribute("file").map(str::trim).filter(|f| !f.is_empty());

            let mut failed = false;
            let mut skipped = false;
            for child in case.children().filter(|child| child.is_element()) {
                match child.tag_name().name() {
                    "failure" | "error" => failed = true,
                    "skipped" => skipped = true,
                    _ => {}
                }
            }
            let outcome = if failed {
                Some(TestOutcome::Fail)
            } else if skipped {
                None
            } else {
                Some(TestOutcome::Pass)
            };

            let id = test_id(classname, name, file);
            let mut aliases = Vec::new();
            if !classname.is_empty() {
                let raw_alias = format!("{classname}::{name}");
                if raw_alias != id {
                    aliases.push(raw_alias);
                }
            }
            cases.push(JUnitCase {
                id,
                aliases,
                outcome,
            });
        }

        Ok(Self { cases })
    }

    /// Outcome per test id. A test reported more than once fails if any of
    /// its runs failed.
    pub fn outcomes(&self) -> BTreeMap<String, TestOutcome> {
        let mut out = BTreeMap::new();
        for case in &self.cases {
            let Some(outcome) = case.outcome else {
                continue;
            };
            for key in std::iter::once(&case.id).chain(case.aliases.iter()) {
                out.entry(key.clone())
                    .and_modify(|existing: &mut TestOutcome| {
                        if outcome == TestOutcome::Fail {
                            *existing = TestOutcome::Fail;
                        }
                    })
                    .or_insert(outcome);
            }
        }
        out
    }
}

/// Builds a `path::Class::name` identifier from JUnit attributes.
///
/// `classname` is split where the first capitalised segment starts; the
/// lowercase prefix is a module path, the rest are nested classes.
fn test_id(classname: &str, name: &str, file: Option<&str>) -> String {
    if classname.is_empty() {
        return match file {
            Some(file) => format!("{}::{name}", normalize_path(file)),
            None => name.to_string(),
        };
    }

    let segments = classname.split('.').collect::<Vec<_>>();
    let split = segments
        .iter()
        .position(|segment| segment.chars().next().is_some_and(char::is_uppercase))
        .unwrap_or(segments.len());
    let (module, classes) = segments.split_at(split);

    let module_path = match file {
        Some(file) => normalize_path(file),
        None if module.is_empty() => return format!("{classname}::{name}"),
        None => format!("{}.py", module.join("/")),
    };

    let mut parts = vec![module_path];
    parts.extend(classes.iter().map(|class| class.to_string()));
    parts.push(name.to_string());
    parts.join("::")
}
