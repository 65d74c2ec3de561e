use std::collections::{BTreeMap, BTreeSet};

use super::{CoverageError, CoverageFormat, normalize_path, xml_document};

/// Aggregate line coverage: which lines the suite as a whole executed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoberturaReport {
    pub files: BTreeMap<String, BTreeSet<u32>>,
}

impl CoberturaReport {
    pub fn parse(raw: &str) -> Result<Self, CoverageError> {
        let doc = xml_document(raw, CoverageFormat::Cobertura)?;
        let root = doc.root_element();
        if !root.has_tag_name("coverage") {
            return Err(CoverageError::parse(
                CoverageFormat::Cobertura,
                format!("unexpected root element <{}>", root.tag_name().name()),
            ));
        }

        let mut files: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for class in doc.descendants().filter(|node| node.has_tag_name("class")) {
            let Some(filename) = class.attribute("filename") else {
                return Err(CoverageError::parse(
                    CoverageFormat::Cobertura,
                    "class element without a filename attribute",
                ));
            };
            let hit_lines = files.entry(normalize_path(filename)).or_default();
            for line in class.descendants().filter(|node| node.has_tag_name("line")) {
                let number = numeric_attribute::<u32>(line, "number")?;
                let hits = numeric_attribute::<u64>(line, "hits")?;
                if hits > 0 && number > 0 {
                    hit_lines.insert(number);
                }
            }
        }
        files.retain(|_, lines| !lines.is_empty());

        Ok(Self { files })
    }
}

fn numeric_attribute<T: std::str::FromStr>(
    node: roxmltree::Node<'_, '_>,
    name: &str,
) -> Result<T, CoverageError> {
    let raw = node.attribute(name).ok_or_else(|| {
        CoverageError::parse(
            CoverageFormat::Cobertura,
            format!("line element without `{name}`"),
        )
    })?;
    raw.trim().parse::<T>().map_err(|_| {
        CoverageError::parse(
            CoverageFormat::Cobertura,
            format!("line attribute `{name}` is not a number: `{raw}`"),
        )
    })
}
