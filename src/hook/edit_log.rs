use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::store::{self, StoreError};

/// One Write/Edit observed by the hook, kept for later analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLogEntry {
    pub timestamp: String,
    pub tool: String,
    pub file: String,
    pub affected_lines: Vec<u32>,
    #[serde(rename = "facets")]
    pub facet_ids: Vec<String>,
    /// Root-first id path for each facet.
    pub ancestor_chains: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl EditLogEntry {
    pub fn is_unmapped(&self) -> bool {
        self.facet_ids.is_empty()
    }
}

/// Entries in append order; missing or unreadable logs read as empty.
pub fn load(path: &Path) -> Vec<EditLogEntry> {
    store::load_json_or_default(path)
}

pub fn append(path: &Path, entry: EditLogEntry) -> Result<(), StoreError> {
    let mut entries = load(path);
    entries.push(entry);
    store::save_json(path, &entries)
}
