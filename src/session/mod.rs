use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{self, StoreError, atomic_write};

/// Facet ids already injected per file during the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionSeen {
    files: BTreeMap<String, BTreeSet<String>>,
}

/// What a lookup should surface, given what the session already saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Surface {
    /// First time this file is shown: the whole chain.
    Full(Vec<String>),
    /// The file was shown before; only these facets are new.
    New(Vec<String>),
    Unchanged,
}

impl SessionSeen {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn seen(&self, file: &str) -> Option<&BTreeSet<String>> {
        self.files.get(file)
    }

    /// Classifies `facets` for `file` and records them as shown.
    pub fn surface<S: AsRef<str>>(&mut self, file: &str, facets: &[S]) -> Surface {
        let incoming = facets
            .iter()
            .map(|facet| facet.as_ref().to_string())
            .collect::<BTreeSet<_>>();
        let surface = match self.files.get(file) {
            None => Surface::Full(incoming.iter().cloned().collect()),
            Some(shown) => {
                let fresh = incoming.difference(shown).cloned().collect::<Vec<_>>();
                if fresh.is_empty() {
                    Surface::Unchanged
                } else {
                    Surface::New(fresh)
                }
            }
        };
        self.mark_shown(file, facets);
        surface
    }

    /// True when the chain has anything this session has not shown for
    /// `file` yet; the chain is recorded either way.
    pub fn should_show<S: AsRef<str>>(&mut self, file: &str, facets: &[S]) -> bool {
        !matches!(self.surface(file, facets), Surface::Unchanged)
    }

    pub fn mark_shown<S: AsRef<str>>(&mut self, file: &str, facets: &[S]) {
        self.files
            .entry(file.to_string())
            .or_default()
            .extend(facets.iter().map(|facet| facet.as_ref().to_string()));
    }
}

/// Order-independent identifier of a chain's facet set.
pub fn chain_signature<S: AsRef<str>>(facets: &[S]) -> String {
    let unique = facets
        .iter()
        .map(|facet| facet.as_ref())
        .collect::<BTreeSet<_>>();
    let mut hasher = Sha256::new();
    for facet in unique {
        hasher.update(facet.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Where the seen state and the owning session id live in a workspace.
#[derive(Debug, Clone)]
pub struct SessionStore {
    seen: PathBuf,
    session_id: PathBuf,
}

impl SessionStore {
    pub fn new(seen: impl Into<PathBuf>, session_id: impl Into<PathBuf>) -> Self {
        Self {
            seen: seen.into(),
            session_id: session_id.into(),
        }
    }

    pub fn seen_path(&self) -> &Path {
        &self.seen
    }

    /// Discards the previous session's state.
    pub fn start(&self, session_id: Option<&str>) -> Result<(), StoreError> {
        store::save_json(&self.seen, &SessionSeen::default())?;
        let marker = session_id.map(str::trim).unwrap_or_default();
        atomic_write(&self.session_id, marker.as_bytes()).map_err(|source| StoreError::Io {
            path: self.session_id.clone(),
            source,
        })?;
        tracing::debug!(session = marker, "session state reset");
        Ok(())
    }

    /// Seen state for `session_id`. A different id than the recorded one
    /// starts a fresh session; unreadable state is treated as empty.
    pub fn open(&self, session_id: Option<&str>) -> Result<SessionSeen, StoreError> {
        if let Some(session_id) = session_id.map(str::trim).filter(|id| !id.is_empty()) {
            if self.recorded_session().as_deref() != Some(session_id) {
                self.start(Some(session_id))?;
                return Ok(SessionSeen::default());
            }
        }
        Ok(store::load_json_or_default(&self.seen))
    }

    pub fn save(&self, seen: &SessionSeen) -> Result<(), StoreError> {
        store::save_json(&self.seen, seen)
    }

    fn recorded_session(&self) -> Option<String> {
        fs::read_to_string(&self.session_id)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }
}
