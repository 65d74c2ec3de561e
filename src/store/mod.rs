pub mod atomic;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use atomic::atomic_write;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt state in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// Reads a JSON document. An absent file is `Ok(None)`; an unreadable or
/// malformed one is an error the caller decides how to recover from.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Like [`load_json`], but any failure falls back to `T::default()`.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match load_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "reinitializing unreadable state");
            T::default()
        }
    }
}

pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut rendered = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    rendered.push('\n');
    atomic_write(path, rendered.as_bytes()).map_err(|err| StoreError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn absent_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded: Option<BTreeMap<String, Vec<String>>> =
            load_json(&dir.path().join("missing.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn malformed_file_is_corrupt_and_defaults_when_lenient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("edit-log.json");
        fs::write(&path, "[{\"half\":").expect("seed");

        let err = load_json::<Vec<serde_json::Value>>(&path).expect_err("corrupt");
        assert!(err.is_corrupt());
        let lenient: Vec<serde_json::Value> = load_json_or_default(&path);
        assert!(lenient.is_empty());
    }

    #[test]
    fn saved_json_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("seen.json");
        let mut seen = BTreeMap::new();
        seen.insert("src/cli.py".to_string(), vec!["f-001".to_string()]);

        save_json(&path, &seen).expect("save");
        let loaded: BTreeMap<String, Vec<String>> =
            load_json(&path).expect("load").expect("present");
        assert_eq!(loaded, seen);
        assert!(fs::read_to_string(&path).expect("raw").ends_with('\n'));
    }
}
