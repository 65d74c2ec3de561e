use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);
pub(crate) const TEMP_PREFIX: &str = ".motive.tmp.";

/// Replaces `path` with `bytes` so that readers observe either the previous
/// content or the new content, never a truncated file.
///
/// The hook worker and a foreground command may write the same state file;
/// each writer stages under its own name, so the last rename wins whole.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = staging_dir(path)?;
    fs::create_dir_all(dir)?;

    let staged = Staged::create(dir, path)?;
    staged.fill(bytes)?;
    staged.commit(path)?;
    sync_dir(dir)
}

/// Directory the staging file lives in. It must share a filesystem with the
/// target, so a bare filename stages in the current directory.
fn staging_dir(path: &Path) -> io::Result<&Path> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(Path::new(".")),
        Some(parent) => Ok(parent),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` has no parent directory", path.display()),
        )),
    }
}

/// A staging file that is removed on drop unless it was renamed into place.
struct Staged {
    path: PathBuf,
    file: File,
    committed: bool,
}

impl Staged {
    fn create(dir: &Path, target: &Path) -> io::Result<Self> {
        let path = dir.join(staging_name(target)?);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            committed: false,
        })
    }

    fn fill(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = &self.file;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    }

    fn commit(mut self, target: &Path) -> io::Result<()> {
        match fs::rename(&self.path, target) {
            Ok(()) => {}
            Err(err) if target.is_file() => {
                tracing::debug!(path = %target.display(), error = %err, "rename failed, retrying after removal");
                fs::remove_file(target)?;
                fs::rename(&self.path, target)?;
            }
            Err(err) => return Err(err),
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn staging_name(target: &Path) -> io::Result<String> {
    let name = target
        .file_name()
        .and_then(|value| value.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::other(err.to_string()))?
        .as_nanos();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    Ok(format!("{TEMP_PREFIX}{name}.{nanos}.{}.{seq}", std::process::id()))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
