use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{NutriLensError, Result};

/// Where the bearer token survives process restarts.
#[derive(Debug)]
pub enum TokenStore {
    /// A single-line file, readable by the owner only on unix.
    File(PathBuf),
    /// Process-local, nothing survives a restart.
    Memory(Mutex<Option<String>>),
}

impl TokenStore {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn memory() -> Self {
        Self::Memory(Mutex::new(None))
    }

    /// Read the persisted token. Missing or blank means "none persisted".
    pub fn load(&self) -> Result<Option<String>> {
        match self {
            Self::File(path) => match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let token = contents.trim();
                    Ok((!token.is_empty()).then(|| token.to_string()))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(NutriLensError::Storage(format!(
                    "failed to read token from {}: {e}",
                    path.display()
                ))),
            },
            Self::Memory(slot) => Ok(lock(slot).clone()),
        }
    }

    pub fn save(&self, token: &str) -> Result<()> {
        match self {
            Self::File(path) => write_private(path, token),
            Self::Memory(slot) => {
                *lock(slot) = Some(token.to_string());
                Ok(())
            }
        }
    }

    /// Remove the persisted token. Idempotent.
    pub fn clear(&self) -> Result<()> {
        match self {
            Self::File(path) => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(NutriLensError::Storage(format!(
                    "failed to remove token at {}: {e}",
                    path.display()
                ))),
            },
            Self::Memory(slot) => {
                *lock(slot) = None;
                Ok(())
            }
        }
    }
}

fn lock(slot: &Mutex<Option<String>>) -> std::sync::MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_private(path: &Path, token: &str) -> Result<()> {
    let storage_err =
        |e: std::io::Error| NutriLensError::Storage(format!("failed to write {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(storage_err)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    use std::io::Write;
    let mut file = options.open(path).map_err(storage_err)?;
    file.write_all(token.as_bytes()).map_err(storage_err)?;
    Ok(())
}
