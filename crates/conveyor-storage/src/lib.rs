// Crash-safe on-disk state for pipeline workers.
// Everything written here goes through `atomic_write`, so readers observe
// either the previous complete file or the new one.
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub mod persistor;

pub use persistor::{PersistedFile, PersistedHeader, Persistor};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Suffix of the scratch file written before the rename.
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub enum StorageError {
    NotFound(PathBuf),
    Corruption { path: PathBuf, reason: String },
    InvalidName(String),
    ReplicaOutOfRange { replica: usize, replicas: usize },
    Io(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(path) => write!(f, "not found: {}", path.display()),
            StorageError::Corruption { path, reason } => {
                write!(f, "corrupted file {}: {reason}", path.display())
            }
            StorageError::InvalidName(name) => write!(f, "invalid file name: {name:?}"),
            StorageError::ReplicaOutOfRange { replica, replicas } => {
                write!(f, "replica {replica} out of range ({replicas} replicas)")
            }
            StorageError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Writes `data` to `dir/name` so that a crash never leaves a partial file behind.
///
/// The bytes go to `dir/name.tmp`, which is fsynced and renamed over the target;
/// the directory is synced afterwards so the rename itself is durable.
///
/// ```
/// let dir = tempfile::tempdir().expect("tempdir");
/// conveyor_storage::atomic_write(dir.path(), "state", b"robin 0 1").expect("write");
/// let read = std::fs::read(dir.path().join("state")).expect("read");
/// assert_eq!(read, b"robin 0 1");
/// ```
pub fn atomic_write(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    validate_name(name)?;
    fs::create_dir_all(dir)?;
    let target = dir.join(name);
    let tmp = dir.join(format!("{name}{TMP_SUFFIX}"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &target)?;
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

// Names become single path components; scratch names are reserved.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let reserved = name.ends_with(TMP_SUFFIX) || name == "." || name == "..";
    if name.is_empty() || reserved || name.contains(&['/', '\\'][..]) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Removes `path` recursively; a missing directory is not an error.
pub fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
