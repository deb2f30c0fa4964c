//! Store directory management.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK         # Advisory lock for single-process access
//! └─ store.log    # Framed record log
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "store.log";

/// A locked store directory.
///
/// The exclusive lock is held for as long as this value lives.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens (and optionally creates) a store directory and locks it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidDirectory`] if the directory is missing and
    ///   `create_if_missing` is false, or if the path is not a directory
    /// - [`CoreError::StoreLocked`] if another handle holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_directory(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_directory(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the record log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_directory() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("shop");

        let dir = StoreDir::open(&path, true).unwrap();
        assert!(path.join("LOCK").exists());
        assert_eq!(dir.log_path(), path.join("store.log"));
    }

    #[test]
    fn missing_directory_without_create() {
        let tmp = tempdir().unwrap();
        let err = StoreDir::open(&tmp.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDirectory { .. }));
    }

    #[test]
    fn second_open_is_locked_out() {
        let tmp = tempdir().unwrap();
        let _first = StoreDir::open(tmp.path(), true).unwrap();

        let err = StoreDir::open(tmp.path(), true).unwrap_err();
        assert!(matches!(err, CoreError::StoreLocked));
    }

    #[test]
    fn lock_released_on_drop() {
        let tmp = tempdir().unwrap();
        drop(StoreDir::open(tmp.path(), true).unwrap());
        assert!(StoreDir::open(tmp.path(), true).is_ok());
    }

    #[test]
    fn file_path_is_rejected() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let err = StoreDir::open(&file, true).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDirectory { .. }));
    }
}
