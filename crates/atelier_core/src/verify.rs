//! Offline log verification.

use crate::dir::StoreDir;
use crate::error::CoreResult;
use crate::log::FrameReader;
use atelier_storage::FileBackend;
use std::path::Path;

/// Outcome of scanning a store's record log.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Complete, checksum-valid frames.
    pub frames: u64,
    /// Operations inside those frames.
    pub operations: u64,
    /// Log size on disk.
    pub log_bytes: u64,
    /// Offset just past the last valid frame.
    pub valid_bytes: u64,
    /// Fatal problem that stopped the scan, if any.
    pub error: Option<String>,
}

impl VerifyReport {
    /// True when every byte of the log belongs to a valid frame.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.valid_bytes == self.log_bytes
    }

    /// Bytes of a torn tail that the next open would cut away.
    #[must_use]
    pub fn torn_bytes(&self) -> u64 {
        if self.error.is_some() {
            0
        } else {
            self.log_bytes - self.valid_bytes
        }
    }
}

/// Scans the record log of the store at `path` without modifying it.
///
/// The directory lock is taken for the duration of the scan. Corruption is
/// reported in the [`VerifyReport`], not as an error.
///
/// # Errors
///
/// Fails if the directory cannot be opened or locked, or on I/O errors.
pub fn verify_store(path: &Path) -> CoreResult<VerifyReport> {
    let dir = StoreDir::open(path, false)?;
    let backend = FileBackend::open(&dir.log_path())?;
    let mut reader = FrameReader::new(&backend)?;
    let mut report = VerifyReport {
        log_bytes: reader.log_size(),
        ..VerifyReport::default()
    };

    for frame in reader.by_ref() {
        match frame {
            Ok(frame) => {
                report.frames += 1;
                report.operations += frame.ops.len() as u64;
            }
            Err(e) => {
                report.error = Some(e.to_string());
                break;
            }
        }
    }
    report.valid_bytes = reader.valid_end();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalStore;
    use atelier_model::{Entity, EntityBody, Role, Timestamp};
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn role() -> Entity {
        Entity::new_local(
            EntityBody::Role(Role {
                name: "cutter".into(),
                description: None,
                permissions: vec!["orders.write".into()],
            }),
            Timestamp::from_millis(5),
        )
    }

    #[test]
    fn clean_log() {
        let tmp = tempdir().unwrap();
        {
            let store = LocalStore::open(tmp.path()).unwrap();
            store.put(role()).unwrap();
            store.put(role()).unwrap();
        }

        let report = verify_store(tmp.path()).unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.operations, 2);
        assert!(report.is_clean());
    }

    #[test]
    fn reports_torn_tail_without_fixing_it() {
        let tmp = tempdir().unwrap();
        {
            let store = LocalStore::open(tmp.path()).unwrap();
            store.put(role()).unwrap();
        }
        let log = tmp.path().join("store.log");
        OpenOptions::new()
            .append(true)
            .open(&log)
            .unwrap()
            .write_all(b"ATLG")
            .unwrap();

        let report = verify_store(tmp.path()).unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(report.torn_bytes(), 4);
        assert!(!report.is_clean());
        assert_eq!(std::fs::metadata(&log).unwrap().len(), report.log_bytes);
    }

    #[test]
    fn reports_corruption() {
        let tmp = tempdir().unwrap();
        {
            let store = LocalStore::open(tmp.path()).unwrap();
            store.put(role()).unwrap();
        }
        let log = tmp.path().join("store.log");
        let mut bytes = std::fs::read(&log).unwrap();
        bytes[0] = b'X';
        std::fs::write(&log, bytes).unwrap();

        let report = verify_store(tmp.path()).unwrap();
        assert_eq!(report.frames, 0);
        assert!(report.error.unwrap().contains("invalid magic"));
    }
}
