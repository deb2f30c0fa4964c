//! Framed record log.
//!
//! Every committed transaction is appended as exactly one frame:
//!
//! ```text
//! | magic "ATLG" (4) | version (2) | length (4) | CBOR payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of the transaction's `Vec<LogOp>`, so a
//! transaction is either fully in the log or not at all.
//!
//! ## Recovery Policy
//!
//! - **Tolerated**: a trailing frame shorter than its header or its announced
//!   length. That is a crash mid-append; the partial bytes are cut away.
//! - **Fatal**: bad magic, unknown version, checksum mismatch or undecodable
//!   payload anywhere. The store refuses to open instead of silently dropping
//!   committed data.

mod frame;
mod reader;

pub use frame::{compute_crc32, encode_frame, LogOp, FRAME_MAGIC, FRAME_VERSION};
pub use reader::{Frame, FrameReader};

use crate::error::CoreResult;
use atelier_storage::StorageBackend;

/// Appends frames to the backend.
pub(crate) struct LogWriter {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
    /// Size right after the last compaction (or open).
    baseline: u64,
}

impl LogWriter {
    pub(crate) fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> CoreResult<Self> {
        let baseline = backend.size()?;
        Ok(Self {
            backend,
            sync_on_commit,
            baseline,
        })
    }

    pub(crate) fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    pub(crate) fn truncate(&mut self, size: u64) -> CoreResult<()> {
        self.backend.truncate(size)?;
        self.backend.sync()?;
        self.baseline = size;
        Ok(())
    }

    /// Appends one commit frame and makes it durable per configuration.
    ///
    /// On failure the log is cut back to its previous size so a half-written
    /// frame never sits in front of later commits. Returns the frame size.
    pub(crate) fn append(&mut self, ops: &[LogOp]) -> CoreResult<u64> {
        let frame = encode_frame(ops)?;
        let before = self.backend.size()?;
        if let Err(e) = self.write_durably(&frame) {
            if let Err(cleanup) = self.backend.truncate(before) {
                tracing::error!(error = %cleanup, offset = before, "failed to cut back failed commit");
            }
            return Err(e);
        }
        Ok(frame.len() as u64)
    }

    fn write_durably(&mut self, frame: &[u8]) -> CoreResult<()> {
        self.backend.append(frame)?;
        self.backend.flush()?;
        if self.sync_on_commit {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Swaps the log for a single snapshot frame.
    pub(crate) fn replace(&mut self, ops: &[LogOp]) -> CoreResult<u64> {
        let frame = encode_frame(ops)?;
        self.backend.replace(&frame)?;
        self.baseline = frame.len() as u64;
        Ok(self.baseline)
    }

    /// Whether the log has grown enough past its last compaction to warrant
    /// another one.
    pub(crate) fn wants_compaction(&self, threshold: u64) -> CoreResult<bool> {
        if threshold == 0 {
            return Ok(false);
        }
        let size = self.size()?;
        Ok(size >= threshold && size >= self.baseline.saturating_mul(2))
    }
}
