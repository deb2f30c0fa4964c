//! Sequential frame reader used for recovery and verification.

use crate::error::CoreResult;
use crate::log::frame::{decode_frame, parse_header, LogOp, CRC_SIZE, HEADER_SIZE};
use atelier_storage::StorageBackend;

/// A decoded frame and where it sits in the log.
#[derive(Debug)]
pub struct Frame {
    /// Offset of the frame header.
    pub offset: u64,
    /// Total encoded size including header and checksum.
    pub len: u64,
    /// Operations committed by the frame.
    pub ops: Vec<LogOp>,
}

/// Iterates over complete frames of a log.
///
/// A trailing frame cut short by a crash (header or body shorter than
/// announced) ends iteration cleanly; [`FrameReader::valid_end`] then points
/// at its start. Bad magic, unknown versions and checksum mismatches are
/// returned as errors and stop iteration.
pub struct FrameReader<'a> {
    backend: &'a dyn StorageBackend,
    size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> FrameReader<'a> {
    /// Creates a reader over the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            size: backend.size()?,
            backend,
            offset: 0,
            finished: false,
        })
    }

    /// Offset just past the last complete frame read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Total log size seen when the reader was created.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.size
    }

    fn read_next(&mut self) -> CoreResult<Option<Frame>> {
        let remaining = self.size - self.offset;
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(self.offset, HEADER_SIZE)?;
        let payload_len = parse_header(self.offset, &header)?;
        let frame_len = (HEADER_SIZE + payload_len + CRC_SIZE) as u64;
        if frame_len > remaining {
            return Ok(None);
        }

        let bytes = self.backend.read_at(self.offset, frame_len as usize)?;
        let ops = decode_frame(self.offset, &bytes)?;
        let frame = Frame {
            offset: self.offset,
            len: frame_len,
            ops,
        };
        self.offset += frame_len;
        Ok(Some(frame))
    }
}

impl Iterator for FrameReader<'_> {
    type Item = CoreResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::log::frame::encode_frame;
    use atelier_storage::InMemoryBackend;

    fn op(key: u64) -> LogOp {
        LogOp::RemoveAux {
            ns: "q".into(),
            key,
        }
    }

    fn backend_with(frames: &[Vec<LogOp>]) -> InMemoryBackend {
        let mut backend = InMemoryBackend::new();
        for ops in frames {
            backend.append(&encode_frame(ops).unwrap()).unwrap();
        }
        backend
    }

    #[test]
    fn reads_all_frames() {
        let backend = backend_with(&[vec![op(1)], vec![op(2), op(3)]]);
        let mut reader = FrameReader::new(&backend).unwrap();

        let frames: Vec<Frame> = reader.by_ref().collect::<CoreResult<_>>().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].ops.len(), 2);
        assert_eq!(frames[1].offset, frames[0].len);
        assert_eq!(reader.valid_end(), reader.log_size());
    }

    #[test]
    fn torn_tail_ends_cleanly() {
        let mut backend = backend_with(&[vec![op(1)]]);
        let good_end = backend.size().unwrap();
        let second = encode_frame(&[op(2)]).unwrap();
        backend.append(&second[..second.len() - 3]).unwrap();

        let mut reader = FrameReader::new(&backend).unwrap();
        assert_eq!(reader.by_ref().count(), 1);
        assert_eq!(reader.valid_end(), good_end);
        assert!(reader.log_size() > good_end);
    }

    #[test]
    fn torn_header_ends_cleanly() {
        let mut backend = backend_with(&[vec![op(1)]]);
        backend.append(b"ATL").unwrap();

        let mut reader = FrameReader::new(&backend).unwrap();
        assert_eq!(reader.by_ref().filter(Result::is_ok).count(), 1);
    }

    #[test]
    fn corruption_in_body_is_fatal() {
        let mut bytes = backend_with(&[vec![op(1)], vec![op(2)]]).data();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        let backend = InMemoryBackend::with_data(bytes);

        let results: Vec<_> = FrameReader::new(&backend).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }
}
