//! Log frame layout and operations.

use crate::codec;
use crate::error::{CoreError, CoreResult};
use atelier_model::{Entity, EntityId, EntityKind};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"ATLG";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
pub const HEADER_SIZE: usize = 10;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Largest payload a frame can carry (the length field is 4 bytes).
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// One mutation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Insert or replace an entity.
    Put(Entity),
    /// Physically remove an entity.
    Remove {
        /// Kind of the removed entity.
        kind: EntityKind,
        /// Removed identifier.
        id: EntityId,
    },
    /// Move an entity to a new identifier, keeping its list position.
    Rename {
        /// Kind of the renamed entity.
        kind: EntityKind,
        /// Old identifier.
        from: EntityId,
        /// New identifier.
        to: EntityId,
    },
    /// Set a value in an auxiliary keyspace.
    PutAux {
        /// Keyspace name.
        ns: String,
        /// Key inside the keyspace.
        key: u64,
        /// Opaque value.
        value: Vec<u8>,
    },
    /// Remove a value from an auxiliary keyspace.
    RemoveAux {
        /// Keyspace name.
        ns: String,
        /// Key inside the keyspace.
        key: u64,
    },
}

/// Encodes a batch of operations as one frame.
///
/// # Errors
///
/// Fails if the batch cannot be serialized or exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_frame(ops: &[LogOp]) -> CoreResult<Vec<u8>> {
    let payload = codec::encode(ops)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CoreError::invalid_operation(format!(
            "transaction too large: {} bytes exceeds maximum of {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parses a frame header at `offset`, returning the payload length.
///
/// # Errors
///
/// Fails with [`CoreError::LogCorruption`] on bad magic or an unknown version.
pub fn parse_header(offset: u64, header: &[u8]) -> CoreResult<usize> {
    if header.len() < HEADER_SIZE {
        return Err(CoreError::log_corruption(offset, "short frame header"));
    }
    if header[0..4] != FRAME_MAGIC {
        return Err(CoreError::log_corruption(offset, "invalid magic bytes"));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FRAME_VERSION {
        return Err(CoreError::log_corruption(
            offset,
            format!("unsupported frame version {version}"),
        ));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
    Ok(len as usize)
}

/// Verifies the checksum of a complete frame and decodes its operations.
///
/// # Errors
///
/// Fails with [`CoreError::ChecksumMismatch`] or a codec error.
pub fn decode_frame(offset: u64, frame: &[u8]) -> CoreResult<Vec<LogOp>> {
    let len = parse_header(offset, frame)?;
    if frame.len() != HEADER_SIZE + len + CRC_SIZE {
        return Err(CoreError::log_corruption(offset, "frame length mismatch"));
    }

    let body_end = HEADER_SIZE + len;
    let stored = u32::from_le_bytes([
        frame[body_end],
        frame[body_end + 1],
        frame[body_end + 2],
        frame[body_end + 3],
    ]);
    let computed = compute_crc32(&frame[..body_end]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            offset,
            expected: stored,
            actual: computed,
        });
    }

    codec::decode(&frame[HEADER_SIZE..body_end])
        .map_err(|e| CoreError::log_corruption(offset, format!("undecodable payload: {e}")))
}

/// Computes a CRC32 (IEEE) checksum.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}
