//! On-disk record files (`vectors/*.rec`).
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! magic "EGRV" | version u32 | dim u32 | tier u8 | codec u8 | codebook u32
//! created_at u64 | updated_at u64
//! id_len u32    | id bytes
//! meta_len u32  | metadata JSON
//! body_len u32  | payload bytes
//! crc32c u32 over everything above
//! ```
//!
//! Writes go through `engram_fs::write_atomic`; the checksum is part of the
//! payload handed to the atomic writer, so it exists before the rename.

use std::path::{Path, PathBuf};

use engram_error::{EngramError, Result};
use engram_types::{CompressionTier, Metadata, VectorCodec, VectorId};
use tracing::warn;

use crate::store::{Slot, StoredPayload, VectorStore};

const MAGIC: &[u8; 4] = b"EGRV";
const VERSION: u32 = 1;
const NO_CODEBOOK: u32 = u32::MAX;

fn codec_to_u8(codec: VectorCodec) -> u8 {
    match codec {
        VectorCodec::F32 => 0,
        VectorCodec::F16 => 1,
        VectorCodec::Pq8 => 2,
        VectorCodec::Pq4 => 3,
        VectorCodec::Binary1 => 4,
        VectorCodec::Int8 => 5,
    }
}

fn codec_from_u8(path: &Path, value: u8) -> Result<VectorCodec> {
    match value {
        0 => Ok(VectorCodec::F32),
        1 => Ok(VectorCodec::F16),
        2 => Ok(VectorCodec::Pq8),
        3 => Ok(VectorCodec::Pq4),
        4 => Ok(VectorCodec::Binary1),
        5 => Ok(VectorCodec::Int8),
        other => Err(EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: format!("unknown codec tag {other}"),
        }),
    }
}

fn tier_to_u8(tier: CompressionTier) -> u8 {
    tier.index() as u8
}

fn tier_from_u8(path: &Path, value: u8) -> Result<CompressionTier> {
    CompressionTier::ALL
        .get(value as usize)
        .copied()
        .ok_or_else(|| EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: format!("unknown tier tag {value}"),
        })
}

/// File name for a record: sanitized id plus a CRC discriminator so two ids
/// that sanitize identically never collide.
#[must_use]
pub fn record_path(dir: &Path, id: &VectorId) -> PathBuf {
    let sanitized: String = id
        .as_str()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    let disc = crc32c::crc32c(id.as_str().as_bytes());
    dir.join(format!("{sanitized}_{disc:08x}.rec"))
}

#[derive(Debug)]
struct RecordFile {
    id: VectorId,
    payload: StoredPayload,
    metadata: Metadata,
    tier: CompressionTier,
    created_at: u64,
    updated_at: u64,
}

fn encode(dim: usize, record: &RecordFile) -> Result<Vec<u8>> {
    let meta_json = serde_json::to_vec(&record.metadata)
        .map_err(|err| EngramError::Internal(format!("metadata serialize: {err}")))?;
    let id_bytes = record.id.as_str().as_bytes();
    let mut out = Vec::with_capacity(64 + id_bytes.len() + meta_json.len() + record.payload.bytes.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(dim as u32).to_le_bytes());
    out.push(tier_to_u8(record.tier));
    out.push(codec_to_u8(record.payload.codec));
    out.extend_from_slice(&record.payload.codebook.unwrap_or(NO_CODEBOOK).to_le_bytes());
    out.extend_from_slice(&record.created_at.to_le_bytes());
    out.extend_from_slice(&record.updated_at.to_le_bytes());
    out.extend_from_slice(&(id_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta_json);
    out.extend_from_slice(&(record.payload.bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&record.payload.bytes);
    let crc = crc32c::crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(EngramError::CorruptRecord {
                path: self.path.to_path_buf(),
                detail: format!("truncated at offset {}", self.pos),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

fn decode(path: &Path, bytes: &[u8], expected_dim: usize) -> Result<RecordFile> {
    if bytes.len() < MAGIC.len() + 4 {
        return Err(EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: "file shorter than header".to_string(),
        });
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = crc32c::crc32c(body);
    if stored != computed {
        return Err(EngramError::ChecksumMismatch {
            path: path.to_path_buf(),
            stored,
            computed,
        });
    }

    let mut cur = Cursor { path, bytes: body, pos: 0 };
    if cur.take(4)? != MAGIC {
        return Err(EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: "bad magic".to_string(),
        });
    }
    let version = cur.u32()?;
    if version != VERSION {
        return Err(EngramError::VersionMismatch {
            path: path.to_path_buf(),
            supported: VERSION,
            found: version,
        });
    }
    let dim = cur.u32()? as usize;
    if dim != expected_dim {
        return Err(EngramError::DimensionMismatch {
            expected: expected_dim,
            actual: dim,
        });
    }
    let tier = tier_from_u8(path, cur.u8()?)?;
    let codec = codec_from_u8(path, cur.u8()?)?;
    let codebook_raw = cur.u32()?;
    let created_at = cur.u64()?;
    let updated_at = cur.u64()?;
    let id_len = cur.u32()? as usize;
    let id = String::from_utf8(cur.take(id_len)?.to_vec()).map_err(|_| EngramError::CorruptRecord {
        path: path.to_path_buf(),
        detail: "id is not UTF-8".to_string(),
    })?;
    let meta_len = cur.u32()? as usize;
    let metadata: Metadata =
        serde_json::from_slice(cur.take(meta_len)?).map_err(|err| EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: format!("metadata parse: {err}"),
        })?;
    let body_len = cur.u32()? as usize;
    let payload_bytes = cur.take(body_len)?.to_vec();

    Ok(RecordFile {
        id: VectorId::from(id),
        payload: StoredPayload {
            codec,
            bytes: payload_bytes,
            codebook: if codebook_raw == NO_CODEBOOK {
                None
            } else {
                Some(codebook_raw)
            },
        },
        metadata,
        tier,
        created_at,
        updated_at,
    })
}

/// Persist every record in `store` under `dir` (one `.rec` per record).
pub fn save_all(store: &VectorStore, dir: &Path) -> Result<usize> {
    engram_fs::create_dir_all(dir)?;
    let records = store.raw_slots().read();
    let mut written = 0usize;
    for (id, slot) in records.iter() {
        let record = RecordFile {
            id: id.clone(),
            payload: slot.payload.clone(),
            metadata: slot.metadata.clone(),
            tier: slot.tier,
            created_at: slot.created_at,
            updated_at: slot.updated_at,
        };
        let bytes = encode(store.dim(), &record)?;
        engram_fs::write_atomic(&record_path(dir, id), &bytes)?;
        written += 1;
    }
    Ok(written)
}

/// Load every `.rec` file in `dir` into `store`, replacing collisions.
///
/// Unreadable files are skipped with a warning; a dimension mismatch is
/// fatal because it means the process is configured against foreign data.
pub fn load_all(store: &VectorStore, dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let entries = std::fs::read_dir(dir).map_err(|e| EngramError::io(dir, e))?;
    let mut loaded = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| EngramError::io(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("rec") {
            continue;
        }
        let bytes = engram_fs::read(&path)?;
        match decode(&path, &bytes, store.dim()) {
            Ok(record) => {
                store.restore_slot(
                    record.id.clone(),
                    Slot {
                        payload: record.payload,
                        metadata: record.metadata,
                        tier: record.tier,
                        created_at: record.created_at,
                        updated_at: record.updated_at,
                    },
                );
                loaded += 1;
            }
            Err(err @ EngramError::DimensionMismatch { .. }) => return Err(err),
            Err(err) => {
                warn!(
                    target: "engram.vector::persist",
                    path = %path.display(),
                    error = %err,
                    "skipping unreadable record file"
                );
            }
        }
    }
    Ok(loaded)
}
