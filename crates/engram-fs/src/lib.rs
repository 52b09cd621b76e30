//! Atomic filesystem primitives.
//!
//! Every durable write in the workspace goes through [`write_atomic`]:
//! payload → temp file in the destination directory → fsync → rename.
//! Checksums are computed before the rename, so a usable path never points
//! at a partially written or corrupt file. Append-only NDJSON logs use
//! [`append_line`].

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use engram_error::{EngramError, Result};
use tracing::debug;

/// Write `bytes` to `path` atomically via a sibling temp file + rename.
///
/// Returns the CRC32C of the payload, computed before the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<u32> {
    let checksum = crc32c::crc32c(bytes);
    let tmp = tmp_sibling(path);
    {
        let mut file = File::create(&tmp).map_err(|e| EngramError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| EngramError::io(&tmp, e))?;
        file.sync_all().map_err(|e| EngramError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| EngramError::io(path, e))?;
    debug!(
        target: "engram.fs::write",
        path = %path.display(),
        bytes = bytes.len(),
        checksum,
        "atomic write"
    );
    Ok(checksum)
}

/// Read the full contents of `path`.
pub fn read(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut buf))
        .map_err(|e| EngramError::io(path, e))?;
    Ok(buf)
}

/// Read `path` as UTF-8 text.
pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| EngramError::io(path, e))
}

/// Append one line (a trailing `\n` is added) to `path`, creating it if
/// absent. The append is a single `write_all`, so concurrent appenders on
/// the same handle never interleave within a line.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngramError::io(path, e))?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    file.write_all(&buf).map_err(|e| EngramError::io(path, e))
}

/// Create `path` and every missing parent.
pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| EngramError::io(path, e))
}

/// Whether `path` exists as a regular file.
#[must_use]
pub fn is_file(path: &Path) -> bool {
    path.is_file()
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngramError::io(path, e)),
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "engram".to_string(), |n| n.to_string_lossy().into_owned());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("weights.bin");
        let payload = b"layer-one-bytes";
        let checksum = write_atomic(&path, payload).expect("write");
        assert_eq!(checksum, crc32c::crc32c(payload));
        assert_eq!(read(&path).expect("read"), payload);
        // No temp residue left behind.
        assert!(!dir.path().join("weights.bin.tmp").exists());
    }

    #[test]
    fn atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_atomic(&path, b"old").expect("first write");
        write_atomic(&path, b"new").expect("second write");
        assert_eq!(read(&path).expect("read"), b"new");
    }

    #[test]
    fn append_line_builds_ndjson() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        append_line(&path, "{\"a\":1}").expect("append");
        append_line(&path, "{\"a\":2}").expect("append");
        let text = read_to_string(&path).expect("read");
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        remove_file(&dir.path().join("nope")).expect("idempotent remove");
    }
}
