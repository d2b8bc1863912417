//! Compact fixed-layout file record.

use std::fs::Metadata;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::pool::StringPool;
use crate::types::FileAttributes;

/// Sentinel for records whose size is not known (MFT-sourced entries the
/// stat pass missed).
pub const UNKNOWN_SIZE: i64 = -1;

/// Serialized width of one record: four u32 ids, four i64 fields and the
/// u32 attribute bitset, little-endian in field order.
pub const RECORD_WIRE_BYTES: usize = 52;

/// One indexed filesystem entry. All strings are interned; timestamps
/// are nanoseconds since the Unix epoch, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub full_path_id: u32,
    pub name_id: u32,
    pub dir_id: u32,
    /// 0 when the basename has no extension.
    pub ext_id: u32,
    /// Bytes; 0 for directories, [`UNKNOWN_SIZE`] when unavailable.
    pub size: i64,
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
    pub attrs: FileAttributes,
}

impl FileRecord {
    pub fn is_directory(&self) -> bool {
        self.attrs.contains(FileAttributes::DIRECTORY)
    }

    /// Build a record for `path` from an already-fetched `symlink_metadata`
    /// result, interning its path components.
    pub fn from_metadata(pool: &StringPool, path: &Path, meta: &Metadata) -> Result<FileRecord> {
        let path_str = path.to_string_lossy();
        let ids = pool.intern_path_components(&path_str)?;

        let is_dir = meta.is_dir();
        let mut attrs = FileAttributes::empty();
        if is_dir {
            attrs |= FileAttributes::DIRECTORY;
        }
        if meta.file_type().is_symlink() {
            attrs |= FileAttributes::SYMLINK;
        }
        if meta.permissions().readonly() {
            attrs |= FileAttributes::READONLY;
        }
        attrs |= platform_attrs(path, meta);

        Ok(FileRecord {
            full_path_id: ids.full_path_id,
            name_id: ids.name_id,
            dir_id: ids.dir_id,
            ext_id: if is_dir { crate::pool::EMPTY_ID } else { ids.ext_id },
            size: if is_dir { 0 } else { meta.len() as i64 },
            created: nanos_since_epoch(meta.created()),
            modified: nanos_since_epoch(meta.modified()),
            accessed: nanos_since_epoch(meta.accessed()),
            attrs,
        })
    }

    /// Field-order little-endian encoding, [`RECORD_WIRE_BYTES`] long.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.full_path_id.to_le_bytes());
        out.extend_from_slice(&self.name_id.to_le_bytes());
        out.extend_from_slice(&self.dir_id.to_le_bytes());
        out.extend_from_slice(&self.ext_id.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.created.to_le_bytes());
        out.extend_from_slice(&self.modified.to_le_bytes());
        out.extend_from_slice(&self.accessed.to_le_bytes());
        out.extend_from_slice(&self.attrs.bits().to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Option<FileRecord> {
        if data.len() < RECORD_WIRE_BYTES {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes(data[i..i + 4].try_into().unwrap());
        let i64_at = |i: usize| i64::from_le_bytes(data[i..i + 8].try_into().unwrap());
        Some(FileRecord {
            full_path_id: u32_at(0),
            name_id: u32_at(4),
            dir_id: u32_at(8),
            ext_id: u32_at(12),
            size: i64_at(16),
            created: i64_at(24),
            modified: i64_at(32),
            accessed: i64_at(40),
            attrs: FileAttributes::from_bits_truncate(u32_at(48)),
        })
    }
}

fn nanos_since_epoch(t: std::io::Result<SystemTime>) -> i64 {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn platform_attrs(path: &Path, _meta: &Metadata) -> FileAttributes {
    // POSIX hidden convention: dot-prefixed basename
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.starts_with('.') => FileAttributes::HIDDEN,
        _ => FileAttributes::empty(),
    }
}

#[cfg(windows)]
fn platform_attrs(_path: &Path, meta: &Metadata) -> FileAttributes {
    use std::os::windows::fs::MetadataExt;

    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
    const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;

    let raw = meta.file_attributes();
    let mut attrs = FileAttributes::empty();
    if raw & FILE_ATTRIBUTE_HIDDEN != 0 {
        attrs |= FileAttributes::HIDDEN;
    }
    if raw & FILE_ATTRIBUTE_SYSTEM != 0 {
        attrs |= FileAttributes::SYSTEM;
    }
    if raw & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
        attrs |= FileAttributes::REPARSE;
    }
    attrs
}

#[cfg(not(any(unix, windows)))]
fn platform_attrs(_path: &Path, _meta: &Metadata) -> FileAttributes {
    FileAttributes::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileRecord {
        FileRecord {
            full_path_id: 7,
            name_id: 8,
            dir_id: 9,
            ext_id: 10,
            size: 1234,
            created: 1,
            modified: 2,
            accessed: 3,
            attrs: FileAttributes::HIDDEN | FileAttributes::READONLY,
        }
    }

    #[test]
    fn wire_round_trip() {
        let rec = sample();
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        assert_eq!(buf.len(), RECORD_WIRE_BYTES);
        assert_eq!(FileRecord::decode(&buf), Some(rec));
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(FileRecord::decode(&[0u8; 10]), None);
    }

    #[test]
    fn negative_size_survives_round_trip() {
        let mut rec = sample();
        rec.size = UNKNOWN_SIZE;
        let mut buf = Vec::new();
        rec.encode_into(&mut buf);
        assert_eq!(FileRecord::decode(&buf).unwrap().size, UNKNOWN_SIZE);
    }

    #[test]
    fn from_metadata_builds_consistent_ids() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Sample.TXT");
        std::fs::write(&file, b"hello").unwrap();

        let pool = StringPool::new();
        let meta = std::fs::symlink_metadata(&file).unwrap();
        let rec = FileRecord::from_metadata(&pool, &file, &meta).unwrap();

        assert_eq!(rec.size, 5);
        assert!(!rec.is_directory());
        assert_eq!(pool.get(rec.name_id), "Sample.TXT");
        assert_eq!(pool.get(rec.ext_id), ".txt");
        let joined = crate::paths::join(pool.get(rec.dir_id), pool.get(rec.name_id));
        assert_eq!(joined, pool.get(rec.full_path_id));
        assert!(rec.modified > 0);
    }

    #[test]
    fn directories_have_zero_size_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("subdir");
        std::fs::create_dir(&sub).unwrap();

        let pool = StringPool::new();
        let meta = std::fs::symlink_metadata(&sub).unwrap();
        let rec = FileRecord::from_metadata(&pool, &sub, &meta).unwrap();
        assert!(rec.is_directory());
        assert_eq!(rec.size, 0);
        assert_eq!(rec.ext_id, crate::pool::EMPTY_ID);
    }
}
