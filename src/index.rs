//! The in-memory index: an append-only record vector with auxiliary
//! lookup structures and a binary snapshot format.
//!
//! Readers never block the writer: the whole [`IndexState`] sits behind
//! `RwLock<Arc<..>>`; the single writer (serialized by a mutex) clones
//! the current state, applies a batch of mutations and publishes the new
//! `Arc`, while in-flight scans finish against the snapshot they
//! captured.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::monitor::{ChangeEvent, ChangeKind};
use crate::paths;
use crate::pool::{self, InternedPath, StringPool};
use crate::record::{FileRecord, RECORD_WIRE_BYTES};
use crate::types::IndexingOptions;

const SNAPSHOT_MAGIC: &[u8; 8] = b"FFINDX01";
const SNAPSHOT_VERSION: u32 = 1;

/// Bits in the name Bloom filter (power of two).
const BLOOM_BITS: usize = 1 << 22;
const BLOOM_HASHES: u64 = 2;

/// Bloom filter over the 3-grams of folded basenames. A substring query
/// whose needle contains a gram absent from the filter cannot match any
/// indexed name. False positives only; rebuilt on optimize/restore.
#[derive(Clone)]
pub(crate) struct NameBloom {
    bits: Vec<u64>,
}

impl NameBloom {
    fn new() -> Self {
        NameBloom { bits: vec![0; BLOOM_BITS / 64] }
    }

    fn insert_gram(&mut self, gram: &[u8]) {
        let h1 = pool::xxhash64(gram);
        let h2 = (h1 >> 32) | 1;
        for i in 0..BLOOM_HASHES {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) as usize) & (BLOOM_BITS - 1);
            self.bits[bit / 64] |= 1 << (bit % 64);
        }
    }

    fn has_gram(&self, gram: &[u8]) -> bool {
        let h1 = pool::xxhash64(gram);
        let h2 = (h1 >> 32) | 1;
        (0..BLOOM_HASHES).all(|i| {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) as usize) & (BLOOM_BITS - 1);
            self.bits[bit / 64] & (1 << (bit % 64)) != 0
        })
    }

    pub(crate) fn insert_name(&mut self, folded_name: &str) {
        for gram in folded_name.as_bytes().windows(3) {
            self.insert_gram(gram);
        }
    }

    /// `false` means no indexed name can contain `folded_needle`.
    /// Needles shorter than one gram are never rejected.
    pub(crate) fn may_contain(&self, folded_needle: &str) -> bool {
        let bytes = folded_needle.as_bytes();
        if bytes.len() < 3 {
            return true;
        }
        bytes.windows(3).all(|g| self.has_gram(g))
    }
}

/// One immutable published version of the index.
#[derive(Clone)]
pub struct IndexState {
    records: Vec<FileRecord>,
    /// full_path_id -> slot; never holds tombstoned slots
    by_path: HashMap<u32, u32>,
    /// ext_id -> slots in insertion order; may hold stale slots until
    /// the next optimize
    ext_buckets: HashMap<u32, Vec<u32>>,
    bloom: NameBloom,
    tombstones: u32,
}

impl IndexState {
    fn empty() -> Self {
        IndexState {
            records: Vec::new(),
            by_path: HashMap::new(),
            ext_buckets: HashMap::new(),
            bloom: NameBloom::new(),
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len() - self.tombstones as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub(crate) fn bloom(&self) -> &NameBloom {
        &self.bloom
    }

    /// Live records in insertion order.
    pub fn iter_live(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter().filter(|r| r.full_path_id != pool::EMPTY_ID)
    }

    /// Raw slot list of one extension bucket; may contain stale entries
    /// until the next optimize.
    pub(crate) fn ext_slots(&self, ext_id: u32) -> &[u32] {
        self.ext_buckets.get(&ext_id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Counters reported by [`Index::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub live_records: u64,
    pub tombstones: u64,
    pub files: u64,
    pub directories: u64,
    pub extension_buckets: u64,
}

pub struct Index {
    pool: Arc<StringPool>,
    state: RwLock<Arc<IndexState>>,
    writer: Mutex<()>,
}

impl Index {
    pub fn new(pool: Arc<StringPool>) -> Self {
        Index {
            pool,
            state: RwLock::new(Arc::new(IndexState::empty())),
            writer: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &Arc<StringPool> {
        &self.pool
    }

    /// Capture the current published state. Scans over the returned
    /// snapshot are unaffected by concurrent writes.
    pub fn snapshot_state(&self) -> Arc<IndexState> {
        Arc::clone(&self.state.read())
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.snapshot_state();
        let mut files = 0u64;
        let mut directories = 0u64;
        for rec in state.iter_live() {
            if rec.is_directory() {
                directories += 1;
            } else {
                files += 1;
            }
        }
        IndexStats {
            live_records: state.len() as u64,
            tombstones: state.tombstones as u64,
            files,
            directories,
            extension_buckets: state.ext_buckets.len() as u64,
        }
    }

    /// Linear scan over the current snapshot, tombstones skipped.
    /// Concurrent writers do not affect a scan in flight.
    pub fn scan(&self) -> impl Iterator<Item = FileRecord> {
        let state = self.snapshot_state();
        let mut pos = 0;
        std::iter::from_fn(move || {
            while let Some(rec) = state.records.get(pos) {
                pos += 1;
                if rec.full_path_id != pool::EMPTY_ID {
                    return Some(*rec);
                }
            }
            None
        })
    }

    /// Walk one extension bucket of the current snapshot, skipping
    /// entries gone stale since the last optimize.
    pub fn scan_by_extension(&self, ext_id: u32) -> impl Iterator<Item = FileRecord> {
        let state = self.snapshot_state();
        let mut pos = 0;
        std::iter::from_fn(move || loop {
            let slot = *state.ext_slots(ext_id).get(pos)?;
            pos += 1;
            let rec = state.records[slot as usize];
            if rec.full_path_id != pool::EMPTY_ID && rec.ext_id == ext_id {
                return Some(rec);
            }
        })
    }

    /// Open a write batch. Exactly one writer is active at a time; the
    /// batch publishes atomically on [`WriteBatch::commit`].
    pub fn begin_write(&self) -> WriteBatch<'_> {
        let guard = self.writer.lock();
        let state = (**self.state.read()).clone();
        WriteBatch { index: self, _guard: guard, state }
    }

    /// Upsert a single record (one-record batch).
    pub fn insert(&self, record: FileRecord) {
        let mut batch = self.begin_write();
        batch.upsert(record);
        batch.commit();
    }

    /// Patch a live record in place. Identity ids must not change
    /// through the patch; renames go through [`ChangeEvent`]s.
    pub fn update(&self, full_path_id: u32, patch: impl FnOnce(&mut FileRecord)) -> bool {
        let mut batch = self.begin_write();
        let hit = batch.update(full_path_id, patch);
        batch.commit();
        hit
    }

    /// Tombstone a record. Compaction is deferred to [`Index::optimize`].
    pub fn remove(&self, full_path_id: u32) -> bool {
        let mut batch = self.begin_write();
        let hit = batch.remove(full_path_id);
        batch.commit();
        hit
    }

    /// Apply one change event. `opts` supplies the filter set used when
    /// a `Resync` re-enumerates a subtree.
    pub fn apply(&self, event: &ChangeEvent, opts: &IndexingOptions) -> Result<()> {
        let mut batch = self.begin_write();
        batch.apply(event, opts)?;
        batch.commit();
        Ok(())
    }

    /// Compact tombstones and rebuild the extension buckets and Bloom
    /// filter.
    pub fn optimize(&self) {
        let guard = self.writer.lock();
        let old = self.snapshot_state();
        let mut fresh = IndexState::empty();
        for rec in old.iter_live() {
            push_record(&mut fresh, &self.pool, *rec);
        }
        debug!(
            "optimize: {} live records, {} tombstones dropped",
            fresh.records.len(),
            old.tombstones
        );
        *self.state.write() = Arc::new(fresh);
        drop(guard);
    }

    /// Serialize records, extension buckets and pool contents to the
    /// bit-exact snapshot format.
    pub fn save_snapshot<W: Write>(&self, writer: &mut W) -> Result<()> {
        let _guard = self.writer.lock();
        let state = self.snapshot_state();

        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // flags

        let mut string_count: u64 = 0;
        self.pool.for_each_string(|_| string_count += 1);
        buf.extend_from_slice(&string_count.to_le_bytes());
        self.pool.for_each_string(|s| {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        });

        buf.extend_from_slice(&(state.records.len() as u64).to_le_bytes());
        for rec in &state.records {
            rec.encode_into(&mut buf);
        }

        buf.extend_from_slice(&(state.ext_buckets.len() as u32).to_le_bytes());
        let mut ext_ids: Vec<u32> = state.ext_buckets.keys().copied().collect();
        ext_ids.sort_unstable();
        for ext_id in ext_ids {
            let slots = &state.ext_buckets[&ext_id];
            buf.extend_from_slice(&ext_id.to_le_bytes());
            buf.extend_from_slice(&(slots.len() as u32).to_le_bytes());
            for &slot in slots {
                buf.extend_from_slice(&slot.to_le_bytes());
            }
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }

    /// Rebuild an index (with a fresh pool) from a snapshot stream. Any
    /// magic/version/flags/CRC mismatch fails with `Format` and nothing
    /// is constructed.
    pub fn restore<R: Read>(reader: &mut R) -> Result<Index> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if data.len() < 4 {
            return Err(Error::Format("snapshot truncated".to_string()));
        }
        let (body, crc_bytes) = data.split_at(data.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes"));
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(Error::Format("snapshot checksum mismatch".to_string()));
        }

        let mut cursor = Cursor { data: body, pos: 0 };
        let magic = cursor.take(8)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Format("bad snapshot magic".to_string()));
        }
        let version = cursor.read_u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::Format(format!("unsupported snapshot version {version}")));
        }
        let flags = cursor.read_u32()?;
        if flags != 0 {
            return Err(Error::Format(format!("unknown snapshot flags {flags:#x}")));
        }

        let pool = Arc::new(StringPool::new());
        let string_count = cursor.read_u64()?;
        for _ in 0..string_count {
            let len = cursor.read_u32()? as usize;
            let bytes = cursor.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::Format("snapshot string is not UTF-8".to_string()))?;
            pool.intern(s)?;
        }

        let record_count = cursor.read_u64()? as usize;
        let mut state = IndexState::empty();
        state.records.reserve(record_count);
        for _ in 0..record_count {
            let bytes = cursor.take(RECORD_WIRE_BYTES)?;
            let rec = FileRecord::decode(bytes)
                .ok_or_else(|| Error::Format("snapshot record truncated".to_string()))?;
            state.records.push(rec);
        }

        let bucket_count = cursor.read_u32()?;
        for _ in 0..bucket_count {
            let ext_id = cursor.read_u32()?;
            let count = cursor.read_u32()? as usize;
            let mut slots = Vec::with_capacity(count);
            for _ in 0..count {
                let slot = cursor.read_u32()?;
                if slot as usize >= record_count {
                    return Err(Error::Format(format!(
                        "snapshot bucket slot {slot} out of range"
                    )));
                }
                slots.push(slot);
            }
            state.ext_buckets.insert(ext_id, slots);
        }
        if cursor.pos != cursor.data.len() {
            return Err(Error::Format("trailing bytes after snapshot".to_string()));
        }

        // derived structures
        let mut bloom = NameBloom::new();
        for (slot, rec) in state.records.iter().enumerate() {
            if rec.full_path_id == pool::EMPTY_ID {
                state.tombstones += 1;
                continue;
            }
            state.by_path.insert(rec.full_path_id, slot as u32);
            bloom.insert_name(pool.get_folded(rec.name_id));
        }
        state.bloom = bloom;

        debug!(
            "snapshot restored: {} records ({} tombstones), {} strings",
            state.records.len(),
            state.tombstones,
            string_count
        );
        Ok(Index {
            pool,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Format("snapshot truncated".to_string()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}

fn push_record(state: &mut IndexState, pool: &StringPool, rec: FileRecord) {
    let slot = state.records.len() as u32;
    state.by_path.insert(rec.full_path_id, slot);
    if rec.ext_id != pool::EMPTY_ID {
        state.ext_buckets.entry(rec.ext_id).or_default().push(slot);
    }
    state.bloom.insert_name(pool.get_folded(rec.name_id));
    state.records.push(rec);
}

/// A batch of mutations against a private clone of the state; nothing is
/// visible to readers until `commit`.
pub struct WriteBatch<'a> {
    index: &'a Index,
    _guard: MutexGuard<'a, ()>,
    state: IndexState,
}

impl WriteBatch<'_> {
    /// Insert, or replace the live record with the same `full_path_id`.
    pub fn upsert(&mut self, rec: FileRecord) {
        match self.state.by_path.get(&rec.full_path_id) {
            Some(&slot) => {
                let slot = slot as usize;
                let old_ext = self.state.records[slot].ext_id;
                if old_ext != rec.ext_id {
                    self.move_ext_bucket(slot as u32, old_ext, rec.ext_id);
                }
                self.state.bloom.insert_name(self.index.pool.get_folded(rec.name_id));
                self.state.records[slot] = rec;
            }
            None => push_record(&mut self.state, &self.index.pool, rec),
        }
    }

    pub fn update(&mut self, full_path_id: u32, patch: impl FnOnce(&mut FileRecord)) -> bool {
        match self.state.by_path.get(&full_path_id) {
            Some(&slot) => {
                let rec = &mut self.state.records[slot as usize];
                patch(rec);
                debug_assert_eq!(rec.full_path_id, full_path_id);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, full_path_id: u32) -> bool {
        match self.state.by_path.remove(&full_path_id) {
            Some(slot) => {
                self.state.records[slot as usize].full_path_id = pool::EMPTY_ID;
                self.state.tombstones += 1;
                true
            }
            None => false,
        }
    }

    /// Re-point a live record at a new path, moving every derived
    /// structure with it.
    pub fn rename(&mut self, old_full_path_id: u32, new: InternedPath) -> bool {
        let Some(slot) = self.state.by_path.remove(&old_full_path_id) else {
            return false;
        };
        // the new path may shadow an existing record; drop that one
        if let Some(shadowed) = self.state.by_path.remove(&new.full_path_id) {
            self.state.records[shadowed as usize].full_path_id = pool::EMPTY_ID;
            self.state.tombstones += 1;
        }
        let old_ext = self.state.records[slot as usize].ext_id;
        if old_ext != new.ext_id {
            self.move_ext_bucket(slot, old_ext, new.ext_id);
        }
        let rec = &mut self.state.records[slot as usize];
        rec.full_path_id = new.full_path_id;
        rec.name_id = new.name_id;
        rec.dir_id = new.dir_id;
        rec.ext_id = if rec.is_directory() { pool::EMPTY_ID } else { new.ext_id };
        self.state.by_path.insert(new.full_path_id, slot);
        self.state
            .bloom
            .insert_name(self.index.pool.get_folded(new.name_id));
        true
    }

    fn move_ext_bucket(&mut self, slot: u32, old_ext: u32, new_ext: u32) {
        if old_ext != pool::EMPTY_ID {
            if let Some(bucket) = self.state.ext_buckets.get_mut(&old_ext) {
                bucket.retain(|&s| s != slot);
            }
        }
        if new_ext != pool::EMPTY_ID {
            self.state.ext_buckets.entry(new_ext).or_default().push(slot);
        }
    }

    /// Tombstone every live record at or under `prefix` (normalized).
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let pool = &self.index.pool;
        let doomed: Vec<u32> = self
            .state
            .by_path
            .keys()
            .copied()
            .filter(|&fpid| paths::starts_with(pool.get(fpid), prefix))
            .collect();
        let n = doomed.len();
        for fpid in doomed {
            self.remove(fpid);
        }
        n
    }

    /// Stat `path` and upsert the result; `false` when it vanished.
    fn upsert_from_disk(&mut self, path: &Path) -> Result<bool> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => {
                let rec = FileRecord::from_metadata(&self.index.pool, path, &meta)?;
                self.upsert(rec);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Apply one change event to this batch.
    pub fn apply(&mut self, event: &ChangeEvent, opts: &IndexingOptions) -> Result<()> {
        match event.kind {
            ChangeKind::Created | ChangeKind::Modified => {
                if !self.upsert_from_disk(Path::new(&event.new_path))? {
                    // raced with a delete
                    let fpid = self.index.pool.intern(&paths::normalize(&event.new_path))?;
                    self.remove(fpid);
                }
            }
            ChangeKind::Deleted => {
                let norm = paths::normalize(&event.new_path);
                let fpid = self.index.pool.intern(&norm)?;
                let was_dir = self
                    .state
                    .by_path
                    .get(&fpid)
                    .map(|&slot| self.state.records[slot as usize].is_directory())
                    .unwrap_or(false);
                let removed = self.remove(fpid);
                // a deleted directory takes its subtree with it; an
                // unknown path may still name an indexed subtree
                if was_dir || !removed {
                    self.remove_prefix(&norm);
                }
            }
            ChangeKind::Renamed => {
                let old = event
                    .old_path
                    .as_deref()
                    .ok_or_else(|| Error::Format("rename event without old_path".to_string()))?;
                let old_fpid = self.index.pool.intern(&paths::normalize(old))?;
                let new_ids = self.index.pool.intern_path_components(&event.new_path)?;
                if !self.rename(old_fpid, new_ids) {
                    // old record unknown: either the rename was already
                    // applied (new path live) or we never saw the file
                    if !self.state.by_path.contains_key(&new_ids.full_path_id) {
                        self.upsert_from_disk(Path::new(&event.new_path))?;
                    }
                }
            }
            ChangeKind::Resync => {
                let root = paths::normalize(&event.new_path);
                let dropped = self.remove_prefix(&root);
                let added = self.reindex_subtree(&root, opts);
                debug!("resync {root}: {dropped} records dropped, {added} re-added");
            }
        }
        Ok(())
    }

    /// Walk `root` and upsert everything that passes the indexing
    /// filters. Per-entry errors are logged and skipped.
    fn reindex_subtree(&mut self, root: &str, opts: &IndexingOptions) -> usize {
        let excluded_exts = opts.normalized_excluded_extensions();
        let mut added = 0usize;
        let mut walker = walkdir::WalkDir::new(root).follow_links(false);
        if let Some(depth) = opts.max_depth {
            walker = walker.max_depth(depth);
        }
        let iter = walker.into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if !opts.include_hidden && name.starts_with('.') && entry.depth() > 0 {
                return false;
            }
            if opts.excluded_names.iter().any(|n| *n == name) {
                return false;
            }
            !opts
                .excluded_paths
                .iter()
                .any(|p| entry.path().starts_with(p))
        });
        for entry in iter {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("resync walk error under {root}: {e}");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("resync stat failed for {}: {e}", entry.path().display());
                    continue;
                }
            };
            if !meta.is_dir() {
                if let Some(ext) = paths::extension_of(&entry.file_name().to_string_lossy()) {
                    if excluded_exts.iter().any(|e| *e == ext) {
                        continue;
                    }
                }
                if let Some(max) = opts.max_file_size {
                    if meta.len() as i64 > max {
                        continue;
                    }
                }
            }
            match FileRecord::from_metadata(&self.index.pool, entry.path(), &meta) {
                Ok(rec) => {
                    self.upsert(rec);
                    added += 1;
                }
                Err(e) => warn!("resync record build failed: {e}"),
            }
        }
        added
    }

    /// Publish the batch.
    pub fn commit(self) {
        *self.index.state.write() = Arc::new(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileAttributes;

    fn test_index() -> Index {
        Index::new(Arc::new(StringPool::new()))
    }

    fn rec(index: &Index, path: &str, size: i64) -> FileRecord {
        let ids = index.pool().intern_path_components(path).unwrap();
        FileRecord {
            full_path_id: ids.full_path_id,
            name_id: ids.name_id,
            dir_id: ids.dir_id,
            ext_id: ids.ext_id,
            size,
            created: 10,
            modified: 20,
            accessed: 30,
            attrs: FileAttributes::empty(),
        }
    }

    #[test]
    fn insert_scan_roundtrip() {
        let index = test_index();
        index.insert(rec(&index, "/a/foo.txt", 100));
        index.insert(rec(&index, "/a/bar.cs", 200));
        let snap = index.snapshot_state();
        let names: Vec<&str> = snap
            .iter_live()
            .map(|r| index.pool().get(r.name_id))
            .collect();
        assert_eq!(names, vec!["foo.txt", "bar.cs"]);
    }

    #[test]
    fn insert_is_upsert() {
        let index = test_index();
        index.insert(rec(&index, "/a/f.txt", 1));
        index.insert(rec(&index, "/a/f.txt", 2));
        assert_eq!(index.len(), 1);
        let snap = index.snapshot_state();
        assert_eq!(snap.iter_live().next().unwrap().size, 2);
    }

    #[test]
    fn remove_tombstones_until_optimize() {
        let index = test_index();
        index.insert(rec(&index, "/a/f.txt", 1));
        index.insert(rec(&index, "/a/g.txt", 2));
        let fpid = index.pool().intern("/a/f.txt").unwrap();
        assert!(index.remove(fpid));
        assert!(!index.remove(fpid));
        assert_eq!(index.len(), 1);
        assert_eq!(index.stats().tombstones, 1);

        index.optimize();
        assert_eq!(index.stats().tombstones, 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn ext_bucket_skips_tombstones() {
        let index = test_index();
        index.insert(rec(&index, "/a/one.txt", 1));
        index.insert(rec(&index, "/a/two.txt", 2));
        let fpid = index.pool().intern("/a/one.txt").unwrap();
        index.remove(fpid);

        let ext_id = index.pool().intern(".txt").unwrap();
        let sizes: Vec<i64> = index.scan_by_extension(ext_id).map(|r| r.size).collect();
        assert_eq!(sizes, vec![2]);
    }

    #[test]
    fn owning_scans_match_snapshot() {
        let index = test_index();
        index.insert(rec(&index, "/a/one.txt", 1));
        index.insert(rec(&index, "/a/two.md", 2));
        let fpid = index.pool().intern("/a/one.txt").unwrap();
        index.remove(fpid);

        let sizes: Vec<i64> = index.scan().map(|r| r.size).collect();
        assert_eq!(sizes, vec![2]);

        let md = index.pool().intern(".md").unwrap();
        let bucket: Vec<i64> = index.scan_by_extension(md).map(|r| r.size).collect();
        assert_eq!(bucket, vec![2]);
        let txt = index.pool().intern(".txt").unwrap();
        assert_eq!(index.scan_by_extension(txt).count(), 0);
    }

    #[test]
    fn scanners_keep_their_snapshot() {
        let index = test_index();
        index.insert(rec(&index, "/a/f.txt", 1));
        let before = index.snapshot_state();
        index.insert(rec(&index, "/a/g.txt", 2));
        assert_eq!(before.iter_live().count(), 1);
        assert_eq!(index.snapshot_state().iter_live().count(), 2);
    }

    #[test]
    fn apply_rename_is_idempotent() {
        let index = test_index();
        index.insert(rec(&index, "/x/old.txt", 5));
        let opts = IndexingOptions::default();
        let ev = ChangeEvent::renamed("/x/old.txt", "/x/new.txt");

        index.apply(&ev, &opts).unwrap();
        let after_once: Vec<u32> = index
            .snapshot_state()
            .iter_live()
            .map(|r| r.full_path_id)
            .collect();

        index.apply(&ev, &opts).unwrap();
        let after_twice: Vec<u32> = index
            .snapshot_state()
            .iter_live()
            .map(|r| r.full_path_id)
            .collect();

        assert_eq!(after_once, after_twice);
        let new_fpid = index.pool().intern("/x/new.txt").unwrap();
        let snap = index.snapshot_state();
        let survivor = snap.iter_live().next().unwrap();
        assert_eq!(survivor.full_path_id, new_fpid);
        assert_eq!(survivor.size, 5);
        assert_eq!(index.pool().get(survivor.name_id), "new.txt");
        assert_eq!(index.pool().get(survivor.ext_id), ".txt");
    }

    #[test]
    fn apply_delete_is_idempotent() {
        let index = test_index();
        index.insert(rec(&index, "/x/a.txt", 1));
        let opts = IndexingOptions::default();
        let ev = ChangeEvent::deleted("/x/a.txt");
        index.apply(&ev, &opts).unwrap();
        assert_eq!(index.len(), 0);
        index.apply(&ev, &opts).unwrap();
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn delete_of_directory_removes_subtree() {
        let index = test_index();
        index.insert(rec(&index, "/x/sub/a.txt", 1));
        index.insert(rec(&index, "/x/sub/b.txt", 2));
        index.insert(rec(&index, "/x/other.txt", 3));
        let opts = IndexingOptions::default();
        index.apply(&ChangeEvent::deleted("/x/sub"), &opts).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn snapshot_restore_is_identity() {
        let index = test_index();
        index.insert(rec(&index, "/a/foo.txt", 100));
        index.insert(rec(&index, "/a/bar.cs", 200));
        index.insert(rec(&index, "/a/baz.TXT", 300));
        // leave a tombstone in place to prove it round-trips
        let fpid = index.pool().intern("/a/bar.cs").unwrap();
        index.remove(fpid);

        let mut buf = Vec::new();
        index.save_snapshot(&mut buf).unwrap();

        let restored = Index::restore(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.len(), index.len());
        assert_eq!(restored.stats().tombstones, index.stats().tombstones);

        let a = index.snapshot_state();
        let b = restored.snapshot_state();
        assert_eq!(a.records(), b.records());
        let paths_a: Vec<String> = a
            .iter_live()
            .map(|r| index.pool().get(r.full_path_id).to_string())
            .collect();
        let paths_b: Vec<String> = b
            .iter_live()
            .map(|r| restored.pool().get(r.full_path_id).to_string())
            .collect();
        assert_eq!(paths_a, paths_b);

        // a second snapshot of the restored index is byte-identical
        let mut buf2 = Vec::new();
        restored.save_snapshot(&mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn restore_rejects_corruption() {
        let index = test_index();
        index.insert(rec(&index, "/a/foo.txt", 100));
        let mut buf = Vec::new();
        index.save_snapshot(&mut buf).unwrap();

        // flipped payload byte breaks the checksum
        let mut bad = buf.clone();
        bad[20] ^= 0xFF;
        assert!(matches!(
            Index::restore(&mut bad.as_slice()),
            Err(Error::Format(_))
        ));

        // bad magic
        let mut bad = buf.clone();
        bad[0] = b'X';
        assert!(matches!(
            Index::restore(&mut bad.as_slice()),
            Err(Error::Format(_))
        ));

        // truncation
        let short = &buf[..buf.len() / 2];
        assert!(matches!(
            Index::restore(&mut &short[..]),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn bloom_rejects_absent_grams() {
        let index = test_index();
        index.insert(rec(&index, "/a/report.pdf", 1));
        index.insert(rec(&index, "/a/summary.doc", 2));
        let snap = index.snapshot_state();
        assert!(snap.bloom().may_contain("report"));
        assert!(snap.bloom().may_contain("ort"));
        assert!(!snap.bloom().may_contain("zzzqqq"));
        // sub-gram needles are never rejected
        assert!(snap.bloom().may_contain("zz"));
    }
}
