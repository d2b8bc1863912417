//! File enumeration: the backend trait, the producer-paced record
//! stream and the stat-based parallel walker.
//!
//! The walker keeps a bounded queue of directory work items drained by a
//! worker pool. Directories near the top of the tree (depth <= 2) are
//! handed to other workers; deeper ones (and any directory that does
//! not fit the full queue) are traversed inline by the current worker,
//! which bounds queue occupancy and cannot deadlock the pool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::paths;
use crate::pool::StringPool;
use crate::record::FileRecord;
use crate::types::{CancelToken, IndexingOptions};

/// Work queue capacity; producers overflow to inline traversal.
const WORK_QUEUE_CAPACITY: usize = 1000;
/// Directories at most this deep are handed to other workers.
const HANDOFF_MAX_DEPTH: usize = 2;
const SEND_TICK: Duration = Duration::from_millis(100);

/// Counters shared between a running enumeration and its consumer.
#[derive(Default)]
pub struct StreamStats {
    /// Entries stat'ed (before filters)
    pub scanned: AtomicU64,
    /// Records delivered into the stream
    pub emitted: AtomicU64,
    /// Per-entry errors logged and skipped
    pub errors: AtomicU64,
}

pub(crate) enum StreamItem {
    Record(FileRecord),
    /// Terminal failure; the stream ends after yielding it.
    Fatal(Error),
}

/// Lazy, finite, producer-paced sequence of [`FileRecord`]s. Dropping
/// the stream stops the producers.
pub struct RecordStream {
    rx: Receiver<StreamItem>,
    stats: Arc<StreamStats>,
    workers: Vec<JoinHandle<()>>,
    finished: bool,
}

impl RecordStream {
    pub(crate) fn new(
        rx: Receiver<StreamItem>,
        stats: Arc<StreamStats>,
        workers: Vec<JoinHandle<()>>,
    ) -> Self {
        RecordStream { rx, stats, workers, finished: false }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }
}

impl Iterator for RecordStream {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(StreamItem::Record(rec)) => Some(Ok(rec)),
            Ok(StreamItem::Fatal(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        // disconnect so producers stop, then reap them
        let (dead_tx, dead_rx) = bounded(0);
        self.rx = dead_rx;
        drop(dead_tx);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One enumeration backend.
pub trait Enumerator {
    /// Whether this backend can run at all (privileges, filesystem).
    fn is_available(&self) -> bool;

    /// Produce a finite record stream for `roots`. Not restartable;
    /// call again to re-enumerate.
    fn enumerate(
        &self,
        roots: &[PathBuf],
        options: &IndexingOptions,
        pool: Arc<StringPool>,
        cancel: CancelToken,
    ) -> Result<RecordStream>;
}

/// The closed set of backends, chosen at engine construction.
pub enum Backend {
    #[cfg(windows)]
    NtfsMft(crate::win::mft::NtfsMftEnumerator),
    Walk(PosixWalkEnumerator),
}

impl Backend {
    /// Probe the platform-preferred backend, falling back to the walker.
    pub fn select() -> Backend {
        #[cfg(windows)]
        {
            let mft = crate::win::mft::NtfsMftEnumerator::new();
            if mft.is_available() {
                return Backend::NtfsMft(mft);
            }
            debug!("MFT enumerator unavailable, using directory walker");
        }
        Backend::Walk(PosixWalkEnumerator::new())
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(windows)]
            Backend::NtfsMft(_) => "ntfs-mft",
            Backend::Walk(_) => "walk",
        }
    }

    /// Index snapshots persist only on the MFT backend in this revision.
    pub fn supports_snapshots(&self) -> bool {
        match self {
            #[cfg(windows)]
            Backend::NtfsMft(_) => true,
            Backend::Walk(_) => false,
        }
    }
}

impl Enumerator for Backend {
    fn is_available(&self) -> bool {
        match self {
            #[cfg(windows)]
            Backend::NtfsMft(inner) => inner.is_available(),
            Backend::Walk(inner) => inner.is_available(),
        }
    }

    fn enumerate(
        &self,
        roots: &[PathBuf],
        options: &IndexingOptions,
        pool: Arc<StringPool>,
        cancel: CancelToken,
    ) -> Result<RecordStream> {
        match self {
            #[cfg(windows)]
            Backend::NtfsMft(inner) => inner.enumerate(roots, options, pool, cancel),
            Backend::Walk(inner) => inner.enumerate(roots, options, pool, cancel),
        }
    }
}

struct WorkItem {
    dir: PathBuf,
    depth: usize,
    root_dev: u64,
    /// Emit a record for the item itself (roots).
    emit_self: bool,
}

struct WalkCtx {
    out_tx: Sender<StreamItem>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    pending: AtomicUsize,
    abort: AtomicBool,
    pool: Arc<StringPool>,
    options: IndexingOptions,
    excluded_exts: Vec<String>,
    cancel: CancelToken,
    stats: Arc<StreamStats>,
}

/// Parallel BFS over `read_dir` + `symlink_metadata`. Symbolic links are
/// recorded but never followed; mount boundaries are not crossed.
pub struct PosixWalkEnumerator;

impl Default for PosixWalkEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixWalkEnumerator {
    pub fn new() -> Self {
        PosixWalkEnumerator
    }
}

impl Enumerator for PosixWalkEnumerator {
    fn is_available(&self) -> bool {
        true
    }

    fn enumerate(
        &self,
        roots: &[PathBuf],
        options: &IndexingOptions,
        pool: Arc<StringPool>,
        cancel: CancelToken,
    ) -> Result<RecordStream> {
        let (out_tx, out_rx) = bounded(options.batch_size.max(1));
        let (work_tx, work_rx) = bounded::<WorkItem>(WORK_QUEUE_CAPACITY);
        let stats = Arc::new(StreamStats::default());

        let ctx = Arc::new(WalkCtx {
            out_tx,
            work_tx,
            work_rx,
            pending: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            pool,
            excluded_exts: options.normalized_excluded_extensions(),
            options: options.clone(),
            cancel,
            stats: Arc::clone(&stats),
        });

        let mut seeds = Vec::new();
        for root in roots {
            let norm = PathBuf::from(paths::normalize(&root.to_string_lossy()));
            match root_device(&norm) {
                Some(dev) => {
                    seeds.push(WorkItem { dir: norm, depth: 0, root_dev: dev, emit_self: true })
                }
                None => {
                    warn!("skipping missing root {}", norm.display());
                    ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        // account for every seed up front so idle workers cannot decide
        // the walk is over before seeding finishes
        ctx.pending.store(seeds.len(), Ordering::Release);

        let mut workers = Vec::new();
        for i in 0..ctx.options.parallel_workers.max(1) {
            let ctx = Arc::clone(&ctx);
            let handle = std::thread::Builder::new()
                .name(format!("fastfind-walk-{i}"))
                .spawn(move || worker_loop(&ctx))
                .map_err(Error::Io)?;
            workers.push(handle);
        }
        let seed_ctx = Arc::clone(&ctx);
        let seeder = std::thread::Builder::new()
            .name("fastfind-walk-seed".to_string())
            .spawn(move || {
                for item in seeds {
                    if seed_ctx.work_tx.send(item).is_err() {
                        break;
                    }
                }
            })
            .map_err(Error::Io)?;
        workers.push(seeder);
        // the stream's ends are held by the workers only
        drop(ctx);

        Ok(RecordStream::new(out_rx, stats, workers))
    }
}

fn root_device(path: &Path) -> Option<u64> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    Some(device_of(&meta))
}

#[cfg(unix)]
fn device_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.dev()
}

#[cfg(not(unix))]
fn device_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

fn worker_loop(ctx: &WalkCtx) {
    loop {
        if ctx.cancel.is_cancelled() || ctx.abort.load(Ordering::Acquire) {
            break;
        }
        match ctx.work_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(item) => {
                walk_item(ctx, item);
                ctx.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.pending.load(Ordering::Acquire) == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn walk_item(ctx: &WalkCtx, item: WorkItem) {
    let mut stack: Vec<(PathBuf, usize)> = Vec::new();

    if item.emit_self {
        match std::fs::symlink_metadata(&item.dir) {
            Ok(meta) => {
                ctx.stats.scanned.fetch_add(1, Ordering::Relaxed);
                if !meta.is_dir() {
                    // a root may name a single file
                    emit_entry(ctx, &item.dir, &meta);
                    return;
                }
                if !emit_entry(ctx, &item.dir, &meta) {
                    return;
                }
            }
            Err(e) => {
                warn!("stat failed for root {}: {e}", item.dir.display());
                ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
    stack.push((item.dir, item.depth));

    while let Some((dir, depth)) = stack.pop() {
        if ctx.cancel.is_cancelled() || ctx.abort.load(Ordering::Acquire) {
            return;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot list {}: {e}", dir.display());
                ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        for entry in entries {
            if ctx.cancel.is_cancelled() || ctx.abort.load(Ordering::Acquire) {
                return;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("bad directory entry under {}: {e}", dir.display());
                    ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if !ctx.options.include_hidden && name.starts_with('.') {
                continue;
            }
            if ctx.options.excluded_paths.iter().any(|p| path.starts_with(p)) {
                continue;
            }

            let meta = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("stat failed for {}: {e}", path.display());
                    ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            ctx.stats.scanned.fetch_add(1, Ordering::Relaxed);

            let is_dir = meta.is_dir();
            if is_dir {
                if ctx.options.excluded_names.iter().any(|n| *n == name) {
                    continue;
                }
                if !emit_entry(ctx, &path, &meta) {
                    return;
                }
                let child_depth = depth + 1;
                if let Some(max) = ctx.options.max_depth {
                    if child_depth >= max {
                        continue;
                    }
                }
                if device_of(&meta) != item.root_dev {
                    debug!("not crossing mount boundary at {}", path.display());
                    continue;
                }
                if child_depth <= HANDOFF_MAX_DEPTH {
                    ctx.pending.fetch_add(1, Ordering::AcqRel);
                    match ctx.work_tx.try_send(WorkItem {
                        dir: path,
                        depth: child_depth,
                        root_dev: item.root_dev,
                        emit_self: false,
                    }) {
                        Ok(()) => {}
                        Err(TrySendError::Full(it)) | Err(TrySendError::Disconnected(it)) => {
                            // queue saturated: traverse inline instead of
                            // blocking a worker that also drains the queue
                            ctx.pending.fetch_sub(1, Ordering::AcqRel);
                            stack.push((it.dir, it.depth));
                        }
                    }
                } else {
                    stack.push((path, child_depth));
                }
            } else {
                if let Some(ext) = paths::extension_of(&name) {
                    if ctx.excluded_exts.iter().any(|e| *e == ext) {
                        continue;
                    }
                }
                if let Some(max) = ctx.options.max_file_size {
                    if meta.len() as i64 > max {
                        continue;
                    }
                }
                if !emit_entry(ctx, &path, &meta) {
                    return;
                }
            }
        }
    }
}

/// Build and deliver one record; `false` means the consumer is gone or
/// cancellation was observed and the walk should stop.
fn emit_entry(ctx: &WalkCtx, path: &Path, meta: &std::fs::Metadata) -> bool {
    let rec = match FileRecord::from_metadata(&ctx.pool, path, meta) {
        Ok(rec) => rec,
        Err(Error::PoolFull) => {
            ctx.abort.store(true, Ordering::Release);
            send_item(ctx, StreamItem::Fatal(Error::PoolFull));
            return false;
        }
        Err(e) => {
            warn!("record build failed for {}: {e}", path.display());
            ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    };
    if send_item(ctx, StreamItem::Record(rec)) {
        ctx.stats.emitted.fetch_add(1, Ordering::Relaxed);
        true
    } else {
        false
    }
}

fn send_item(ctx: &WalkCtx, mut item: StreamItem) -> bool {
    loop {
        if ctx.cancel.is_cancelled() {
            return false;
        }
        match ctx.out_tx.send_timeout(item, SEND_TICK) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(it)) => item = it,
            Err(SendTimeoutError::Disconnected(_)) => {
                ctx.abort.store(true, Ordering::Release);
                return false;
            }
        }
    }
}

/// Real mount points suitable as indexing roots.
///
/// On Linux this parses `/proc/mounts` and filters virtual filesystems;
/// on Windows it probes drive letters; elsewhere it returns `/`.
pub fn available_locations() -> Vec<PathBuf> {
    available_locations_with(&[])
}

/// Like [`available_locations`], but filesystem types in
/// `allowed_virtual` (e.g. `"tmpfs"`) survive the virtual-fs filter.
pub fn available_locations_with(allowed_virtual: &[&str]) -> Vec<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/mounts") {
            Ok(content) => parse_proc_mounts(&content, allowed_virtual),
            Err(e) => {
                warn!("cannot read /proc/mounts: {e}");
                vec![PathBuf::from("/")]
            }
        }
    }
    #[cfg(windows)]
    {
        let _ = allowed_virtual;
        let mut out = Vec::new();
        for letter in b'A'..=b'Z' {
            let root = format!("{}:\\", letter as char);
            if std::fs::metadata(&root).is_ok() {
                out.push(PathBuf::from(root));
            }
        }
        out
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = allowed_virtual;
        vec![PathBuf::from("/")]
    }
}

#[cfg(any(target_os = "linux", test))]
fn parse_proc_mounts(content: &str, allowed_virtual: &[&str]) -> Vec<PathBuf> {
    const VIRTUAL_FS: &[&str] = &[
        "proc", "sysfs", "tmpfs", "devtmpfs", "devpts", "overlay", "securityfs", "debugfs",
        "tracefs", "fusectl", "pstore", "bpf", "autofs", "hugetlbfs", "mqueue", "binfmt_misc",
        "configfs", "ramfs", "rpc_pipefs", "selinuxfs", "nsfs", "efivarfs", "squashfs",
    ];
    let mut out = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount), Some(fstype)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let virtual_fs = fstype.starts_with("cgroup") || VIRTUAL_FS.contains(&fstype);
        if virtual_fs && !allowed_virtual.contains(&fstype) {
            continue;
        }
        out.push(PathBuf::from(unescape_mount_path(mount)));
    }
    out.sort();
    out.dedup();
    out
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
#[cfg(any(target_os = "linux", test))]
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &raw[i + 1..i + 4];
            if let Ok(code) = u8::from_str_radix(octal, 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
