//! Engine: owns the pool, index, enumeration backend and monitor
//! lifecycle, and exposes the public search API.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::index::{Index, IndexStats};
use crate::monitor;
use crate::pool::{PoolStats, StringPool};
use crate::query::{self, SearchResult};
use crate::simd::{self, SimdTier};
use crate::types::{CancelToken, IndexingOptions, MonitoringOptions, SearchQuery};
use crate::walk::{self, Backend, Enumerator};

/// Aggregated counters returned by [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub index: IndexStats,
    pub total_indexed_files: u64,
    pub is_indexing: bool,
    pub is_monitoring: bool,
    /// Per-entry enumeration errors logged and skipped so far.
    pub skipped_errors: u64,
    pub simd_tier: SimdTier,
    pub backend: &'static str,
}

pub struct Engine {
    backend: Backend,
    index: RwLock<Arc<Index>>,
    indexing_active: Arc<AtomicBool>,
    monitoring_active: Arc<AtomicBool>,
    total_indexed: Arc<AtomicU64>,
    skipped_errors: Arc<AtomicU64>,
    /// Set on PoolFull; every later operation answers Unavailable.
    poisoned: Arc<AtomicBool>,
    cancel: Mutex<CancelToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    monitor_options: Mutex<MonitoringOptions>,
    last_options: Mutex<Option<IndexingOptions>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with the platform-preferred backend (MFT where available,
    /// directory walker otherwise).
    pub fn new() -> Engine {
        Engine::with_backend(Backend::select())
    }

    /// Explicit backend injection; used by tests and embedders.
    pub fn with_backend(backend: Backend) -> Engine {
        let pool = Arc::new(StringPool::new());
        Engine {
            backend,
            index: RwLock::new(Arc::new(Index::new(pool))),
            indexing_active: Arc::new(AtomicBool::new(false)),
            monitoring_active: Arc::new(AtomicBool::new(false)),
            total_indexed: Arc::new(AtomicU64::new(0)),
            skipped_errors: Arc::new(AtomicU64::new(0)),
            poisoned: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancelToken::new()),
            workers: Mutex::new(Vec::new()),
            monitor_options: Mutex::new(MonitoringOptions::default()),
            last_options: Mutex::new(None),
        }
    }

    pub fn set_monitoring_options(&self, options: MonitoringOptions) {
        *self.monitor_options.lock() = options;
    }

    fn check_available(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    fn current_index(&self) -> Arc<Index> {
        Arc::clone(&self.index.read())
    }

    /// Begin background indexing of `options.roots` (all real mounts
    /// when empty). Fails with `Busy` while a previous run is active.
    pub fn start_indexing(&self, options: IndexingOptions) -> Result<()> {
        self.check_available()?;
        if self.indexing_active.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy);
        }

        let mut options = options;
        if options.roots.is_empty() {
            options.roots = walk::available_locations();
            info!("no roots configured, indexing {} mount(s)", options.roots.len());
        }

        let cancel = CancelToken::new();
        *self.cancel.lock() = cancel.clone();
        *self.last_options.lock() = Some(options.clone());

        let index = self.current_index();
        let stream = match self.backend.enumerate(
            &options.roots,
            &options,
            Arc::clone(index.pool()),
            cancel.clone(),
        ) {
            Ok(stream) => stream,
            Err(e) => {
                self.indexing_active.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let indexing_active = Arc::clone(&self.indexing_active);
        let monitoring_active = Arc::clone(&self.monitoring_active);
        let total_indexed = Arc::clone(&self.total_indexed);
        let skipped_errors = Arc::clone(&self.skipped_errors);
        let poisoned = Arc::clone(&self.poisoned);
        let monitor_options = self.monitor_options.lock().clone();

        let writer = std::thread::Builder::new()
            .name("fastfind-writer".to_string())
            .spawn(move || {
                let started = Instant::now();
                let batch_size = options.batch_size.max(1);
                let mut chunk: Vec<crate::record::FileRecord> = Vec::with_capacity(batch_size);
                let mut fatal = false;
                let mut stream = stream;

                for item in &mut stream {
                    match item {
                        Ok(rec) => {
                            chunk.push(rec);
                            if chunk.len() >= batch_size {
                                commit_chunk(&index, &mut chunk);
                                total_indexed.store(index.len() as u64, Ordering::Release);
                            }
                        }
                        Err(Error::PoolFull) => {
                            error!("string pool exhausted, engine poisoned");
                            poisoned.store(true, Ordering::Release);
                            fatal = true;
                            break;
                        }
                        Err(e) => {
                            error!("enumeration aborted: {e}");
                            fatal = true;
                            break;
                        }
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                if !chunk.is_empty() {
                    commit_chunk(&index, &mut chunk);
                }
                total_indexed.store(index.len() as u64, Ordering::Release);
                skipped_errors.store(
                    stream.stats().errors.load(Ordering::Relaxed),
                    Ordering::Release,
                );
                info!(
                    "indexing finished: {} records, {} entries scanned, {} skipped, {:.1}s",
                    index.len(),
                    stream.stats().scanned.load(Ordering::Relaxed),
                    stream.stats().errors.load(Ordering::Relaxed),
                    started.elapsed().as_secs_f32()
                );
                drop(stream);
                indexing_active.store(false, Ordering::Release);

                if options.enable_monitoring && !fatal && !cancel.is_cancelled() {
                    run_monitor(
                        index,
                        options,
                        monitor_options,
                        cancel,
                        monitoring_active,
                        total_indexed,
                    );
                }
            });

        match writer {
            Ok(handle) => {
                self.workers.lock().push(handle);
                Ok(())
            }
            Err(e) => {
                self.indexing_active.store(false, Ordering::Release);
                Err(Error::Io(e))
            }
        }
    }

    /// Cancel background work and join every engine thread.
    pub fn stop_indexing(&self) {
        self.cancel.lock().cancel();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        self.indexing_active.store(false, Ordering::Release);
        self.monitoring_active.store(false, Ordering::Release);
    }

    /// Block until the current indexing run completes. Returns `false`
    /// on timeout.
    pub fn wait_for_indexing(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_indexing() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Re-enumerate `roots` and reconcile the index with what is on
    /// disk. Roots that no longer exist are ignored.
    pub fn refresh(&self, roots: &[PathBuf]) -> Result<()> {
        self.check_available()?;
        if self.indexing_active.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }
        let options = self
            .last_options
            .lock()
            .clone()
            .unwrap_or_default();
        let index = self.current_index();
        // refresh is synchronous; it gets its own token rather than the
        // background one a prior stop_indexing may have burned
        let cancel = CancelToken::new();

        let stream = self
            .backend
            .enumerate(roots, &options, Arc::clone(index.pool()), cancel.clone())?;
        let mut fresh = Vec::new();
        for item in stream {
            match item {
                Ok(rec) => fresh.push(rec),
                Err(Error::PoolFull) => {
                    self.poisoned.store(true, Ordering::Release);
                    return Err(Error::PoolFull);
                }
                Err(e) => return Err(e),
            }
        }
        cancel.check()?;

        let mut batch = index.begin_write();
        for root in roots {
            batch.remove_prefix(&crate::paths::normalize(&root.to_string_lossy()));
        }
        for rec in fresh {
            batch.upsert(rec);
        }
        batch.commit();
        self.total_indexed.store(index.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Compact tombstones and rebuild derived structures.
    pub fn optimize(&self) -> Result<()> {
        self.check_available()?;
        self.current_index().optimize();
        Ok(())
    }

    /// Persist the index to `path` (best-effort durability). Only the
    /// MFT backend persists in this revision; the walker backend
    /// answers `Unsupported`.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        self.check_available()?;
        if !self.backend.supports_snapshots() {
            return Err(Error::Unsupported("save_snapshot"));
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.current_index().save_snapshot(&mut writer)
    }

    /// Replace the in-memory state from a snapshot file. Fails with
    /// `Busy` while indexing; the previous state is kept on any error.
    pub fn load_snapshot(&self, path: &Path) -> Result<()> {
        self.check_available()?;
        if !self.backend.supports_snapshots() {
            return Err(Error::Unsupported("load_snapshot"));
        }
        if self.indexing_active.load(Ordering::Acquire) {
            return Err(Error::Busy);
        }
        let mut file = File::open(path)?;
        let restored = Index::restore(&mut file)?;
        let restored = Arc::new(restored);
        self.total_indexed.store(restored.len() as u64, Ordering::Release);
        *self.index.write() = restored;
        Ok(())
    }

    /// Run one query to completion against the current snapshot.
    pub fn search(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.check_available()?;
        let index = self.current_index();
        let stream = query::execute(&index, query, CancelToken::new())?;
        let result = query::collect(stream)?;
        debug!(
            "search {:?}: {} matches in {:.1}ms",
            query.search_text,
            result.total_matches,
            result.elapsed.as_secs_f64() * 1000.0
        );
        Ok(result)
    }

    /// Debounced re-execution over a stream of queries; each new query
    /// cancels the previous run.
    pub fn search_realtime(&self, queries: Receiver<SearchQuery>) -> Result<Receiver<SearchResult>> {
        self.check_available()?;
        Ok(query::run_realtime(
            self.current_index(),
            queries,
            CancelToken::new(),
        ))
    }

    pub fn stats(&self) -> EngineStats {
        let index = self.current_index();
        EngineStats {
            pool: index.pool().stats(),
            index: index.stats(),
            total_indexed_files: self.total_indexed.load(Ordering::Acquire),
            is_indexing: self.is_indexing(),
            is_monitoring: self.is_monitoring(),
            skipped_errors: self.skipped_errors.load(Ordering::Acquire),
            simd_tier: simd::tier(),
            backend: self.backend.name(),
        }
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing_active.load(Ordering::Acquire)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring_active.load(Ordering::Acquire)
    }

    pub fn total_indexed_files(&self) -> u64 {
        self.total_indexed.load(Ordering::Acquire)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_indexing();
    }
}

fn commit_chunk(index: &Index, chunk: &mut Vec<crate::record::FileRecord>) {
    let mut batch = index.begin_write();
    for rec in chunk.drain(..) {
        batch.upsert(rec);
    }
    batch.commit();
}

/// Monitor loop: pull coalesced events and apply them to the index
/// until cancellation or watcher loss.
fn run_monitor(
    index: Arc<Index>,
    options: IndexingOptions,
    monitor_options: MonitoringOptions,
    cancel: CancelToken,
    monitoring_active: Arc<AtomicBool>,
    total_indexed: Arc<AtomicU64>,
) {
    let handle = match monitor::start(&options.roots, monitor_options, cancel.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("change monitoring unavailable: {e}");
            return;
        }
    };
    monitoring_active.store(true, Ordering::Release);
    info!("monitoring {} root(s)", options.roots.len());

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match handle.recv_timeout(Duration::from_millis(200)) {
            Some(event) => {
                if let Err(e) = index.apply(&event, &options) {
                    warn!("failed to apply {:?} for {}: {e}", event.kind, event.new_path);
                }
                total_indexed.store(index.len() as u64, Ordering::Release);
            }
            None => {
                if handle.is_closed() {
                    if let Some(e) = handle.take_error() {
                        error!("monitor terminated: {e}");
                    }
                    break;
                }
            }
        }
    }
    monitoring_active.store(false, Ordering::Release);
}
