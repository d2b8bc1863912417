//! Option sets, attribute flags and the shared cancellation token.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

bitflags! {
    /// Per-record attribute bitset stored in [`crate::record::FileRecord`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const HIDDEN    = 1 << 0;
        const SYSTEM    = 1 << 1;
        const READONLY  = 1 << 2;
        const DIRECTORY = 1 << 3;
        const SYMLINK   = 1 << 4;
        const REPARSE   = 1 << 5;
    }
}

bitflags! {
    /// Which change kinds a monitor delivers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeMask: u32 {
        const CREATED  = 1 << 0;
        const MODIFIED = 1 << 1;
        const DELETED  = 1 << 2;
        const RENAMED  = 1 << 3;
    }
}

impl Default for ChangeMask {
    fn default() -> Self {
        ChangeMask::all()
    }
}

/// Cooperative cancellation shared between engine tasks.
///
/// Cloned freely; any clone observing `cancel()` makes every holder see it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Error-returning form for use with `?` inside scan loops.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A single search request. All filters compose with logical AND.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchQuery {
    /// Substring, or wildcard pattern when `use_wildcard` is set or the
    /// text contains `*`/`?`.
    pub search_text: String,
    /// Interpret `search_text` as a regular expression. Mutually
    /// exclusive with wildcard matching.
    pub use_regex: bool,
    pub use_wildcard: bool,
    pub case_sensitive: bool,
    /// Match against the basename only instead of the full path.
    pub search_filename_only: bool,
    /// Records whose full path does not start with this prefix are skipped.
    pub base_path: Option<PathBuf>,
    /// Exact extension match, lowercased, with or without the leading dot.
    pub extension_filter: Option<String>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub min_created: Option<i64>,
    pub max_created: Option<i64>,
    pub min_modified: Option<i64>,
    pub max_modified: Option<i64>,
    pub include_files: bool,
    pub include_directories: bool,
    pub include_hidden: bool,
    pub include_system: bool,
    /// Hard cap; the executor stops scanning after this many matches.
    pub max_results: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            search_text: String::new(),
            use_regex: false,
            use_wildcard: false,
            case_sensitive: false,
            search_filename_only: false,
            base_path: None,
            extension_filter: None,
            min_size: None,
            max_size: None,
            min_created: None,
            max_created: None,
            min_modified: None,
            max_modified: None,
            include_files: true,
            include_directories: true,
            include_hidden: true,
            include_system: true,
            max_results: usize::MAX,
        }
    }
}

pub(crate) const MIN_MFT_BUFFER: usize = 64 * 1024;
pub(crate) const MAX_MFT_BUFFER: usize = 4 * 1024 * 1024;
pub(crate) const DEFAULT_MFT_BUFFER: usize = 1024 * 1024;

/// Configuration for one indexing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexingOptions {
    /// Drive letters, mount points and/or plain directories.
    pub roots: Vec<PathBuf>,
    /// Subtrees skipped by prefix match on the resolved path.
    pub excluded_paths: Vec<PathBuf>,
    /// Extensions skipped, lowercased, leading dot optional.
    pub excluded_extensions: Vec<String>,
    /// Directory basenames pruned together with their whole subtree.
    pub excluded_names: Vec<String>,
    /// Files larger than this are not indexed.
    pub max_file_size: Option<i64>,
    pub include_hidden: bool,
    pub include_system: bool,
    pub max_depth: Option<usize>,
    /// Depth of the record channel between enumerators and the index
    /// writer; also the writer's commit batch size.
    pub batch_size: usize,
    pub parallel_workers: usize,
    pub enable_monitoring: bool,
    /// MFT enumeration buffer; clamped to [64 KiB, 4 MiB] and aligned
    /// down to 4 KiB.
    pub mft_buffer_size: usize,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            roots: Vec::new(),
            excluded_paths: Vec::new(),
            excluded_extensions: Vec::new(),
            excluded_names: Vec::new(),
            max_file_size: None,
            include_hidden: false,
            include_system: false,
            max_depth: None,
            batch_size: 1024,
            parallel_workers: workers,
            enable_monitoring: false,
            mft_buffer_size: DEFAULT_MFT_BUFFER,
        }
    }
}

impl IndexingOptions {
    /// MFT buffer size after clamping and 4 KiB down-alignment. Invalid
    /// values are clamped, never rejected.
    pub fn effective_mft_buffer(&self) -> usize {
        self.mft_buffer_size.clamp(MIN_MFT_BUFFER, MAX_MFT_BUFFER) & !0xFFF
    }

    /// Lowercased, dot-prefixed forms of `excluded_extensions`.
    pub(crate) fn normalized_excluded_extensions(&self) -> Vec<String> {
        self.excluded_extensions
            .iter()
            .map(|e| {
                let lower = e.to_lowercase();
                if lower.starts_with('.') {
                    lower
                } else {
                    format!(".{lower}")
                }
            })
            .collect()
    }
}

/// Configuration for change monitoring.
#[derive(Debug, Clone)]
pub struct MonitoringOptions {
    pub include_subdirectories: bool,
    pub change_mask: ChangeMask,
    /// Events for the same path inside this window are coalesced.
    pub debounce_interval: Duration,
}

impl Default for MonitoringOptions {
    fn default() -> Self {
        Self {
            include_subdirectories: true,
            change_mask: ChangeMask::all(),
            debounce_interval: Duration::from_millis(300),
        }
    }
}
