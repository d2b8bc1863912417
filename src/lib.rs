//! fastfind: an instant local file search engine.
//!
//! The engine enumerates whole volumes (reading the NTFS Master File
//! Table directly where privileges allow, walking directories in
//! parallel otherwise), keeps every entry in a compact interned
//! in-memory index, watches for filesystem changes to stay live, and
//! answers substring, wildcard, extension, size, date and regex queries
//! in index order.
//!
//! ```no_run
//! use fastfind::{Engine, IndexingOptions, SearchQuery};
//!
//! let engine = Engine::new();
//! engine.start_indexing(IndexingOptions {
//!     roots: vec!["/home".into()],
//!     ..Default::default()
//! })?;
//! engine.wait_for_indexing(std::time::Duration::from_secs(60));
//!
//! let result = engine.search(&SearchQuery {
//!     search_text: "*.rs".to_string(),
//!     ..Default::default()
//! })?;
//! println!("{} matches in {:?}", result.total_matches, result.elapsed);
//! # Ok::<(), fastfind::Error>(())
//! ```

pub mod engine;
pub mod error;
pub mod index;
pub mod monitor;
pub mod paths;
pub mod pool;
pub mod query;
pub mod record;
pub mod simd;
pub mod types;
pub mod walk;

#[cfg(windows)]
pub mod win;

pub use engine::{Engine, EngineStats};
pub use error::{Error, Result};
pub use index::{Index, IndexStats};
pub use monitor::{ChangeEvent, ChangeKind, MonitorHandle};
pub use pool::{InternedPath, PoolStats, StringPool, EMPTY_ID};
pub use query::{SearchResult, SearchStream};
pub use record::{FileRecord, UNKNOWN_SIZE};
pub use simd::SimdTier;
pub use types::{
    CancelToken, ChangeMask, FileAttributes, IndexingOptions, MonitoringOptions, SearchQuery,
};
pub use walk::{available_locations, Backend, Enumerator, PosixWalkEnumerator, RecordStream};
