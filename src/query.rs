//! Query compilation and execution.
//!
//! A [`SearchQuery`] is validated and compiled once (folded needle,
//! wildcard segments or regex, resolved extension id, normalized base
//! prefix), then streamed against an index snapshot: extension bucket
//! when filtered, full scan otherwise, cheapest gates first, text match
//! last. Results arrive in index (insertion) order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::debug;
use regex::bytes::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::index::{Index, IndexState};
use crate::pool::{self, StringPool};
use crate::record::FileRecord;
use crate::simd::{self, WildcardPattern};
use crate::types::{CancelToken, FileAttributes, SearchQuery};

/// A newer real-time query supersedes the running one after this long.
pub const REALTIME_DEBOUNCE: Duration = Duration::from_millis(120);

/// Cancel checks happen at least this often during scans.
const CANCEL_CHECK_INTERVAL: usize = 4096;

/// A finished (or capped) search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub files: Vec<FileRecord>,
    pub total_matches: u64,
    pub elapsed: Duration,
}

enum TextPlan {
    /// Empty search text: everything matches.
    All,
    /// Literal substring; pre-folded when case-insensitive.
    Substring(String),
    Wildcard(WildcardPattern),
    Regex(Regex),
}

pub(crate) struct CompiledQuery {
    query: SearchQuery,
    text: TextPlan,
    /// Interned id of the normalized extension filter.
    ext_id: Option<u32>,
    /// Normalized base path prefix.
    base_prefix: Option<String>,
}

impl CompiledQuery {
    pub(crate) fn compile(query: &SearchQuery, pool: &StringPool) -> Result<CompiledQuery> {
        let text = query.search_text.as_str();
        let has_wildcard_chars = text.contains('*') || text.contains('?');
        let wants_wildcard = query.use_wildcard || has_wildcard_chars;

        if query.use_regex && query.use_wildcard {
            return Err(Error::InvalidQuery(
                "use_regex and use_wildcard are mutually exclusive".to_string(),
            ));
        }

        let plan = if text.is_empty() {
            TextPlan::All
        } else if query.use_regex {
            let re = RegexBuilder::new(text)
                .case_insensitive(!query.case_sensitive)
                .build()?;
            TextPlan::Regex(re)
        } else if wants_wildcard {
            TextPlan::Wildcard(WildcardPattern::compile(text, !query.case_sensitive))
        } else if query.case_sensitive {
            TextPlan::Substring(text.to_string())
        } else {
            TextPlan::Substring(text.to_lowercase())
        };

        let ext_id = match &query.extension_filter {
            Some(ext) => {
                let lower = ext.to_lowercase();
                let dotted = if lower.starts_with('.') { lower } else { format!(".{lower}") };
                Some(pool.intern(&dotted)?)
            }
            None => None,
        };

        let base_prefix = query
            .base_path
            .as_ref()
            .map(|p| crate::paths::normalize(&p.to_string_lossy()));

        Ok(CompiledQuery {
            query: query.clone(),
            text: plan,
            ext_id,
            base_prefix,
        })
    }

    fn passes_cheap_filters(&self, rec: &FileRecord, pool: &StringPool) -> bool {
        let q = &self.query;
        let is_dir = rec.is_directory();
        if is_dir && !q.include_directories {
            return false;
        }
        if !is_dir && !q.include_files {
            return false;
        }
        if !q.include_hidden && rec.attrs.contains(FileAttributes::HIDDEN) {
            return false;
        }
        if !q.include_system && rec.attrs.contains(FileAttributes::SYSTEM) {
            return false;
        }
        if q.min_size.is_some() || q.max_size.is_some() {
            // unknown sizes cannot satisfy a size bound
            if rec.size < 0 {
                return false;
            }
            if let Some(min) = q.min_size {
                if rec.size < min {
                    return false;
                }
            }
            if let Some(max) = q.max_size {
                if rec.size > max {
                    return false;
                }
            }
        }
        if let Some(min) = q.min_created {
            if rec.created < min {
                return false;
            }
        }
        if let Some(max) = q.max_created {
            if rec.created > max {
                return false;
            }
        }
        if let Some(min) = q.min_modified {
            if rec.modified < min {
                return false;
            }
        }
        if let Some(max) = q.max_modified {
            if rec.modified > max {
                return false;
            }
        }
        if let Some(ext_id) = self.ext_id {
            if rec.ext_id != ext_id {
                return false;
            }
        }
        if let Some(prefix) = &self.base_prefix {
            if !crate::paths::starts_with(pool.get(rec.full_path_id), prefix) {
                return false;
            }
        }
        true
    }

    fn matches_text(&self, rec: &FileRecord, pool: &StringPool) -> bool {
        let q = &self.query;
        let target_id = if q.search_filename_only { rec.name_id } else { rec.full_path_id };
        match &self.text {
            TextPlan::All => true,
            TextPlan::Substring(needle) => {
                let target = if q.case_sensitive {
                    pool.get(target_id)
                } else {
                    pool.get_folded(target_id)
                };
                simd::find(target.as_bytes(), needle.as_bytes()).is_some()
            }
            TextPlan::Wildcard(pattern) => {
                let target = if q.case_sensitive {
                    pool.get(target_id)
                } else {
                    pool.get_folded(target_id)
                };
                pattern.matches_folded(target)
            }
            TextPlan::Regex(re) => re.is_match(pool.get(target_id).as_bytes()),
        }
    }

    /// Folded needle for the Bloom pre-gate, when this query qualifies
    /// (literal substring over basenames).
    fn bloom_needle(&self) -> Option<String> {
        if !self.query.search_filename_only {
            return None;
        }
        match &self.text {
            TextPlan::Substring(needle) if needle.len() >= 3 => Some(needle.to_lowercase()),
            _ => None,
        }
    }
}

enum ScanPlan {
    Full,
    Bucket(u32),
    /// Bloom-rejected: no record can match.
    Empty,
}

/// Lazy match stream over one index snapshot. Restart by calling
/// [`execute`] again; results are in insertion order and deterministic
/// for a fixed snapshot.
pub struct SearchStream {
    state: Arc<IndexState>,
    pool: Arc<StringPool>,
    compiled: CompiledQuery,
    plan: ScanPlan,
    pos: usize,
    visited: usize,
    emitted: u64,
    cancel: CancelToken,
    cancelled: bool,
    done: bool,
}

impl std::fmt::Debug for SearchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchStream").finish_non_exhaustive()
    }
}

impl SearchStream {
    /// Matches emitted so far; the total once the stream is exhausted.
    pub fn total_matches(&self) -> u64 {
        self.emitted
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Iterator for SearchStream {
    type Item = FileRecord;

    fn next(&mut self) -> Option<FileRecord> {
        if self.done {
            return None;
        }
        loop {
            self.visited += 1;
            if self.visited % CANCEL_CHECK_INTERVAL == 0 && self.cancel.is_cancelled() {
                self.cancelled = true;
                self.done = true;
                return None;
            }
            let rec = match self.plan {
                ScanPlan::Empty => None,
                ScanPlan::Full => self.state.records().get(self.pos).copied(),
                ScanPlan::Bucket(ext_id) => loop {
                    match self.state.ext_slots(ext_id).get(self.pos) {
                        None => break None,
                        Some(&slot) => {
                            let rec = self.state.records()[slot as usize];
                            if rec.full_path_id != pool::EMPTY_ID && rec.ext_id == ext_id {
                                break Some(rec);
                            }
                            // stale bucket entry (tombstone or rename)
                            self.pos += 1;
                        }
                    }
                },
            };
            let Some(rec) = rec else {
                self.done = true;
                return None;
            };
            self.pos += 1;
            if rec.full_path_id == pool::EMPTY_ID {
                continue;
            }
            if !self.compiled.passes_cheap_filters(&rec, &self.pool)
                || !self.compiled.matches_text(&rec, &self.pool)
            {
                continue;
            }
            self.emitted += 1;
            if self.emitted >= self.compiled.query.max_results as u64 {
                self.done = true;
            }
            return Some(rec);
        }
    }
}

/// Compile `query` and stream matches from the index's current snapshot.
pub fn execute(index: &Index, query: &SearchQuery, cancel: CancelToken) -> Result<SearchStream> {
    let pool = Arc::clone(index.pool());
    let compiled = CompiledQuery::compile(query, &pool)?;
    let state = index.snapshot_state();

    let mut plan = match compiled.ext_id {
        Some(ext_id) => ScanPlan::Bucket(ext_id),
        None => ScanPlan::Full,
    };
    if query.max_results == 0 {
        plan = ScanPlan::Empty;
    } else if let Some(needle) = compiled.bloom_needle() {
        if !state.bloom().may_contain(&needle) {
            plan = ScanPlan::Empty;
        }
    }

    Ok(SearchStream {
        state,
        pool,
        compiled,
        plan,
        pos: 0,
        visited: 0,
        emitted: 0,
        cancel,
        cancelled: false,
        done: false,
    })
}

/// Collect a stream into a [`SearchResult`], surfacing cancellation.
pub fn collect(mut stream: SearchStream) -> Result<SearchResult> {
    let started = Instant::now();
    let mut files = Vec::new();
    for rec in &mut stream {
        files.push(rec);
    }
    if stream.was_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(SearchResult {
        total_matches: stream.total_matches(),
        files,
        elapsed: started.elapsed(),
    })
}

/// Real-time search: consume a query stream, debounce bursts and cancel
/// the running execution whenever a newer query arrives. Results are
/// delivered on the returned channel until the input disconnects or the
/// token cancels.
pub fn run_realtime(
    index: Arc<Index>,
    queries: Receiver<SearchQuery>,
    cancel: CancelToken,
) -> Receiver<SearchResult> {
    let (tx, rx) = crossbeam_channel::bounded::<SearchResult>(8);
    std::thread::Builder::new()
        .name("fastfind-realtime".to_string())
        .spawn(move || {
            let mut pending: Option<SearchQuery> = None;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let mut query = match pending.take() {
                    Some(q) => q,
                    None => match queries.recv_timeout(Duration::from_millis(100)) {
                        Ok(q) => q,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                };
                // debounce: newer queries inside the window supersede
                loop {
                    match queries.recv_timeout(REALTIME_DEBOUNCE) {
                        Ok(newer) => query = newer,
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                            break
                        }
                    }
                }

                let started = Instant::now();
                let mut stream = match execute(&index, &query, cancel.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("realtime query rejected: {e}");
                        continue;
                    }
                };
                let mut files = Vec::new();
                let mut superseded = false;
                for rec in &mut stream {
                    files.push(rec);
                    match queries.try_recv() {
                        Ok(newer) => {
                            pending = Some(newer);
                            superseded = true;
                            break;
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                    }
                }
                if superseded || stream.was_cancelled() {
                    continue;
                }
                let result = SearchResult {
                    total_matches: stream.total_matches(),
                    files,
                    elapsed: started.elapsed(),
                };
                if tx.send(result).is_err() {
                    break;
                }
            }
        })
        .expect("spawn realtime search thread");
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexingOptions;

    fn build_index(paths: &[(&str, i64)]) -> Index {
        let index = Index::new(Arc::new(StringPool::new()));
        for &(path, size) in paths {
            let ids = index.pool().intern_path_components(path).unwrap();
            index.insert(FileRecord {
                full_path_id: ids.full_path_id,
                name_id: ids.name_id,
                dir_id: ids.dir_id,
                ext_id: ids.ext_id,
                size,
                created: 100,
                modified: 200,
                accessed: 300,
                attrs: FileAttributes::empty(),
            });
        }
        index
    }

    fn names(index: &Index, result: &SearchResult) -> Vec<String> {
        result
            .files
            .iter()
            .map(|r| index.pool().get(r.name_id).to_string())
            .collect()
    }

    fn search(index: &Index, query: SearchQuery) -> SearchResult {
        collect(execute(index, &query, CancelToken::new()).unwrap()).unwrap()
    }

    #[test]
    fn extension_filter_case_insensitive() {
        let index = build_index(&[("/a/foo.txt", 1), ("/a/bar.cs", 2), ("/a/baz.TXT", 3)]);
        let result = search(
            &index,
            SearchQuery {
                extension_filter: Some(".txt".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(names(&index, &result), vec!["foo.txt", "baz.TXT"]);
        assert_eq!(result.total_matches, 2);
    }

    #[test]
    fn substring_case_insensitive_filename_only() {
        let index = build_index(&[
            ("/proj/ReadMe.md", 1),
            ("/proj/readme.txt", 2),
            ("/proj/other.md", 3),
        ]);
        let result = search(
            &index,
            SearchQuery {
                search_text: "readme".to_string(),
                case_sensitive: false,
                search_filename_only: true,
                ..Default::default()
            },
        );
        assert_eq!(names(&index, &result), vec!["ReadMe.md", "readme.txt"]);
        assert_eq!(result.total_matches, 2);
    }

    #[test]
    fn wildcard_query() {
        let index = build_index(&[("/src/a.cs", 1), ("/src/ab.cs", 2), ("/src/abc.cpp", 3)]);
        let result = search(
            &index,
            SearchQuery {
                search_text: "a*.cs".to_string(),
                search_filename_only: true,
                ..Default::default()
            },
        );
        assert_eq!(names(&index, &result), vec!["a.cs", "ab.cs"]);
        assert_eq!(result.total_matches, 2);
    }

    #[test]
    fn size_range() {
        let index = build_index(&[("/d/small", 100), ("/d/mid", 200), ("/d/big", 500)]);
        let result = search(
            &index,
            SearchQuery {
                min_size: Some(150),
                max_size: Some(300),
                ..Default::default()
            },
        );
        assert_eq!(names(&index, &result), vec!["mid"]);
        assert_eq!(result.total_matches, 1);
    }

    #[test]
    fn unknown_size_fails_size_bounds() {
        let index = build_index(&[("/d/known", 100), ("/d/unknown", -1)]);
        let result = search(
            &index,
            SearchQuery {
                min_size: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(names(&index, &result), vec!["known"]);
    }

    #[test]
    fn base_path_prefix() {
        let index = build_index(&[("/a/x.txt", 1), ("/a/sub/y.txt", 2), ("/ab/z.txt", 3)]);
        let result = search(
            &index,
            SearchQuery {
                base_path: Some("/a".into()),
                ..Default::default()
            },
        );
        assert_eq!(names(&index, &result), vec!["x.txt", "y.txt"]);
    }

    #[test]
    fn date_bounds() {
        let index = build_index(&[("/t/a", 1), ("/t/b", 2)]);
        // records carry modified=200
        let hit = search(
            &index,
            SearchQuery { min_modified: Some(150), max_modified: Some(250), ..Default::default() },
        );
        assert_eq!(hit.total_matches, 2);
        let miss = search(
            &index,
            SearchQuery { min_modified: Some(201), ..Default::default() },
        );
        assert_eq!(miss.total_matches, 0);
    }

    #[test]
    fn regex_query() {
        let index = build_index(&[("/a/test_1.rs", 1), ("/a/test_22.rs", 2), ("/a/other.rs", 3)]);
        let result = search(
            &index,
            SearchQuery {
                search_text: r"test_\d+\.rs$".to_string(),
                use_regex: true,
                ..Default::default()
            },
        );
        assert_eq!(result.total_matches, 2);
    }

    #[test]
    fn regex_and_wildcard_conflict() {
        let index = build_index(&[]);
        let err = execute(
            &index,
            &SearchQuery {
                search_text: "a*".to_string(),
                use_regex: true,
                use_wildcard: true,
                ..Default::default()
            },
            CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn bad_regex_is_invalid_query() {
        let index = build_index(&[]);
        let err = execute(
            &index,
            &SearchQuery {
                search_text: "(unclosed".to_string(),
                use_regex: true,
                ..Default::default()
            },
            CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn max_results_caps_stream() {
        let paths: Vec<(String, i64)> = (0..50).map(|i| (format!("/m/f{i}.log"), i)).collect();
        let borrowed: Vec<(&str, i64)> = paths.iter().map(|(p, s)| (p.as_str(), *s)).collect();
        let index = build_index(&borrowed);
        let result = search(
            &index,
            SearchQuery {
                max_results: 7,
                ..Default::default()
            },
        );
        assert_eq!(result.files.len(), 7);
        assert_eq!(result.total_matches, 7);
    }

    #[test]
    fn results_are_deterministic() {
        let index = build_index(&[("/a/one.txt", 1), ("/a/two.txt", 2), ("/b/three.txt", 3)]);
        let q = SearchQuery {
            search_text: "t".to_string(),
            ..Default::default()
        };
        let first = search(&index, q.clone());
        let second = search(&index, q);
        assert_eq!(first.files, second.files);
    }

    #[test]
    fn bloom_short_circuits_missing_substring() {
        let index = build_index(&[("/a/alpha.txt", 1), ("/a/beta.txt", 2)]);
        let result = search(
            &index,
            SearchQuery {
                search_text: "zzzyyy".to_string(),
                search_filename_only: true,
                ..Default::default()
            },
        );
        assert_eq!(result.total_matches, 0);
    }

    #[test]
    fn cancelled_scan_reports_cancelled() {
        let paths: Vec<(String, i64)> = (0..10_000).map(|i| (format!("/c/f{i}"), i)).collect();
        let borrowed: Vec<(&str, i64)> = paths.iter().map(|(p, s)| (p.as_str(), *s)).collect();
        let index = build_index(&borrowed);
        let cancel = CancelToken::new();
        cancel.cancel();
        let stream = execute(&index, &SearchQuery::default(), cancel).unwrap();
        assert!(matches!(collect(stream), Err(Error::Cancelled)));
    }

    #[test]
    fn rename_reflected_in_search() {
        let index = build_index(&[("/x/old.txt", 5)]);
        let opts = IndexingOptions::default();
        index
            .apply(&crate::monitor::ChangeEvent::renamed("/x/old.txt", "/x/new.txt"), &opts)
            .unwrap();

        let old_hits = search(
            &index,
            SearchQuery { search_text: "old".to_string(), ..Default::default() },
        );
        assert_eq!(old_hits.total_matches, 0);

        let new_hits = search(
            &index,
            SearchQuery { search_text: "new".to_string(), ..Default::default() },
        );
        assert_eq!(new_hits.total_matches, 1);
        assert_eq!(
            index.pool().get(new_hits.files[0].full_path_id),
            crate::paths::normalize("/x/new.txt")
        );
    }
}
