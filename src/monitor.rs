//! Live change monitoring.
//!
//! Watches roots through the platform watcher (inotify on Linux,
//! ReadDirectoryChangesW on Windows, both via `notify`) and folds raw
//! notifications directly into a per-window coalescing table. Rename
//! halves are matched through the watcher's rename cookie; a source
//! half whose destination never arrives ages out as a deletion when the
//! window is flushed. Delivery goes through a bounded queue: on
//! overflow the oldest ordinary event is dropped and a `Resync` for the
//! affected root takes its place, which the index answers with a full
//! rescan of that subtree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CancelToken, ChangeMask, MonitoringOptions};

/// Raw watcher events are drained at this granularity.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Delivery queue depth before DropOldest kicks in.
const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
    /// The watcher lost events for this root; the subtree must be
    /// re-enumerated.
    Resync,
}

/// Wire shape of one change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub new_path: String,
    /// Nanoseconds since the Unix epoch.
    pub time: i64,
}

impl ChangeEvent {
    pub fn created(path: impl Into<String>) -> Self {
        Self { kind: ChangeKind::Created, old_path: None, new_path: path.into(), time: now_nanos() }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self { kind: ChangeKind::Modified, old_path: None, new_path: path.into(), time: now_nanos() }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self { kind: ChangeKind::Deleted, old_path: None, new_path: path.into(), time: now_nanos() }
    }

    pub fn renamed(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            old_path: Some(old.into()),
            new_path: new.into(),
            time: now_nanos(),
        }
    }

    pub fn resync(root: impl Into<String>) -> Self {
        Self { kind: ChangeKind::Resync, old_path: None, new_path: root.into(), time: now_nanos() }
    }
}

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

struct QueueInner {
    deque: VecDeque<ChangeEvent>,
    /// Roots with an undelivered Resync; suppresses duplicates.
    resync_pending: HashSet<String>,
    closed: bool,
}

/// Bounded delivery queue with DropOldest overflow. Dropping an event
/// enqueues a `Resync` for the owning root in its place, so consumers
/// always learn that the stream lost data.
pub(crate) struct BoundedEventQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
    roots: Vec<String>,
}

impl BoundedEventQueue {
    pub(crate) fn new(capacity: usize, roots: Vec<String>) -> Self {
        BoundedEventQueue {
            inner: Mutex::new(QueueInner {
                deque: VecDeque::with_capacity(capacity),
                resync_pending: HashSet::new(),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
            roots,
        }
    }

    fn owning_root(&self, path: &str) -> String {
        self.roots
            .iter()
            .find(|r| crate::paths::starts_with(path, r))
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }

    pub(crate) fn push(&self, event: ChangeEvent) {
        let mut inner = self.inner.lock();
        if inner.deque.len() >= self.capacity {
            // evict the oldest ordinary event; injected Resyncs survive
            let victim = inner.deque.iter().position(|e| e.kind != ChangeKind::Resync);
            if let Some(idx) = victim {
                let dropped = inner.deque.remove(idx).expect("victim index valid");
                let root = self.owning_root(&dropped.new_path);
                warn!("monitor queue overflow, dropped {:?} {}", dropped.kind, dropped.new_path);
                if inner.resync_pending.insert(root.clone()) {
                    inner.deque.push_front(ChangeEvent::resync(root));
                }
            }
        }
        inner.deque.push_back(event);
        drop(inner);
        self.available.notify_one();
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(event) = inner.deque.pop_front() {
                if event.kind == ChangeKind::Resync {
                    inner.resync_pending.remove(&event.new_path);
                }
                return Some(event);
            }
            if inner.closed {
                return None;
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }

    pub(crate) fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().deque.len()
    }
}

/// Handle to a running monitor; the event stream is infinite until the
/// cancel token fires or the watcher is lost.
pub struct MonitorHandle {
    queue: Arc<BoundedEventQueue>,
    error: Arc<Mutex<Option<Error>>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Next event, or `None` after `timeout` or once the stream closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        self.queue.recv_timeout(timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// The terminal watcher error, if the stream ended abnormally.
    pub fn take_error(&self) -> Option<Error> {
        self.error.lock().take()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Key for a rename source waiting on its destination half. Backends
/// that tag the pair share a kernel cookie; untagged sources get a
/// window-local sequence number and pair oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RenameKey {
    Cookie(usize),
    Seq(usize),
}

struct RenameSource {
    path: String,
    seen: Instant,
}

/// One debounce window's worth of change state: a per-path coalescing
/// table in arrival order plus the rename sources still waiting to be
/// paired.
struct ChangeWindow {
    slots: Vec<Option<ChangeEvent>>,
    slot_of: HashMap<String, usize>,
    rename_sources: HashMap<RenameKey, RenameSource>,
    untagged_seq: usize,
    /// A source older than this when the window flushes is treated as a
    /// deletion (its file left the watched tree).
    source_ttl: Duration,
}

impl ChangeWindow {
    fn new(source_ttl: Duration) -> Self {
        ChangeWindow {
            slots: Vec::new(),
            slot_of: HashMap::new(),
            rename_sources: HashMap::new(),
            untagged_seq: 0,
            source_ttl,
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.rename_sources.is_empty()
    }

    /// Fold one raw watcher notification into the window.
    fn absorb(&mut self, event: Event) {
        let tracker = event.tracker();
        match event.kind {
            EventKind::Create(_) => {
                for path in event.paths {
                    self.merge_path(ChangeEvent::created(normalize_buf(&path)));
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.merge_path(ChangeEvent::deleted(normalize_buf(&path)));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => {
                self.absorb_rename(mode, event.paths, tracker);
            }
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.merge_path(ChangeEvent::modified(normalize_buf(&path)));
                }
            }
            _ => {}
        }
    }

    fn absorb_rename(&mut self, mode: RenameMode, paths: Vec<PathBuf>, tracker: Option<usize>) {
        match mode {
            RenameMode::Both => {
                let mut paths = paths.into_iter();
                if let (Some(old), Some(new)) = (paths.next(), paths.next()) {
                    self.merge_path(ChangeEvent::renamed(normalize_buf(&old), normalize_buf(&new)));
                }
            }
            RenameMode::From => {
                let Some(path) = paths.into_iter().next() else { return };
                let key = match tracker {
                    Some(cookie) => RenameKey::Cookie(cookie),
                    None => {
                        self.untagged_seq += 1;
                        RenameKey::Seq(self.untagged_seq)
                    }
                };
                self.rename_sources.insert(
                    key,
                    RenameSource { path: normalize_buf(&path), seen: Instant::now() },
                );
            }
            RenameMode::To => {
                let Some(new_path) = paths.into_iter().next() else { return };
                let new_path = normalize_buf(&new_path);
                match self.take_source(tracker) {
                    Some(old_path) => self.merge_path(ChangeEvent::renamed(old_path, new_path)),
                    // a destination with no source half reads as new
                    None => self.merge_path(ChangeEvent::created(new_path)),
                }
            }
            _ => {
                for path in paths {
                    self.merge_path(ChangeEvent::modified(normalize_buf(&path)));
                }
            }
        }
    }

    fn take_source(&mut self, tracker: Option<usize>) -> Option<String> {
        if let Some(cookie) = tracker {
            if let Some(src) = self.rename_sources.remove(&RenameKey::Cookie(cookie)) {
                return Some(src.path);
            }
        }
        let oldest = self
            .rename_sources
            .keys()
            .filter_map(|k| match k {
                RenameKey::Seq(seq) => Some(*seq),
                RenameKey::Cookie(_) => None,
            })
            .min()?;
        self.rename_sources
            .remove(&RenameKey::Seq(oldest))
            .map(|src| src.path)
    }

    /// Coalesce an event into its path's slot. Modified+Modified stays
    /// one Modified, Created+Modified stays Created, Created+Deleted
    /// cancels out, anything else ends as its final state; renames key
    /// by their new path.
    fn merge_path(&mut self, event: ChangeEvent) {
        match self.slot_of.get(&event.new_path) {
            Some(&i) => {
                self.slots[i] = match self.slots[i].take() {
                    Some(prev) => merge(&prev, event),
                    None => Some(event),
                };
            }
            None => {
                self.slot_of.insert(event.new_path.clone(), self.slots.len());
                self.slots.push(Some(event));
            }
        }
    }

    /// Empty the window in arrival order. Rename sources past their TTL
    /// (all of them when `flush_all`) leave as deletions; younger ones
    /// stay behind to meet a destination in the next window.
    fn drain(&mut self, flush_all: bool) -> Vec<ChangeEvent> {
        let aged: Vec<RenameKey> = self
            .rename_sources
            .iter()
            .filter(|(_, src)| flush_all || src.seen.elapsed() >= self.source_ttl)
            .map(|(key, _)| *key)
            .collect();
        for key in aged {
            if let Some(src) = self.rename_sources.remove(&key) {
                self.merge_path(ChangeEvent::deleted(src.path));
            }
        }
        self.slot_of.clear();
        self.slots.drain(..).flatten().collect()
    }
}

/// `None` means the pair cancels out (Created followed by Deleted).
fn merge(prev: &ChangeEvent, next: ChangeEvent) -> Option<ChangeEvent> {
    use ChangeKind::*;
    let mut out = next;
    match (prev.kind, out.kind) {
        (Created, Modified) => out.kind = Created,
        (Created, Deleted) => return None,
        (Deleted, Created) => out.kind = Modified,
        (Renamed, Modified) => {
            let time = out.time;
            out = prev.clone();
            out.time = time;
        }
        _ => {}
    }
    Some(out)
}

fn normalize_buf(path: &std::path::Path) -> String {
    crate::paths::normalize(&path.to_string_lossy())
}

/// Start watching `roots`. The returned handle's queue receives
/// coalesced events; dropping the handle (or cancelling) stops the
/// watcher thread.
pub fn start(
    roots: &[PathBuf],
    options: MonitoringOptions,
    cancel: CancelToken,
) -> Result<MonitorHandle> {
    let root_strings: Vec<String> = roots.iter().map(|r| normalize_buf(r)).collect();
    let queue = Arc::new(BoundedEventQueue::new(EVENT_QUEUE_CAPACITY, root_strings));
    let error = Arc::new(Mutex::new(None));

    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let watcher = create_watcher(tx.clone(), roots, &options)?;

    let thread_queue = Arc::clone(&queue);
    let thread_error = Arc::clone(&error);
    let thread_roots = roots.to_vec();
    let thread = std::thread::Builder::new()
        .name("fastfind-monitor".to_string())
        .spawn(move || {
            event_loop(
                watcher, tx, rx, thread_roots, options, cancel, thread_queue, thread_error,
            );
        })
        .map_err(Error::Io)?;

    Ok(MonitorHandle { queue, error, thread: Some(thread) })
}

fn create_watcher(
    tx: mpsc::Sender<notify::Result<Event>>,
    roots: &[PathBuf],
    options: &MonitoringOptions,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(tx, Config::default())
        .map_err(|e| Error::WatcherLost(e.to_string()))?;
    let mode = if options.include_subdirectories {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    let mut watched = 0;
    for root in roots {
        match watcher.watch(root, mode) {
            Ok(()) => watched += 1,
            Err(e) => warn!("skipping unwatchable root {}: {e}", root.display()),
        }
    }
    if watched == 0 {
        return Err(Error::WatcherLost("no roots could be watched".to_string()));
    }
    debug!("watcher started on {watched}/{} root(s)", roots.len());
    Ok(watcher)
}

#[allow(clippy::too_many_arguments)]
fn event_loop(
    mut watcher: RecommendedWatcher,
    tx: mpsc::Sender<notify::Result<Event>>,
    rx: mpsc::Receiver<notify::Result<Event>>,
    roots: Vec<PathBuf>,
    options: MonitoringOptions,
    cancel: CancelToken,
    queue: Arc<BoundedEventQueue>,
    error: Arc<Mutex<Option<Error>>>,
) {
    let mut window = ChangeWindow::new(options.debounce_interval);
    let mut last_flush = Instant::now();
    let mut reconnected = false;

    loop {
        if cancel.is_cancelled() || queue.is_closed() {
            break;
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(event)) => {
                window.absorb(event);
                // drain whatever else accumulated
                while let Ok(Ok(event)) = rx.try_recv() {
                    window.absorb(event);
                }
            }
            Ok(Err(e)) => {
                if reconnected {
                    error!("watcher failed again after reconnect: {e}");
                    *error.lock() = Some(Error::WatcherLost(e.to_string()));
                    push_resyncs(&queue, &roots);
                    break;
                }
                warn!("watcher error, attempting one reconnect: {e}");
                reconnected = true;
                match create_watcher(tx.clone(), &roots, &options) {
                    Ok(w) => {
                        watcher = w;
                        push_resyncs(&queue, &roots);
                    }
                    Err(err) => {
                        error!("reconnect failed: {err}");
                        *error.lock() = Some(err);
                        push_resyncs(&queue, &roots);
                        break;
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if !window.is_empty() && last_flush.elapsed() >= options.debounce_interval {
            deliver(window.drain(false), options.change_mask, &queue);
            last_flush = Instant::now();
        }
    }

    // deliver whatever is left before closing
    deliver(window.drain(true), options.change_mask, &queue);
    queue.close();
    drop(watcher);
}

fn push_resyncs(queue: &BoundedEventQueue, roots: &[PathBuf]) {
    for root in roots {
        queue.push(ChangeEvent::resync(normalize_buf(root)));
    }
}

fn deliver(events: Vec<ChangeEvent>, mask: ChangeMask, queue: &BoundedEventQueue) {
    for event in events {
        let wanted = match event.kind {
            ChangeKind::Created => mask.contains(ChangeMask::CREATED),
            ChangeKind::Modified => mask.contains(ChangeMask::MODIFIED),
            ChangeKind::Deleted => mask.contains(ChangeMask::DELETED),
            ChangeKind::Renamed => mask.contains(ChangeMask::RENAMED),
            ChangeKind::Resync => true,
        };
        if wanted {
            queue.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn window() -> ChangeWindow {
        ChangeWindow::new(Duration::from_millis(300))
    }

    fn create(path: &str) -> Event {
        Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from(path))
    }

    fn modify(path: &str) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(PathBuf::from(path))
    }

    fn remove(path: &str) -> Event {
        Event::new(EventKind::Remove(RemoveKind::File)).add_path(PathBuf::from(path))
    }

    fn rename_from(path: &str, cookie: usize) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path(PathBuf::from(path))
            .set_tracker(cookie)
    }

    fn rename_to(path: &str, cookie: usize) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from(path))
            .set_tracker(cookie)
    }

    fn drain(queue: &BoundedEventQueue) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        while let Some(e) = queue.recv_timeout(Duration::from_millis(1)) {
            out.push(e);
        }
        out
    }

    #[test]
    fn modified_bursts_coalesce_per_path() {
        let mut w = window();
        w.absorb(modify("/r/a"));
        w.absorb(modify("/r/a"));
        w.absorb(modify("/r/b"));
        let events = w.drain(false);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == ChangeKind::Modified));
    }

    #[test]
    fn created_then_modified_is_created() {
        let mut w = window();
        w.absorb(create("/r/new"));
        w.absorb(modify("/r/new"));
        let events = w.drain(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Created);
    }

    #[test]
    fn created_then_deleted_cancels() {
        let mut w = window();
        w.absorb(create("/r/tmp"));
        w.absorb(remove("/r/tmp"));
        assert!(w.drain(false).is_empty());
    }

    #[test]
    fn deleted_then_created_is_modified() {
        let mut w = window();
        w.absorb(remove("/r/f"));
        w.absorb(create("/r/f"));
        let events = w.drain(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn cookie_pairs_rename_halves() {
        let mut w = window();
        w.absorb(rename_from("/r/old.txt", 7));
        w.absorb(rename_to("/r/new.txt", 7));
        let events = w.drain(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Renamed);
        assert_eq!(events[0].old_path.as_deref(), Some("/r/old.txt"));
        assert_eq!(events[0].new_path, "/r/new.txt");
    }

    #[test]
    fn untagged_sources_pair_oldest_first() {
        let mut w = window();
        w.absorb(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(PathBuf::from("/r/first")),
        );
        w.absorb(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                .add_path(PathBuf::from("/r/second")),
        );
        w.absorb(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
                .add_path(PathBuf::from("/r/dest")),
        );
        let events = w.drain(true);
        let renamed = events.iter().find(|e| e.kind == ChangeKind::Renamed).unwrap();
        assert_eq!(renamed.old_path.as_deref(), Some("/r/first"));
        // the second source never paired and aged out as a delete
        assert!(events
            .iter()
            .any(|e| e.kind == ChangeKind::Deleted && e.new_path == "/r/second"));
    }

    #[test]
    fn destination_without_source_is_created() {
        let mut w = window();
        w.absorb(rename_to("/r/appeared.txt", 9));
        let events = w.drain(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Created);
    }

    #[test]
    fn unpaired_source_survives_early_flush_then_ages_out() {
        let mut w = window();
        w.absorb(rename_from("/r/waiting", 3));
        // too young to age out on an ordinary flush
        assert!(w.drain(false).is_empty());
        assert!(!w.is_empty());
        // final flush treats it as deleted
        let events = w.drain(true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Deleted);
        assert_eq!(events[0].new_path, "/r/waiting");
        assert!(w.is_empty());
    }

    #[test]
    fn rename_via_both_mode() {
        let mut w = window();
        w.absorb(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(PathBuf::from("/r/old.txt"))
                .add_path(PathBuf::from("/r/new.txt")),
        );
        let events = w.drain(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Renamed);
        assert_eq!(events[0].old_path.as_deref(), Some("/r/old.txt"));
    }

    #[test]
    fn queue_overflow_drops_oldest_and_injects_resync() {
        let queue = BoundedEventQueue::new(3, vec!["/r".to_string()]);
        for i in 0..5 {
            queue.push(ChangeEvent::modified(format!("/r/f{i}")));
        }
        let events = drain(&queue);
        // first delivered event must be the resync for the root
        assert_eq!(events[0].kind, ChangeKind::Resync);
        assert_eq!(events[0].new_path, "/r");
        // only one resync per root per burst
        assert_eq!(
            events.iter().filter(|e| e.kind == ChangeKind::Resync).count(),
            1
        );
        // newest events survived
        assert!(events.iter().any(|e| e.new_path == "/r/f4"));
    }

    #[test]
    fn queue_close_ends_stream() {
        let queue = BoundedEventQueue::new(4, vec![]);
        queue.push(ChangeEvent::created("/x/a"));
        queue.close();
        assert_eq!(
            queue.recv_timeout(Duration::from_millis(1)).map(|e| e.kind),
            Some(ChangeKind::Created)
        );
        assert_eq!(queue.recv_timeout(Duration::from_millis(1)), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn event_wire_shape() {
        let e = ChangeEvent::renamed("/a/old", "/a/new");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "Renamed");
        assert_eq!(json["oldPath"], "/a/old");
        assert_eq!(json["newPath"], "/a/new");
        assert!(json["time"].as_i64().is_some());

        let d = ChangeEvent::deleted("/a/x");
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("oldPath").is_none());
    }
}
