//! Live change monitoring and resync behavior against real directories.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fastfind::monitor::{self, ChangeEvent, ChangeKind};
use fastfind::{
    Backend, CancelToken, Engine, FileRecord, Index, IndexingOptions, MonitoringOptions,
    PosixWalkEnumerator, SearchQuery, StringPool,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_monitor_options() -> MonitoringOptions {
    MonitoringOptions {
        debounce_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

/// Wait for an event whose path ends with `suffix`.
fn wait_for_event(
    handle: &monitor::MonitorHandle,
    suffix: &str,
    timeout: Duration,
) -> Option<ChangeEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(event) = handle.recv_timeout(Duration::from_millis(200)) {
            if event.new_path.ends_with(suffix) {
                return Some(event);
            }
        }
    }
    None
}

#[test]
fn watcher_reports_create_and_delete() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let handle = match monitor::start(
        &[dir.path().to_path_buf()],
        fast_monitor_options(),
        cancel.clone(),
    ) {
        Ok(h) => h,
        Err(e) => {
            // environments without inotify watches get a pass
            eprintln!("watcher unavailable, skipping: {e}");
            return;
        }
    };

    let file = dir.path().join("created.txt");
    std::fs::write(&file, b"hello").unwrap();
    let event = wait_for_event(&handle, "created.txt", Duration::from_secs(10))
        .expect("create event delivered");
    assert!(matches!(event.kind, ChangeKind::Created | ChangeKind::Modified));
    assert!(event.time > 0);

    std::fs::remove_file(&file).unwrap();
    let event = wait_for_event(&handle, "created.txt", Duration::from_secs(10))
        .expect("delete event delivered");
    assert!(matches!(event.kind, ChangeKind::Deleted | ChangeKind::Modified));

    cancel.cancel();
}

#[test]
fn rename_is_paired_or_decomposed() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("old_name.txt");
    std::fs::write(&old, b"x").unwrap();

    let cancel = CancelToken::new();
    let handle = match monitor::start(
        &[dir.path().to_path_buf()],
        fast_monitor_options(),
        cancel.clone(),
    ) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("watcher unavailable, skipping: {e}");
            return;
        }
    };

    std::fs::rename(&old, dir.path().join("new_name.txt")).unwrap();
    let event = wait_for_event(&handle, "new_name.txt", Duration::from_secs(10))
        .expect("rename produces an event for the new path");
    match event.kind {
        ChangeKind::Renamed => {
            assert!(event.old_path.expect("old path").ends_with("old_name.txt"));
        }
        // some backends report rename halves separately
        ChangeKind::Created | ChangeKind::Modified => {}
        other => panic!("unexpected event kind {other:?}"),
    }
    cancel.cancel();
}

fn synthetic_record(index: &Index, path: &str) -> FileRecord {
    let ids = index.pool().intern_path_components(path).unwrap();
    FileRecord {
        full_path_id: ids.full_path_id,
        name_id: ids.name_id,
        dir_id: ids.dir_id,
        ext_id: ids.ext_id,
        size: 1,
        created: 1,
        modified: 1,
        accessed: 1,
        attrs: Default::default(),
    }
}

/// The index half of the overflow story: a Resync for a root replaces
/// whatever the index believed about that subtree with what is on disk.
#[test]
fn resync_reconciles_subtree_with_disk() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("real_a.txt"), b"a").unwrap();
    std::fs::write(dir.path().join("real_b.txt"), b"b").unwrap();

    let index = Index::new(Arc::new(StringPool::new()));
    let root = dir.path().to_string_lossy().to_string();
    // a stale record for a file that no longer exists
    index.insert(synthetic_record(&index, &format!("{root}/ghost.txt")));

    let opts = IndexingOptions {
        include_hidden: true,
        ..Default::default()
    };
    index.apply(&ChangeEvent::resync(root.clone()), &opts).unwrap();

    let snapshot = index.snapshot_state();
    let live: Vec<String> = snapshot
        .iter_live()
        .map(|r| index.pool().get(r.name_id).to_string())
        .collect();
    assert!(live.iter().any(|n| n == "real_a.txt"));
    assert!(live.iter().any(|n| n == "real_b.txt"));
    assert!(!live.iter().any(|n| n == "ghost.txt"));
}

/// Full loop: engine indexes with monitoring enabled, a new file shows
/// up in search results without a manual refresh.
#[test]
fn engine_monitoring_keeps_index_live() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("seed.txt"), b"s").unwrap();

    let engine = Engine::with_backend(Backend::Walk(PosixWalkEnumerator::new()));
    engine.set_monitoring_options(fast_monitor_options());
    engine
        .start_indexing(IndexingOptions {
            roots: vec![dir.path().to_path_buf()],
            enable_monitoring: true,
            ..Default::default()
        })
        .unwrap();
    assert!(engine.wait_for_indexing(Duration::from_secs(60)));

    // give the watcher a moment to arm; skip quietly where unavailable
    let armed_by = Instant::now() + Duration::from_secs(5);
    while !engine.is_monitoring() && Instant::now() < armed_by {
        std::thread::sleep(Duration::from_millis(50));
    }
    if !engine.is_monitoring() {
        eprintln!("monitoring unavailable in this environment, skipping");
        return;
    }

    std::fs::write(dir.path().join("appeared.txt"), b"new").unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    let query = SearchQuery {
        search_text: "appeared.txt".to_string(),
        search_filename_only: true,
        ..Default::default()
    };
    let mut found = false;
    while Instant::now() < deadline {
        if engine.search(&query).unwrap().total_matches == 1 {
            found = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    assert!(found, "created file never reached the index");
    engine.stop_indexing();
}

#[test]
fn event_wire_shape_matches_contract() {
    let event = ChangeEvent::renamed("/r/a.txt", "/r/b.txt");
    let value = serde_json::to_value(&event).unwrap();
    let object = value.as_object().unwrap();
    assert_eq!(object["kind"], "Renamed");
    assert_eq!(object["oldPath"], "/r/a.txt");
    assert_eq!(object["newPath"], "/r/b.txt");
    assert!(object["time"].is_i64());

    let roundtrip: ChangeEvent = serde_json::from_value(value).unwrap();
    assert_eq!(roundtrip, event);
}

#[test]
fn resync_path_is_normalized_root() {
    let event = ChangeEvent::resync("/watched/root");
    assert_eq!(event.kind, ChangeKind::Resync);
    assert_eq!(event.new_path, "/watched/root");
    assert!(event.old_path.is_none());
    let _ = Path::new(&event.new_path);
}
