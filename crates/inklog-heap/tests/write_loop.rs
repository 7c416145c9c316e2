//! End-to-end write loop tests over the heap backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use inklog_core::buffer::{Condition, PutOptions};
use inklog_core::instruction;
use inklog_core::progress::{NullSink, Progress};
use inklog_core::{Config, Store, WriteEngine};
use inklog_heap::{HeapConfig, HeapStore};

fn setup(temp: &TempDir) -> (WriteEngine<HeapStore>, HeapStore) {
    let store = HeapStore::open(temp.path(), HeapConfig::fast()).unwrap();
    let engine = WriteEngine::new(Arc::new(store.clone()), Config::compact()).unwrap();
    (engine, store)
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within 5 seconds");
}

#[test]
fn test_sync_batch_applies_puts() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    let a = w.put(0, b"alpha", b"1", PutOptions::default()).unwrap();
    let b = w.put(0, b"beta", b"2", PutOptions::default()).unwrap();
    engine.write(w.batch_start()).unwrap();

    assert!(a.is_finished());
    assert!(b.is_finished());
    assert_eq!(store.get(0, b"alpha"), Some(b"1".to_vec()));
    assert_eq!(store.get(0, b"beta"), Some(b"2".to_vec()));
    assert_eq!(store.last_committed_txn_id(), 1);
}

#[test]
fn test_async_batch_commits_on_finish() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    let a = w.put(0, b"k", b"v", PutOptions::default()).unwrap();
    let handle = engine.start_writing(w.batch_start(), Arc::new(NullSink)).unwrap();

    wait_for(|| a.is_finished());
    // Applied inside the open transaction but not committed yet
    assert_eq!(store.get(0, b"k"), None);

    handle.finish();
    let stop = handle.join().unwrap();

    assert_eq!(store.get(0, b"k"), Some(b"v".to_vec()));
    // The stop slot carries the boundary stamps
    let flags = engine.log().load(stop);
    assert!(flags & instruction::TXN_DELIMITER != 0);
    assert!(flags & instruction::TXN_COMMITTED != 0);
    assert!(flags & instruction::BATCH_DELIMITER != 0);
}

#[test]
fn test_producer_wakes_parked_worker() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    let handle = engine.start_writing(w.batch_start(), Arc::new(NullSink)).unwrap();

    // Let the worker reach the dry slot and park
    thread::sleep(Duration::from_millis(50));

    let a = w.put(0, b"late", b"arrival", PutOptions::default()).unwrap();
    if w.take_resume_needed() {
        engine.resume().unwrap();
    }

    wait_for(|| a.is_finished());
    handle.finish();
    handle.join().unwrap();

    assert_eq!(store.get(0, b"late"), Some(b"arrival".to_vec()));
}

#[test]
fn test_failed_condition_block_skips_contents() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    let guard = w.start_condition_block(0, b"guard", Condition::Exists).unwrap();
    let inner = w.put(0, b"inner", b"x", PutOptions::default()).unwrap();
    w.block_end().unwrap();
    let after = w.put(0, b"after", b"y", PutOptions::default()).unwrap();
    engine.write(w.batch_start()).unwrap();

    assert!(guard.failed_condition());
    assert!(inner.failed_condition());
    assert!(!after.failed_condition());
    assert_eq!(store.get(0, b"inner"), None);
    assert_eq!(store.get(0, b"after"), Some(b"y".to_vec()));
}

#[test]
fn test_condition_value_block_gates_on_exact_match() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    w.put(0, b"cas", b"expected", PutOptions::default()).unwrap();
    engine.write(w.batch_start()).unwrap();

    let mut w = engine.writer();
    w.start_condition_value_block(0, b"cas", b"expected").unwrap();
    w.put(0, b"won", b"1", PutOptions::default()).unwrap();
    w.block_end().unwrap();
    w.start_condition_value_block(0, b"cas", b"wrong").unwrap();
    let lost = w.put(0, b"lost", b"1", PutOptions::default()).unwrap();
    w.block_end().unwrap();
    engine.write(w.batch_start()).unwrap();

    assert_eq!(store.get(0, b"won"), Some(b"1".to_vec()));
    assert!(lost.failed_condition());
    assert_eq!(store.get(0, b"lost"), None);
}

#[test]
fn test_version_stamp_and_if_version() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    w.put(0, b"doc", b"v1", PutOptions { set_version: Some(3.0), ..Default::default() })
        .unwrap();
    engine.write(w.batch_start()).unwrap();

    let stored = store.get(0, b"doc").unwrap();
    assert_eq!(&stored[8..], b"v1");
    let stamp = f64::from_bits(u64::from_le_bytes(stored[..8].try_into().unwrap()));
    assert_eq!(stamp, 3.0);

    let mut w = engine.writer();
    let ok = w
        .put(0, b"doc", b"v2", PutOptions { if_version: Some(3.0), set_version: Some(4.0), ..Default::default() })
        .unwrap();
    let stale = w
        .put(0, b"doc", b"v3", PutOptions { if_version: Some(3.0), set_version: Some(5.0), ..Default::default() })
        .unwrap();
    engine.write(w.batch_start()).unwrap();

    assert!(!ok.failed_condition());
    assert!(stale.failed_condition());
    assert_eq!(&store.get(0, b"doc").unwrap()[8..], b"v2");
}

#[test]
fn test_deletes_and_drop_database() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);
    let dbi = store.open_dbi(b"dups", true).unwrap();

    let mut w = engine.writer();
    w.put(dbi, b"k", b"a", PutOptions::default()).unwrap();
    w.put(dbi, b"k", b"b", PutOptions::default()).unwrap();
    w.put(dbi, b"other", b"x", PutOptions::default()).unwrap();
    engine.write(w.batch_start()).unwrap();

    let mut w = engine.writer();
    w.del_value(dbi, b"k", b"a").unwrap();
    let missing = w.del(dbi, b"nope").unwrap();
    engine.write(w.batch_start()).unwrap();

    assert_eq!(store.get_values(dbi, b"k"), vec![b"b".to_vec()]);
    // Deleting a missing key is a conflict, not a batch failure
    assert!(missing.failed_condition());

    let mut w = engine.writer();
    w.drop_db(dbi, false).unwrap();
    engine.write(w.batch_start()).unwrap();
    assert_eq!(store.entry_count(dbi), Some(0));
}

#[test]
fn test_progress_events() {
    let temp = TempDir::new().unwrap();
    let (engine, _store) = setup(&temp);

    let events: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink = Arc::new(move |p: Progress| {
        sink_events.lock().push(p);
    });

    let mut w = engine.writer();
    w.put(0, b"k", b"v", PutOptions::default()).unwrap();
    let cb = w.user_callback(false).unwrap();
    let handle = engine.start_writing(w.batch_start(), sink).unwrap();

    wait_for(|| cb.is_finished());
    handle.finish();
    handle.join().unwrap();

    let events = events.lock();
    assert!(events
        .iter()
        .any(|e| matches!(e, Progress::UserCallback { strict: false, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, Progress::TxnBoundary { txn_id: 1 })));
    assert_eq!(events.last(), Some(&Progress::BatchDone));
}

#[test]
fn test_strict_callback_holds_following_put() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let events: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink = Arc::new(move |p: Progress| {
        sink_events.lock().push(p);
    });

    let mut w = engine.writer();
    let before = w.put(0, b"before", b"1", PutOptions::default()).unwrap();
    let cb = w.user_callback(true).unwrap();
    let after = w.put(0, b"after", b"2", PutOptions::default()).unwrap();
    let handle = engine.start_writing(w.batch_start(), sink).unwrap();

    wait_for(|| {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, Progress::UserCallback { strict: true, .. }))
    });
    wait_for(|| engine.with_current_txn(|_| ()).is_ok());

    // The acknowledgment is deliberately late; the following put must not
    // run ahead of it.
    thread::sleep(Duration::from_millis(100));
    assert!(before.is_finished());
    assert!(!cb.is_finished());
    assert!(!after.is_finished());

    handle.resume();
    wait_for(|| after.is_finished());
    handle.finish();
    handle.join().unwrap();

    assert!(cb.is_finished());
    assert_eq!(store.get(0, b"before"), Some(b"1".to_vec()));
    assert_eq!(store.get(0, b"after"), Some(b"2".to_vec()));
}

#[test]
fn test_no_overwrite_is_nonfatal() {
    let temp = TempDir::new().unwrap();
    let (engine, store) = setup(&temp);

    let mut w = engine.writer();
    w.put(0, b"k", b"first", PutOptions::default()).unwrap();
    let refused = w
        .put(0, b"k", b"second", PutOptions { no_overwrite: true, ..Default::default() })
        .unwrap();
    let later = w.put(0, b"l", b"applies", PutOptions::default()).unwrap();
    engine.write(w.batch_start()).unwrap();

    assert!(refused.failed_condition());
    assert!(!later.failed_condition());
    assert_eq!(store.get(0, b"k"), Some(b"first".to_vec()));
    assert_eq!(store.get(0, b"l"), Some(b"applies".to_vec()));
}
