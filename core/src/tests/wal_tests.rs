use std::fs;
use std::path::Path;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use super::{file_config, payload};
use crate::config::StoreConfig;
use crate::engine::{Engine, Recid};
use crate::error::StoreError;
use crate::store::StoreWal;

/// Expected contents of a handful of recids.
type Snapshot = Vec<(Recid, Option<Vec<u8>>)>;

fn assert_snapshot(store: &StoreWal, expected: &Snapshot) {
    for (recid, data) in expected {
        assert_eq!(&store.get_bytes(*recid).unwrap(), data, "recid {recid}");
    }
}

fn copy_files(config: &StoreConfig, to: &Path) {
    for suffix in ["", ".p"] {
        let from = config.file_path(suffix).unwrap();
        fs::copy(&from, to.join(format!("template{suffix}"))).unwrap();
    }
}

fn restore_files(config: &StoreConfig, from: &Path) {
    for suffix in ["", ".p"] {
        let to = config.file_path(suffix).unwrap();
        fs::copy(from.join(format!("template{suffix}")), &to).unwrap();
    }
}

#[test]
fn test_rollback_isolates_transaction() {
    let store = StoreWal::memory().unwrap();
    let a = store.put_bytes(b"committed").unwrap();
    store.commit().unwrap();

    store.update_bytes(a, &payload(90_000, 1)).unwrap();
    let b = store.put_bytes(b"uncommitted").unwrap();
    assert_eq!(store.get_bytes(a).unwrap().unwrap(), payload(90_000, 1));
    assert_eq!(store.get_bytes(b).unwrap().unwrap(), b"uncommitted");

    store.rollback().unwrap();
    assert_eq!(store.get_bytes(a).unwrap().unwrap(), b"committed");
    assert_eq!(store.get_bytes(b).unwrap(), None);
    assert_eq!(store.put_bytes(b"again").unwrap(), b);
    store.commit().unwrap();
    store.check_consistency().unwrap();
}

#[test]
fn test_uncommitted_changes_lost_on_reopen() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let (kept, dropped);
    {
        let store = StoreWal::open(&config).unwrap();
        kept = store.put_bytes(b"kept").unwrap();
        store.commit().unwrap();
        store.update_bytes(kept, b"overwritten").unwrap();
        dropped = store.put_bytes(b"dropped").unwrap();
    }
    assert!(!dir.path().join("store.wal").exists());

    let store = StoreWal::open(&config).unwrap();
    assert_eq!(store.get_bytes(kept).unwrap().unwrap(), b"kept");
    assert_eq!(store.get_bytes(dropped).unwrap(), None);
    store.check_consistency().unwrap();
}

#[test]
fn test_commit_survives_reopen() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let big = payload(150_000, 4);
    let recid;
    {
        let store = StoreWal::open(&config).unwrap();
        recid = store.put_bytes(&big).unwrap();
        store.commit().unwrap();
        assert!(!dir.path().join("store.wal").exists());
    }
    let store = StoreWal::open(&config).unwrap();
    assert_eq!(store.get_bytes(recid).unwrap().unwrap(), big);
    store.check_consistency().unwrap();
}

#[test]
fn test_crash_at_every_log_length() {
    let dir = tempdir().unwrap();
    let saved = tempdir().unwrap();
    let config = file_config(dir.path());

    let (a, b, c);
    {
        let store = StoreWal::open(&config).unwrap();
        a = store.put_bytes(b"alpha").unwrap();
        b = store.put_bytes(&payload(300, 2)).unwrap();
        c = store.put_bytes(b"gamma").unwrap();
        store.commit().unwrap();
    }
    copy_files(&config, saved.path());
    let before: Snapshot = vec![
        (a, Some(b"alpha".to_vec())),
        (b, Some(payload(300, 2))),
        (c, Some(b"gamma".to_vec())),
    ];

    let store = StoreWal::open(&config).unwrap();
    store.update_bytes(a, b"alpha, rewritten and longer").unwrap();
    let d = store.put_bytes(b"delta").unwrap();
    store.delete(b).unwrap();
    let end = store.crash_after_seal().unwrap() as usize;
    assert!(end > 16);

    let log_path = dir.path().join("store.wal");
    let log = fs::read(&log_path).unwrap();
    let log = &log[..end];
    let after: Snapshot = vec![
        (a, Some(b"alpha, rewritten and longer".to_vec())),
        (b, None),
        (c, Some(b"gamma".to_vec())),
        (d, Some(b"delta".to_vec())),
    ];

    for cut in 0..end {
        restore_files(&config, saved.path());
        fs::write(&log_path, &log[..cut]).unwrap();
        let store = StoreWal::open(&config).unwrap();
        assert!(!log_path.exists(), "log kept after recovery at cut {cut}");
        assert_snapshot(&store, &before);
        store.check_consistency().unwrap();
    }

    restore_files(&config, saved.path());
    fs::write(&log_path, log).unwrap();
    let store = StoreWal::open(&config).unwrap();
    assert!(!log_path.exists());
    assert_snapshot(&store, &after);
    store.check_consistency().unwrap();
}

#[test]
fn test_read_only_refuses_pending_log() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let recid;
    {
        let store = StoreWal::open(&config).unwrap();
        recid = store.put_bytes(b"sealed but not applied").unwrap();
        store.crash_after_seal().unwrap();
    }

    let read_only = config.clone().with_read_only(true);
    assert!(matches!(StoreWal::open(&read_only), Err(StoreError::Unsupported(_))));
    assert!(dir.path().join("store.wal").exists());

    drop(StoreWal::open(&config).unwrap());
    let store = StoreWal::open(&read_only).unwrap();
    assert_eq!(store.get_bytes(recid).unwrap().unwrap(), b"sealed but not applied");
}

#[test]
fn test_garbage_log_is_discarded() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let recid;
    {
        let store = StoreWal::open(&config).unwrap();
        recid = store.put_bytes(b"safe").unwrap();
        store.commit().unwrap();
    }

    let log_path = dir.path().join("store.wal");
    fs::write(&log_path, b"this is not a write-ahead log at all").unwrap();
    let store = StoreWal::open(&config).unwrap();
    assert!(!log_path.exists());
    assert_eq!(store.get_bytes(recid).unwrap().unwrap(), b"safe");
    store.check_consistency().unwrap();
}

#[test]
fn test_commit_without_changes_writes_no_log() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let store = StoreWal::open(&config).unwrap();
    store.commit().unwrap();
    assert!(!dir.path().join("store.wal").exists());
    store.rollback().unwrap();
    store.close().unwrap();
    assert!(store.is_closed());
}
