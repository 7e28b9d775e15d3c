//! Tests for the MVCC store: revisions, history, compaction, hashes.

use std::sync::Arc;
use std::time::Duration;
use strata::error::Error;
use strata::lease::Lessor;
use strata::mvcc::store::{KvStore, RangeOptions, SortOrder, SortTarget, WriteTxn};
use strata::mvcc::revision::Revision;
use strata::mvcc::{Event, KeyRange};
use strata::storage::backend::Backend;
use tempfile::TempDir;

struct Stack {
    store: Arc<KvStore>,
    lessor: Arc<Lessor>,
    backend: Arc<Backend>,
    _dir: TempDir,
}

fn stack() -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        Backend::open(&dir.path().join("db"), 1024, Duration::from_millis(100)).unwrap(),
    );
    let lessor = Lessor::recover(Arc::clone(&backend), 1).unwrap();
    let store =
        Arc::new(KvStore::recover(Arc::clone(&backend), Arc::clone(&lessor)).unwrap());
    Stack {
        store,
        lessor,
        backend,
        _dir: dir,
    }
}

/// Run `f` inside one write transaction over one batch critical
/// section, the way the apply pipeline drives the store.
fn with_txn<R>(
    s: &Stack,
    f: impl FnOnce(&mut WriteTxn<'_, '_, '_>) -> R,
) -> (R, i64, Vec<Event>) {
    let tx = s.backend.batch_tx();
    let mut batch = tx.lock().unwrap();
    let mut txn = s.store.write_tx(&mut batch).unwrap();
    let out = f(&mut txn);
    let (rev, events) = txn.end();
    batch.unlock().unwrap();
    (out, rev, events)
}

fn put(s: &Stack, key: &[u8], value: &[u8]) -> i64 {
    let (result, rev, _) = with_txn(s, |txn| txn.put(key, value, 0));
    result.unwrap();
    rev
}

fn delete(s: &Stack, range: &KeyRange) -> (i64, i64, Vec<Event>) {
    let (result, rev, events) = with_txn(s, |txn| txn.delete_range(range));
    let (n, _) = result.unwrap();
    (n, rev, events)
}

fn compact(s: &Stack, rev: i64) -> strata::error::Result<Vec<(Revision, bool)>> {
    let tx = s.backend.batch_tx();
    let mut batch = tx.lock()?;
    let removed = s.store.compact(rev, &mut batch)?;
    batch.unlock()?;
    Ok(removed)
}

fn single(key: &[u8]) -> KeyRange {
    KeyRange::Single(key.to_vec())
}

#[test]
fn empty_store_sits_at_revision_one() {
    let s = stack();
    assert_eq!(s.store.current_revision(), 1);
    assert_eq!(s.store.compact_revision(), 0);
}

#[test]
fn first_put_lands_at_revision_two() {
    let s = stack();
    assert_eq!(put(&s, b"k", b"v1"), 2);

    let read = s.store.read_tx().unwrap();
    let got = read.range(&single(b"k"), &RangeOptions::default()).unwrap();
    assert_eq!(got.kvs.len(), 1);
    let kv = &got.kvs[0];
    assert_eq!(kv.value, b"v1");
    assert_eq!(kv.mod_revision, 2);
    assert_eq!(kv.create_revision, 2);
    assert_eq!(kv.version, 1);
}

#[test]
fn version_counts_puts_since_creation() {
    let s = stack();
    put(&s, b"k", b"v1");
    put(&s, b"k", b"v2");
    let rev = put(&s, b"k", b"v3");
    assert_eq!(rev, 4);

    let read = s.store.read_tx().unwrap();
    let kv = &read
        .range(&single(b"k"), &RangeOptions::default())
        .unwrap()
        .kvs[0];
    assert_eq!(kv.version, 3);
    assert_eq!(kv.create_revision, 2);
    assert_eq!(kv.mod_revision, 4);
}

#[test]
fn reads_at_past_revisions_see_history() {
    let s = stack();
    put(&s, b"k", b"v1"); // rev 2
    put(&s, b"k", b"v2"); // rev 3

    let read = s.store.read_tx().unwrap();
    let at2 = read
        .range(&single(b"k"), &RangeOptions { rev: 2, ..Default::default() })
        .unwrap();
    assert_eq!(at2.kvs[0].value, b"v1");
    let at3 = read
        .range(&single(b"k"), &RangeOptions { rev: 3, ..Default::default() })
        .unwrap();
    assert_eq!(at3.kvs[0].value, b"v2");
}

#[test]
fn delete_range_appends_tombstones_and_new_generation_restarts_version() {
    let s = stack();
    put(&s, b"k", b"v1"); // rev 2
    let (n, rev, events) = delete(&s, &single(b"k"));
    assert_eq!(n, 1);
    assert_eq!(rev, 3);
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].prev_kv.as_ref().map(|kv| kv.value.clone()),
        Some(b"v1".to_vec())
    );

    // Gone at head, visible in history.
    let read = s.store.read_tx().unwrap();
    assert!(read
        .range(&single(b"k"), &RangeOptions::default())
        .unwrap()
        .kvs
        .is_empty());
    assert_eq!(
        read.range(&single(b"k"), &RangeOptions { rev: 2, ..Default::default() })
            .unwrap()
            .kvs
            .len(),
        1
    );
    drop(read);

    // Re-creation starts a new generation.
    put(&s, b"k", b"v2"); // rev 4
    let read = s.store.read_tx().unwrap();
    let kv = &read
        .range(&single(b"k"), &RangeOptions::default())
        .unwrap()
        .kvs[0];
    assert_eq!(kv.create_revision, 4);
    assert_eq!(kv.version, 1);
}

#[test]
fn delete_of_missing_key_is_a_noop_without_revision() {
    let s = stack();
    let (n, rev, events) = delete(&s, &single(b"missing"));
    assert_eq!(n, 0);
    assert!(events.is_empty());
    // No sub was produced, so no revision was spent.
    assert_eq!(rev, s.store.current_revision());
    assert_eq!(s.store.current_revision(), 1);
}

#[test]
fn future_revision_read_fails() {
    let s = stack();
    put(&s, b"k", b"v");
    let read = s.store.read_tx().unwrap();
    let err = read
        .range(&single(b"k"), &RangeOptions { rev: 99, ..Default::default() })
        .unwrap_err();
    assert!(matches!(err, Error::FutureRev { revision: 99, .. }));
}

#[test]
fn range_limit_sets_more_and_count() {
    let s = stack();
    for i in 0..5u8 {
        put(&s, &[b'k', b'0' + i], b"v");
    }
    let read = s.store.read_tx().unwrap();
    let all = KeyRange::HalfOpen {
        begin: b"k".to_vec(),
        end: b"l".to_vec(),
    };
    let got = read
        .range(&all, &RangeOptions { limit: 2, ..Default::default() })
        .unwrap();
    assert_eq!(got.kvs.len(), 2);
    assert_eq!(got.count, 5);
    assert!(got.more);

    let unbounded = read.range(&all, &RangeOptions::default()).unwrap();
    assert_eq!(unbounded.kvs.len(), 5);
    assert!(!unbounded.more);

    let exact = read
        .range(&all, &RangeOptions { limit: 5, ..Default::default() })
        .unwrap();
    assert!(!exact.more);
}

#[test]
fn sort_descending_by_mod_revision() {
    let s = stack();
    put(&s, b"a", b"1"); // rev 2
    put(&s, b"c", b"2"); // rev 3
    put(&s, b"b", b"3"); // rev 4
    let read = s.store.read_tx().unwrap();
    let all = KeyRange::HalfOpen {
        begin: b"a".to_vec(),
        end: b"z".to_vec(),
    };
    let got = read
        .range(
            &all,
            &RangeOptions {
                sort_order: SortOrder::Descend,
                sort_target: SortTarget::ModRevision,
                ..Default::default()
            },
        )
        .unwrap();
    let keys: Vec<&[u8]> = got.kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, vec![b"b".as_slice(), b"c", b"a"]);
}

#[test]
fn sort_on_empty_result_is_fine() {
    let s = stack();
    let read = s.store.read_tx().unwrap();
    let got = read
        .range(
            &single(b"nothing"),
            &RangeOptions {
                sort_order: SortOrder::Descend,
                sort_target: SortTarget::Value,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(got.kvs.is_empty());
    assert_eq!(got.count, 0);
}

#[test]
fn count_only_skips_values() {
    let s = stack();
    put(&s, b"a", b"1");
    put(&s, b"b", b"2");
    let read = s.store.read_tx().unwrap();
    let got = read
        .range(
            &KeyRange::FromKey(b"a".to_vec()),
            &RangeOptions {
                count_only: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(got.count, 2);
    assert!(got.kvs.is_empty());
}

#[test]
fn empty_value_is_distinct_from_absence() {
    let s = stack();
    put(&s, b"k", b"");
    let read = s.store.read_tx().unwrap();
    let got = read.range(&single(b"k"), &RangeOptions::default()).unwrap();
    assert_eq!(got.kvs.len(), 1);
    assert!(got.kvs[0].value.is_empty());
}

#[test]
fn compaction_blocks_reads_below_floor_and_keeps_floor_readable() {
    let s = stack();
    // Writes at revisions 2..=100.
    for i in 0..99u32 {
        put(&s, b"k", format!("v{i}").as_bytes());
    }
    assert_eq!(s.store.current_revision(), 100);

    let removed = compact(&s, 50).unwrap();
    s.store.purge_compacted(&removed).unwrap();

    let read = s.store.read_tx().unwrap();
    let err = read
        .range(&single(b"k"), &RangeOptions { rev: 49, ..Default::default() })
        .unwrap_err();
    assert!(matches!(err, Error::Compacted { revision: 49, floor: 50 }));

    // The floor itself stays consistent with the pre-compaction store.
    let at50 = read
        .range(&single(b"k"), &RangeOptions { rev: 50, ..Default::default() })
        .unwrap();
    assert_eq!(at50.kvs[0].mod_revision, 50);
    let head = read.range(&single(b"k"), &RangeOptions::default()).unwrap();
    assert_eq!(head.kvs[0].mod_revision, 100);
}

#[test]
fn compaction_at_same_revision_is_a_noop_and_below_floor_fails() {
    let s = stack();
    for _ in 0..10 {
        put(&s, b"k", b"v");
    }
    let removed = compact(&s, 5).unwrap();
    assert!(!removed.is_empty());
    assert!(compact(&s, 5).unwrap().is_empty());
    assert!(matches!(
        compact(&s, 4),
        Err(Error::Compacted { revision: 4, floor: 5 })
    ));
    assert!(matches!(compact(&s, 999), Err(Error::FutureRev { .. })));
}

#[test]
fn compaction_drops_fully_dead_keys() {
    let s = stack();
    put(&s, b"gone", b"v"); // rev 2
    delete(&s, &single(b"gone")); // rev 3
    put(&s, b"live", b"v"); // rev 4

    let removed = compact(&s, 4).unwrap();
    s.store.purge_compacted(&removed).unwrap();

    let read = s.store.read_tx().unwrap();
    assert!(read
        .range(&single(b"gone"), &RangeOptions::default())
        .unwrap()
        .kvs
        .is_empty());
    assert_eq!(
        read.range(&single(b"live"), &RangeOptions::default())
            .unwrap()
            .kvs
            .len(),
        1
    );
}

#[test]
fn hash_is_identical_across_stores_applying_the_same_history() {
    let a = stack();
    let b = stack();
    for s in [&a, &b] {
        put(s, b"x", b"1");
        put(s, b"y", b"2");
        delete(s, &single(b"x"));
    }
    assert_eq!(a.store.hash_kv(0).unwrap(), b.store.hash_kv(0).unwrap());

    // Divergence shows up.
    put(&a, b"z", b"3");
    put(&b, b"z", b"different");
    assert_ne!(a.store.hash_kv(0).unwrap(), b.store.hash_kv(0).unwrap());
}

#[test]
fn hash_validates_revision_bounds() {
    let s = stack();
    for _ in 0..10 {
        put(&s, b"k", b"v");
    }
    compact(&s, 6).unwrap();
    assert!(matches!(s.store.hash_kv(3), Err(Error::Compacted { .. })));
    assert!(matches!(s.store.hash_kv(99), Err(Error::FutureRev { .. })));
    assert!(s.store.hash_kv(8).is_ok());
}

#[test]
fn events_since_returns_revision_ordered_events() {
    let s = stack();
    put(&s, b"a", b"1"); // rev 2
    put(&s, b"b", b"2"); // rev 3
    delete(&s, &single(b"a")); // rev 4
    s.backend.force_commit().unwrap();

    let (events, next) = s.store.events_since(2, 100).unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].revision(), 2);
    assert_eq!(events[1].revision(), 3);
    assert_eq!(events[2].revision(), 4);
    assert_eq!(next, 5);

    let (tail, next) = s.store.events_since(4, 100).unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(next, 5);
}

#[test]
fn snapshot_image_restores_an_identical_store() {
    let a = stack();
    put(&a, b"k1", b"v1");
    put(&a, b"k2", b"v2");
    put(&a, b"k1", b"v1b");
    let image = a.backend.snapshot_image().unwrap();

    let b = stack();
    b.backend.restore_image(&image).unwrap();
    b.store.reload().unwrap();
    assert_eq!(b.store.current_revision(), a.store.current_revision());

    let read = b.store.read_tx().unwrap();
    let kv = &read
        .range(&single(b"k1"), &RangeOptions::default())
        .unwrap()
        .kvs[0];
    assert_eq!(kv.value, b"v1b");
    assert_eq!(kv.version, 2);
    assert_eq!(a.store.hash_kv(0).unwrap(), b.store.hash_kv(0).unwrap());
}

#[test]
fn lease_attachment_follows_puts_and_deletes() {
    let s = stack();
    {
        let mut tx = s.backend.batch_tx().lock().unwrap();
        s.lessor.grant(77, 10, &mut tx).unwrap();
        tx.unlock().unwrap();
    }
    let (result, _, _) = with_txn(&s, |txn| txn.put(b"ek", b"v", 77));
    result.unwrap();
    assert_eq!(s.lessor.keys(77).unwrap(), vec![b"ek".to_vec()]);

    // Re-put without a lease detaches.
    let (result, _, _) = with_txn(&s, |txn| txn.put(b"ek", b"v2", 0));
    result.unwrap();
    assert!(s.lessor.keys(77).unwrap().is_empty());

    // Attach again and delete: detached again.
    let (result, _, _) = with_txn(&s, |txn| txn.put(b"ek", b"v3", 77));
    result.unwrap();
    delete(&s, &single(b"ek"));
    assert!(s.lessor.keys(77).unwrap().is_empty());

    // Unknown lease fails the put.
    let (result, _, _) = with_txn(&s, |txn| txn.put(b"k", b"v", 12345));
    assert!(matches!(
        result,
        Err(Error::LeaseNotFound { lease_id: 12345 })
    ));
}
