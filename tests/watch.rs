//! Tests for the watcher hub: dispatch ordering, catch-up, demotion,
//! and compaction-triggered cancellation.

use std::sync::Arc;
use std::time::Duration;
use strata::lease::Lessor;
use strata::mvcc::store::KvStore;
use strata::mvcc::{EventKind, KeyRange};
use strata::storage::backend::Backend;
use strata::watch::{WatchCreateRequest, WatchFilters, WatchResponse, WatcherHub};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Stack {
    store: Arc<KvStore>,
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
        backend,
        _dir: dir,
    }
}

/// Put through the store and dispatch to the hub, as the apply path does.
fn put(s: &Stack, hub: &WatcherHub, key: &[u8], value: &[u8]) -> i64 {
    let tx = s.backend.batch_tx();
    let mut batch = tx.lock().unwrap();
    let mut txn = s.store.write_tx(&mut batch).unwrap();
    txn.put(key, value, 0).unwrap();
    let (rev, events) = txn.end();
    batch.unlock().unwrap();
    hub.notify(rev, &events);
    rev
}

fn delete(s: &Stack, hub: &WatcherHub, key: &[u8]) -> i64 {
    let tx = s.backend.batch_tx();
    let mut batch = tx.lock().unwrap();
    let mut txn = s.store.write_tx(&mut batch).unwrap();
    txn.delete_range(&KeyRange::Single(key.to_vec())).unwrap();
    let (rev, events) = txn.end();
    batch.unlock().unwrap();
    hub.notify(rev, &events);
    rev
}

fn compact(s: &Stack, rev: i64) {
    let tx = s.backend.batch_tx();
    let mut batch = tx.lock().unwrap();
    s.store.compact(rev, &mut batch).unwrap();
    batch.unlock().unwrap();
}

fn watch_req(range: KeyRange, start: i64) -> WatchCreateRequest {
    WatchCreateRequest {
        range,
        start_revision: start,
        filters: WatchFilters::empty(),
        progress_notify: false,
    }
}

async fn recv(rx: &mut mpsc::Receiver<WatchResponse>) -> WatchResponse {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for watch response")
        .expect("watch channel closed")
}

#[tokio::test]
async fn synced_watcher_receives_commits_in_order() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let (id, mut rx) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 0))
        .unwrap();

    let created = recv(&mut rx).await;
    assert!(created.created);
    assert_eq!(created.watch_id, id);

    let r1 = put(&s, &hub, b"k", b"v1");
    let r2 = put(&s, &hub, b"k", b"v2");

    let first = recv(&mut rx).await;
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].kind, EventKind::Put);
    assert_eq!(first.events[0].kv.mod_revision, r1);
    let second = recv(&mut rx).await;
    assert_eq!(second.events[0].kv.mod_revision, r2);
    assert_eq!(second.header_revision, r2);
}

#[tokio::test]
async fn watcher_only_sees_its_range() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let (_, mut rx) = hub
        .watch(watch_req(KeyRange::prefix(b"a".to_vec()), 0))
        .unwrap();
    recv(&mut rx).await; // created

    put(&s, &hub, b"b-unrelated", b"x");
    let r = put(&s, &hub, b"a1", b"y");

    let resp = recv(&mut rx).await;
    assert_eq!(resp.events.len(), 1);
    assert_eq!(resp.events[0].kv.key, b"a1");
    assert_eq!(resp.events[0].kv.mod_revision, r);
}

#[tokio::test]
async fn watch_from_past_replays_history_then_goes_live() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let r1 = put(&s, &hub, b"a", b"1"); // rev 2
    let r2 = put(&s, &hub, b"a", b"2"); // rev 3
    put(&s, &hub, b"b", b"3"); // rev 4

    // History from revision 2 onward stays available after compacting
    // at 2.
    compact(&s, 2);

    let (_, mut rx) = hub
        .watch(watch_req(KeyRange::prefix(b"a".to_vec()), 2))
        .unwrap();
    recv(&mut rx).await; // created

    hub.catchup(100);
    let replay = recv(&mut rx).await;
    assert_eq!(replay.events.len(), 2);
    assert_eq!(replay.events[0].kv.mod_revision, r1);
    assert_eq!(replay.events[0].kv.value, b"1");
    assert_eq!(replay.events[1].kv.mod_revision, r2);
    // No event for "b".

    // Caught up: the next commit arrives on the direct path.
    let (synced, unsynced) = hub.watcher_counts();
    assert_eq!((synced, unsynced), (1, 0));
    let r4 = put(&s, &hub, b"a", b"4");
    let live = recv(&mut rx).await;
    assert_eq!(live.events[0].kv.mod_revision, r4);
}

#[tokio::test]
async fn start_revision_below_floor_cancels_with_compacted() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    for _ in 0..5 {
        put(&s, &hub, b"k", b"v");
    }
    compact(&s, 4);

    let (_, mut rx) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 2))
        .unwrap();
    recv(&mut rx).await; // created
    let cancel = recv(&mut rx).await;
    assert!(cancel.canceled);
    assert_eq!(cancel.compact_revision, 4);
}

#[tokio::test]
async fn two_watchers_see_identical_sequences() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let (_, mut rx1) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 0))
        .unwrap();
    let (_, mut rx2) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 0))
        .unwrap();
    recv(&mut rx1).await;
    recv(&mut rx2).await;

    put(&s, &hub, b"k", b"1");
    delete(&s, &hub, b"k");
    put(&s, &hub, b"k", b"2");

    let mut seq1 = Vec::new();
    let mut seq2 = Vec::new();
    for _ in 0..3 {
        let a = recv(&mut rx1).await;
        let b = recv(&mut rx2).await;
        seq1.extend(a.events.into_iter().map(|e| (e.kind, e.kv.mod_revision)));
        seq2.extend(b.events.into_iter().map(|e| (e.kind, e.kv.mod_revision)));
    }
    assert_eq!(seq1, seq2);
    assert_eq!(seq1.len(), 3);
    assert_eq!(seq1[1].0, EventKind::Delete);
    // Revision order within one watcher.
    assert!(seq1.windows(2).all(|w| w[0].1 < w[1].1));
}

#[tokio::test]
async fn overflowing_watcher_demotes_and_catches_up_without_loss() {
    let s = stack();
    // Channel capacity 1: the created response fills it at once.
    let hub = WatcherHub::new(Arc::clone(&s.store), 1, 10);
    let (_, mut rx) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 0))
        .unwrap();

    let r1 = put(&s, &hub, b"k", b"v1");
    // The channel was full: the watcher is now unsynced.
    let (synced, unsynced) = hub.watcher_counts();
    assert_eq!((synced, unsynced), (0, 1));

    // Drain the created response, then let catch-up redeliver.
    let created = recv(&mut rx).await;
    assert!(created.created);
    hub.catchup(100);
    let replay = recv(&mut rx).await;
    assert_eq!(replay.events.len(), 1);
    assert_eq!(replay.events[0].kv.mod_revision, r1);
    let (synced, unsynced) = hub.watcher_counts();
    assert_eq!((synced, unsynced), (1, 0));
}

#[tokio::test]
async fn stalled_watcher_is_cancelled_after_budget() {
    let s = stack();
    // Capacity 1 and a stall budget of 2 catch-up rounds.
    let hub = WatcherHub::new(Arc::clone(&s.store), 1, 2);
    let (_, rx) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 0))
        .unwrap();
    // Never drained: the consumer is stuck.
    put(&s, &hub, b"k", b"v1");
    for _ in 0..4 {
        hub.catchup(100);
    }
    let (synced, unsynced) = hub.watcher_counts();
    assert_eq!((synced, unsynced), (0, 0));
    drop(rx);
}

#[tokio::test]
async fn filters_drop_unwanted_event_kinds() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let (_, mut rx) = hub
        .watch(WatchCreateRequest {
            range: KeyRange::Single(b"k".to_vec()),
            start_revision: 0,
            filters: WatchFilters::NOPUT,
            progress_notify: false,
        })
        .unwrap();
    recv(&mut rx).await;

    put(&s, &hub, b"k", b"v");
    let r = delete(&s, &hub, b"k");

    let resp = recv(&mut rx).await;
    assert_eq!(resp.events.len(), 1);
    assert_eq!(resp.events[0].kind, EventKind::Delete);
    assert_eq!(resp.events[0].kv.mod_revision, r);
}

#[tokio::test]
async fn progress_notify_sends_empty_heartbeats() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let (_, mut rx) = hub
        .watch(WatchCreateRequest {
            range: KeyRange::Single(b"quiet".to_vec()),
            start_revision: 0,
            filters: WatchFilters::empty(),
            progress_notify: true,
        })
        .unwrap();
    recv(&mut rx).await;

    put(&s, &hub, b"other", b"v"); // rev 2, not watched
    hub.progress();
    let beat = recv(&mut rx).await;
    assert!(beat.events.is_empty());
    assert!(!beat.canceled);
    assert_eq!(beat.header_revision, 2);
}

#[tokio::test]
async fn explicit_cancel_sends_a_final_response() {
    let s = stack();
    let hub = WatcherHub::new(Arc::clone(&s.store), 64, 10);
    let (id, mut rx) = hub
        .watch(watch_req(KeyRange::Single(b"k".to_vec()), 0))
        .unwrap();
    recv(&mut rx).await;

    assert!(hub.cancel(id));
    let last = recv(&mut rx).await;
    assert!(last.canceled);
    // Gone: cancelling again reports absence, commits stop arriving.
    assert!(!hub.cancel(id));
    put(&s, &hub, b"k", b"v");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .map(|m| m.is_none())
            .unwrap_or(true),
        "no further events after cancel"
    );
}
