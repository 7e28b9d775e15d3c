//! End-to-end cluster tests over the in-memory mesh.

mod common;

use common::{get, get_at, put, put_with_lease, Cluster};
use strata::error::Alarm;
use strata::server::Node;
use std::time::Duration;
use strata::error::Error;
use strata::server::command::{
    CommandOp, CommandResponse, Compare, CompareResult, CompareTarget, PutRequest, RangeRequest,
    RequestOp, RoleAddRequest, TxnRequest, UserAddRequest,
};
use strata::watch::WatchFilters;

#[tokio::test(flavor = "multi_thread")]
async fn put_then_read_from_another_member() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;

    // The election no-op holds revision 1; the first put gets 2.
    let rev = put(&leader, b"k", b"v1").await;
    assert_eq!(rev, 2);

    // A linearizable read on a different member sees it.
    let reader = cluster.node(if leader.id() == 2 { 3 } else { 2 });
    let resp = reader
        .range(RangeRequest {
            key: b"k".to_vec(),
            serializable: false,
            ..Default::default()
        })
        .await
        .expect("linearizable range");
    assert_eq!(resp.kvs.len(), 1);
    let kv = &resp.kvs[0];
    assert_eq!(kv.value, b"v1");
    assert_eq!(kv.mod_revision, 2);
    assert_eq!(kv.create_revision, 2);
    assert_eq!(kv.version, 1);
    assert_eq!(resp.header.cluster_id, leader.cluster_id());

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn proposals_on_a_follower_point_at_the_leader() {
    let mut cluster = Cluster::start(3).await;
    let leader_id = cluster.wait_for_leader().await;
    let follower = cluster.node(if leader_id == 2 { 3 } else { 2 });

    let err = follower
        .put(PutRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotLeader { hint } if hint == leader_id));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn txn_compare_and_swap() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;
    put(&leader, b"x", b"old").await; // rev 2

    let resp = leader
        .txn(TxnRequest {
            compare: vec![Compare {
                key: b"x".to_vec(),
                target: CompareTarget::Value(b"old".to_vec()),
                result: CompareResult::Equal,
            }],
            success: vec![RequestOp::Put(PutRequest {
                key: b"x".to_vec(),
                value: b"new".to_vec(),
                ..Default::default()
            })],
            failure: vec![RequestOp::Range(RangeRequest {
                key: b"x".to_vec(),
                ..Default::default()
            })],
        })
        .await
        .expect("txn");
    let txn = match resp {
        CommandResponse::Txn(t) => t,
        other => panic!("unexpected: {other:?}"),
    };
    assert!(txn.succeeded);
    assert_eq!(txn.header.revision, 3);
    assert_eq!(get(&leader, b"x").await, Some(b"new".to_vec()));

    // A second identical CAS now takes the failure branch and spends
    // no revision.
    let resp = leader
        .txn(TxnRequest {
            compare: vec![Compare {
                key: b"x".to_vec(),
                target: CompareTarget::Value(b"old".to_vec()),
                result: CompareResult::Equal,
            }],
            success: vec![],
            failure: vec![RequestOp::Range(RangeRequest {
                key: b"x".to_vec(),
                ..Default::default()
            })],
        })
        .await
        .expect("txn");
    match resp {
        CommandResponse::Txn(t) => {
            assert!(!t.succeeded);
            assert_eq!(t.header.revision, 3);
        }
        other => panic!("unexpected: {other:?}"),
    }

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn compare_on_missing_key_semantics() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;

    // Value compare on a missing key always fails.
    let resp = leader
        .txn(TxnRequest {
            compare: vec![Compare {
                key: b"ghost".to_vec(),
                target: CompareTarget::Value(Vec::new()),
                result: CompareResult::Equal,
            }],
            success: vec![],
            failure: vec![],
        })
        .await
        .unwrap();
    assert!(matches!(resp, CommandResponse::Txn(t) if !t.succeeded));

    // Revision compares treat a missing key as 0.
    let resp = leader
        .txn(TxnRequest {
            compare: vec![Compare {
                key: b"ghost".to_vec(),
                target: CompareTarget::CreateRevision(0),
                result: CompareResult::Equal,
            }],
            success: vec![],
            failure: vec![],
        })
        .await
        .unwrap();
    assert!(matches!(resp, CommandResponse::Txn(t) if t.succeeded));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lease_expiry_deletes_attached_keys() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;

    let resp = leader.lease_grant(0, 1).await.expect("grant");
    let lease_id = match resp {
        CommandResponse::LeaseGrant(g) => {
            assert!(g.ttl >= 1);
            g.id
        }
        other => panic!("unexpected: {other:?}"),
    };
    put_with_lease(&leader, b"ek", b"v", lease_id).await;
    assert_eq!(get(&leader, b"ek").await, Some(b"v".to_vec()));

    // No renewals: the key disappears within about one TTL plus a tick.
    let mut gone = false;
    for _ in 0..200 {
        if get(&leader, b"ek").await.is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "lease expiry did not delete the key");

    // The lease itself is gone too.
    assert!(matches!(
        leader.lease_time_to_live(lease_id),
        Err(Error::LeaseNotFound { .. })
    ));

    cluster.stop_all().await;
}

/// Wait until `node` has applied at least `revision`.
async fn wait_revision(node: &Node, revision: i64, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(status) = node.status().await {
            if status.revision >= revision {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn lease_keep_alive_holds_the_key() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;

    let resp = leader.lease_grant(0, 1).await.expect("grant");
    let lease_id = match resp {
        CommandResponse::LeaseGrant(g) => g.id,
        other => panic!("unexpected: {other:?}"),
    };
    put_with_lease(&leader, b"held", b"v", lease_id).await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(400)).await;
        let ttl = leader.lease_keep_alive(lease_id).expect("keep alive");
        assert!(ttl >= 1);
    }
    assert_eq!(get(&leader, b"held").await, Some(b"v".to_vec()));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn compaction_blocks_reads_below_the_floor() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;

    // Writes at revisions 2..=100.
    for i in 0..99u32 {
        put(&leader, b"k", format!("v{i}").as_bytes()).await;
    }
    leader.compact(50, false).await.expect("compact");

    let err = get_at(&leader, b"k", 49).await.unwrap_err();
    assert!(matches!(err, Error::Compacted { revision: 49, floor: 50 }));
    assert!(get_at(&leader, b"k", 50).await.unwrap().is_some());
    assert_eq!(
        get(&leader, b"k").await,
        Some(b"v98".to_vec())
    );

    // Compacting below the floor is refused.
    assert!(matches!(
        leader.compact(10, false).await,
        Err(Error::Compacted { .. })
    ));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_streams_events_from_past_and_live() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;

    put(&leader, b"a", b"1").await; // rev 2
    put(&leader, b"a", b"2").await; // rev 3
    put(&leader, b"b", b"3").await; // rev 4

    let (_, mut rx) = leader
        .watch(b"a".to_vec(), b"b".to_vec(), 2, WatchFilters::empty(), false)
        .expect("watch");
    let created = rx.recv().await.expect("created");
    assert!(created.created);

    // Catch-up replays the two "a" events and nothing for "b".
    let mut got = Vec::new();
    while got.len() < 2 {
        let resp = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watch response")
            .expect("stream open");
        got.extend(resp.events);
    }
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].kv.mod_revision, 2);
    assert_eq!(got[0].kv.value, b"1");
    assert_eq!(got[1].kv.mod_revision, 3);

    // Live events follow.
    put(&leader, b"a", b"4").await; // rev 5
    let live = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("live event")
        .expect("stream open");
    assert_eq!(live.events[0].kv.mod_revision, 5);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_kill_keeps_acknowledged_writes() {
    let mut cluster = Cluster::start(3).await;
    assert_eq!(cluster.wait_for_leader().await, 1);
    let leader = cluster.node(1);
    put(&leader, b"survives", b"yes").await;

    cluster.kill(1).await;
    cluster.node(2).campaign().await.expect("campaign");
    let new_leader = cluster.leader().await;
    assert_ne!(new_leader.id(), 1);

    assert_eq!(get(&new_leader, b"survives").await, Some(b"yes".to_vec()));
    // The dethroned member can come back and converge.
    cluster.restart(1).await;
    let target = new_leader.status().await.unwrap().revision;
    let caught_up = wait_revision(&cluster.node(1), target, Duration::from_secs(10)).await;
    assert!(caught_up, "restarted member never caught up");
    assert_eq!(
        cluster.node(1).hash_kv(target).unwrap(),
        new_leader.hash_kv(target).unwrap()
    );

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_member_catches_up_by_snapshot() {
    let mut cluster = Cluster::start_with(3, |cfg| {
        cfg.raft.snapshot_count = 8;
        cfg.raft.snapshot_catchup_entries = 2;
    })
    .await;
    assert_eq!(cluster.wait_for_leader().await, 1);
    let leader = cluster.node(1);
    put(&leader, b"before", b"x").await;

    cluster.kill(3).await;
    for i in 0..40u32 {
        put(&leader, format!("k{i}").as_bytes(), b"v").await;
    }
    let target = leader.status().await.unwrap().revision;

    cluster.restart(3).await;
    let caught_up = wait_revision(&cluster.node(3), target, Duration::from_secs(10)).await;
    assert!(caught_up, "snapshot catch-up did not complete");
    assert_eq!(
        cluster.node(3).hash_kv(target).unwrap(),
        leader.hash_kv(target).unwrap()
    );
    assert_eq!(get(&cluster.node(3), b"before").await, Some(b"x".to_vec()));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn applied_prefixes_hash_identically_on_every_member() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;
    for i in 0..10u32 {
        put(&leader, format!("key{i}").as_bytes(), format!("val{i}").as_bytes()).await;
    }
    let rev = leader.status().await.unwrap().revision;
    cluster.wait_for_revision(rev).await;

    let h1 = cluster.node(1).hash_kv(rev).unwrap();
    let h2 = cluster.node(2).hash_kv(rev).unwrap();
    let h3 = cluster.node(3).hash_kv(rev).unwrap();
    assert_eq!(h1, h2);
    assert_eq!(h2, h3);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_changes_round_trip() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;

    let resp = leader.member_add(4, "mesh-4").await.expect("member add");
    assert_eq!(resp.members.len(), 4);
    assert!(resp.members.iter().any(|m| m.id == 4));

    // Duplicate adds are refused before entering the log.
    assert!(matches!(
        leader.member_add(4, "mesh-4").await,
        Err(Error::Membership { .. })
    ));

    let resp = leader.member_remove(4).await.expect("member remove");
    assert_eq!(resp.members.len(), 3);
    assert_eq!(leader.member_list().members.len(), 3);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_users_roles_and_tokens() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;

    // Enabling without a root user fails.
    assert!(matches!(
        leader.auth_enable().await,
        Err(Error::AuthFailed { .. })
    ));

    leader
        .auth_admin(CommandOp::UserAdd(UserAddRequest {
            name: "root".to_string(),
            password: "secret".to_string(),
        }))
        .await
        .expect("user add");
    leader
        .auth_admin(CommandOp::RoleAdd(RoleAddRequest {
            name: "reader".to_string(),
        }))
        .await
        .expect("role add");
    leader.auth_enable().await.expect("auth enable");
    assert!(leader.auth_store().is_enabled());

    let resp = leader.authenticate("root", "secret").await.expect("authenticate");
    let token = match resp {
        CommandResponse::Authenticate(a) => a.token,
        other => panic!("unexpected: {other:?}"),
    };
    assert_eq!(
        leader.auth_store().user_of_token(&token).as_deref(),
        Some("root")
    );

    // Wrong password fails.
    assert!(matches!(
        leader.authenticate("root", "wrong").await,
        Err(Error::AuthFailed { .. })
    ));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_and_empty_requests_are_rejected() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;

    let err = leader
        .put(PutRequest {
            key: b"big".to_vec(),
            value: vec![0; 2 * 1024 * 1024],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestTooLarge { .. }));

    let err = leader
        .put(PutRequest {
            key: Vec::new(),
            value: b"v".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_replays_the_wal() {
    let mut cluster = Cluster::start(1).await;
    {
        let leader = cluster.leader().await;
        put(&leader, b"persisted", b"v1").await;
        put(&leader, b"persisted", b"v2").await;
    }
    cluster.kill(1).await;
    cluster.restart(1).await;
    let node = cluster.node(1);
    node.campaign().await.expect("campaign");
    cluster.wait_for_leader().await;

    let resp = node
        .range(RangeRequest {
            key: b"persisted".to_vec(),
            serializable: true,
            ..Default::default()
        })
        .await
        .expect("range after restart");
    assert_eq!(resp.kvs.len(), 1);
    assert_eq!(resp.kvs[0].value, b"v2");
    assert_eq!(resp.kvs[0].version, 2);

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_alarm_rejects_writes_but_serves_reads() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;
    let rev = put(&leader, b"k", b"v").await;

    // A matching peer hash changes nothing.
    let good = leader.hash_kv(rev).unwrap();
    leader.verify_hash(rev, good).expect("hashes agree");
    assert!(leader.active_alarm().is_none());

    // A mismatching one raises CORRUPT and the node degrades.
    let err = leader.verify_hash(rev, good ^ 0xdead_beef).unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }));
    assert_eq!(leader.active_alarm(), Some(Alarm::Corrupt));
    assert_eq!(leader.status().await.unwrap().alarm, Some(Alarm::Corrupt));

    let err = leader
        .put(PutRequest {
            key: b"rejected".to_vec(),
            value: b"x".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Corrupt { .. }));

    // Reads keep working on the degraded node.
    assert_eq!(get(&leader, b"k").await, Some(b"v".to_vec()));
    assert!(get(&leader, b"rejected").await.is_none());

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn nospace_alarm_degrades_until_cleared() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;
    put(&leader, b"k", b"v").await;

    leader.raise_alarm(Alarm::NoSpace);
    let err = leader
        .put(PutRequest {
            key: b"rejected".to_vec(),
            value: b"x".to_vec(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));
    assert_eq!(get(&leader, b"k").await, Some(b"v".to_vec()));

    // Disarming resumes writes.
    leader.clear_alarm();
    assert!(leader.active_alarm().is_none());
    put(&leader, b"after", b"clear").await;
    assert_eq!(get(&leader, b"after").await, Some(b"clear".to_vec()));

    cluster.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn from_key_range_is_canonicalized_at_the_edge() {
    let mut cluster = Cluster::start(1).await;
    let leader = cluster.leader().await;
    put(&leader, b"a", b"1").await;
    put(&leader, b"b", b"2").await;
    put(&leader, b"c", b"3").await;

    // range_end = [0] means "every key at or after `key`".
    let resp = leader
        .range(RangeRequest {
            key: b"b".to_vec(),
            range_end: vec![0],
            serializable: true,
            ..Default::default()
        })
        .await
        .expect("from-key range");
    let keys: Vec<&[u8]> = resp.kvs.iter().map(|kv| kv.key.as_slice()).collect();
    assert_eq!(keys, vec![b"b".as_slice(), b"c"]);

    cluster.stop_all().await;
}
