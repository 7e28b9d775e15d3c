//! Tests for the consensus core: elections, replication, membership,
//! snapshots, and read fences. The harness pumps messages between cores
//! deterministically; no clocks, no I/O.

use std::collections::{BTreeMap, HashSet};
use strata::error::Error;
use strata::raft::core::{Raft, RaftOptions};
use strata::raft::log::RaftLog;
use strata::raft::types::{
    ConfChange, ConfChangeKind, ConfState, Role, Snapshot, SnapshotMeta, NONE,
};

struct Net {
    peers: BTreeMap<u64, Raft>,
    /// Directed links currently dropping messages.
    cut: HashSet<(u64, u64)>,
}

impl Net {
    fn new(n: u64, pre_vote: bool) -> Net {
        let ids: Vec<u64> = (1..=n).collect();
        let peers = ids
            .iter()
            .map(|&id| {
                let raft = Raft::new(
                    id,
                    ids.clone(),
                    RaftOptions {
                        election_ticks: 10,
                        heartbeat_ticks: 1,
                        pre_vote,
                        check_quorum: true,
                    },
                    RaftLog::new(0, 0),
                    None,
                );
                (id, raft)
            })
            .collect();
        Net {
            peers,
            cut: HashSet::new(),
        }
    }

    fn get(&mut self, id: u64) -> &mut Raft {
        self.peers.get_mut(&id).expect("peer")
    }

    fn isolate(&mut self, id: u64) {
        let ids: Vec<u64> = self.peers.keys().copied().collect();
        for other in ids {
            if other != id {
                self.cut.insert((id, other));
                self.cut.insert((other, id));
            }
        }
    }

    fn heal(&mut self) {
        self.cut.clear();
    }

    /// Deliver messages until the network is quiet, simulating an
    /// attentive host: entries count as persisted as soon as they exist.
    fn drain(&mut self) {
        for _ in 0..100 {
            let mut inflight = Vec::new();
            for raft in self.peers.values_mut() {
                let last = raft.log.last_index();
                raft.log.persisted_to(last);
                inflight.extend(raft.take_msgs());
            }
            if inflight.is_empty() {
                return;
            }
            for msg in inflight {
                if self.cut.contains(&(msg.from, msg.to)) {
                    continue;
                }
                if let Some(peer) = self.peers.get_mut(&msg.to) {
                    let _ = peer.step(msg);
                }
            }
        }
        panic!("network did not quiesce");
    }

    /// Apply whatever is committed on every peer, folding conf changes.
    fn apply_all(&mut self) {
        for raft in self.peers.values_mut() {
            let entries = raft.log.next_committed_entries();
            for entry in entries {
                if entry.kind == strata::raft::types::EntryKind::ConfChange {
                    let cc: ConfChange = bincode::deserialize(&entry.data).unwrap();
                    raft.apply_conf_change(&cc);
                }
                raft.log.applied_to(entry.index);
            }
        }
    }

    fn leader_id(&self) -> Option<u64> {
        self.peers
            .values()
            .find(|r| r.role == Role::Leader)
            .map(|r| r.id)
    }

    /// Tick every peer and pump messages until a leader emerges whose
    /// term every peer shares.
    fn run_until_leader(&mut self) -> u64 {
        for _ in 0..500 {
            if let Some(leader) = self.leader_id() {
                let term = self.peers[&leader].term;
                if self.peers.values().all(|r| r.term == term) {
                    return leader;
                }
            }
            for raft in self.peers.values_mut() {
                raft.tick();
            }
            self.drain();
        }
        panic!("no stable leader");
    }
}

#[test]
fn campaign_wins_an_election() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();

    assert_eq!(net.leader_id(), Some(1));
    for id in [2, 3] {
        let peer = net.get(id);
        assert_eq!(peer.role, Role::Follower);
        assert_eq!(peer.leader_id, 1);
        assert_eq!(peer.term, 1);
    }
}

#[test]
fn pre_vote_round_elects_without_term_inflation() {
    let mut net = Net::new(3, true);
    net.get(1).campaign(true);
    net.drain();
    assert_eq!(net.leader_id(), Some(1));
    // One real election: term went from 0 to exactly 1.
    assert_eq!(net.get(1).term, 1);
}

#[test]
fn single_voter_becomes_leader_immediately() {
    let mut net = Net::new(1, true);
    net.get(1).campaign(true);
    assert_eq!(net.get(1).role, Role::Leader);
    // And commits its own proposals without any network.
    let index = net.get(1).propose(b"solo".to_vec()).unwrap();
    assert!(net.get(1).log.committed >= index);
}

#[test]
fn proposals_replicate_and_commit_on_quorum() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();

    let index = net.get(1).propose(b"hello".to_vec()).unwrap();
    net.drain();

    for id in [1, 2, 3] {
        let peer = net.get(id);
        assert!(peer.log.committed >= index, "peer {id} not committed");
        assert_eq!(peer.log.term(index), Some(1));
    }
    net.apply_all();
    let committed = net.get(1).log.committed;
    assert_eq!(net.get(2).log.applied, committed);
}

#[test]
fn follower_rejects_proposals_with_a_leader_hint() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();

    let err = net.get(2).propose(b"nope".to_vec()).unwrap_err();
    assert!(matches!(err, Error::NotLeader { hint: 1 }));
}

#[test]
fn proposals_without_a_leader_fail_fast() {
    let mut net = Net::new(3, false);
    let err = net.get(1).propose(b"nope".to_vec()).unwrap_err();
    assert!(matches!(err, Error::NoLeader));
}

#[test]
fn lagging_follower_catches_up_after_heal() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();

    net.isolate(3);
    for i in 0..5 {
        net.get(1).propose(format!("e{i}").into_bytes()).unwrap();
        net.drain();
    }
    let leader_last = net.get(1).log.last_index();
    assert!(net.get(3).log.last_index() < leader_last);

    net.heal();
    // The next heartbeat exchange triggers the append probe.
    net.get(1).tick();
    net.drain();
    assert_eq!(net.get(3).log.last_index(), leader_last);
    let committed = net.get(1).log.committed;
    assert_eq!(net.get(3).log.committed, committed);
}

#[test]
fn divergent_follower_suffix_is_overwritten() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();
    net.get(1).propose(b"base".to_vec()).unwrap();
    net.drain();

    // Node 3 goes its own way for a term, uncommitted.
    net.isolate(3);
    net.get(3).campaign(false);
    // Votes go nowhere; its term rose but no entries arrive.
    net.get(1).propose(b"winner".to_vec()).unwrap();
    net.drain();

    net.heal();
    // Reconnect: node 3's higher term dethrones the old leader, then a
    // re-election settles on a peer holding the longer log. Node 3's
    // short log cannot win.
    let leader = net.run_until_leader();
    assert_ne!(leader, 3);
    net.drain();
    let last = net.get(leader).log.last_index();
    for id in [1, 2, 3] {
        assert_eq!(net.get(id).log.last_index(), last, "peer {id} diverged");
        assert_eq!(net.get(id).leader_id, leader);
    }
}

#[test]
fn conf_changes_are_one_at_a_time() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();
    net.apply_all();

    let cc = ConfChange {
        kind: ConfChangeKind::AddNode,
        node_id: 4,
        context: Vec::new(),
    };
    let data = bincode::serialize(&cc).unwrap();
    net.get(1).propose_conf_change(data.clone()).unwrap();

    // A second one before the first applies is refused.
    let err = net.get(1).propose_conf_change(data).unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));

    net.drain();
    net.apply_all();
    assert!(net.get(1).conf_state().contains(4));

    // Applied now; the next change is admissible.
    let remove = ConfChange {
        kind: ConfChangeKind::RemoveNode,
        node_id: 4,
        context: Vec::new(),
    };
    net.get(1)
        .propose_conf_change(bincode::serialize(&remove).unwrap())
        .unwrap();
    net.drain();
    net.apply_all();
    assert!(!net.get(1).conf_state().contains(4));
}

#[test]
fn snapshot_transfer_resets_a_far_behind_follower() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();

    net.isolate(3);
    for i in 0..10 {
        net.get(1).propose(format!("e{i}").into_bytes()).unwrap();
        net.drain();
    }
    net.apply_all();

    // Leader snapshots its state and drops the whole log prefix.
    let applied = net.get(1).log.applied;
    let term = net.get(1).log.term(applied).unwrap();
    let snapshot = Snapshot {
        meta: SnapshotMeta {
            index: applied,
            term,
            conf_state: ConfState::new([1, 2, 3]),
        },
        data: b"image".to_vec(),
    };
    net.get(1).store_snapshot(snapshot, 0);

    net.heal();
    net.get(1).tick();
    net.drain();

    let follower = net.get(3);
    let pending = follower.take_pending_snapshot().expect("snapshot installed");
    assert_eq!(pending.meta.index, applied);
    assert_eq!(pending.data, b"image");
    assert_eq!(follower.log.committed, applied);

    // Normal replication resumes past the snapshot.
    net.get(1).propose(b"after".to_vec()).unwrap();
    net.drain();
    assert_eq!(net.get(3).log.last_index(), net.get(1).log.last_index());
}

#[test]
fn leader_without_quorum_contact_steps_down() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();
    net.isolate(1);

    // The first check window still sees the activity recorded during
    // the election; the second one sees silence.
    for _ in 0..25 {
        net.get(1).tick();
    }
    assert_eq!(net.get(1).role, Role::Follower);
    assert_eq!(net.get(1).leader_id, NONE);
}

#[test]
fn read_index_releases_after_quorum_acks() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();
    net.get(1).propose(b"x".to_vec()).unwrap();
    net.drain();

    let committed = net.get(1).log.committed;
    net.get(1).read_index(b"token-1".to_vec()).unwrap();
    net.drain();

    let states = net.get(1).take_read_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].index, committed);
    assert_eq!(states[0].request_ctx, b"token-1");
}

#[test]
fn follower_read_index_goes_through_the_leader() {
    let mut net = Net::new(3, false);
    net.get(1).campaign(false);
    net.drain();

    net.get(2).read_index(b"token-2".to_vec()).unwrap();
    net.drain();

    let states = net.get(2).take_read_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].request_ctx, b"token-2");
    assert_eq!(states[0].index, net.get(1).log.committed);
}

#[test]
fn election_timeout_fires_without_a_leader() {
    let mut net = Net::new(3, false);
    // Randomized timeout is below 2 * election_ticks.
    for _ in 0..20 {
        net.get(1).tick();
    }
    assert_ne!(net.get(1).role, Role::Follower);
}

#[test]
fn leader_lease_shields_against_disruptive_campaigns() {
    let mut net = Net::new(3, false);
    net.get(2).campaign(false);
    net.drain();
    assert_eq!(net.leader_id(), Some(2));

    // Node 3 campaigns while the others still hear from their leader:
    // with check-quorum on, the vote requests are ignored outright and
    // the established leader keeps its term.
    net.get(3).campaign(false);
    net.drain();
    assert_eq!(net.leader_id(), Some(2));
    assert_eq!(net.get(2).term, 1);
    assert_eq!(net.get(3).role, Role::Candidate);
}
