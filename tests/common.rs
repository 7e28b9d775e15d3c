//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use strata::config::{Config, LeaseConfig, PeerConfig, RaftConfig, StorageConfig, WatchConfig};
use strata::raft::transport::{LocalMesh, Transport};
use strata::server::command::{CommandResponse, PutRequest, RangeRequest};
use strata::server::Node;
use tempfile::TempDir;

/// A test cluster over the in-memory mesh.
pub struct Cluster {
    pub mesh: Arc<LocalMesh>,
    pub nodes: Vec<Option<Arc<Node>>>,
    pub dirs: Vec<TempDir>,
    pub cfgs: Vec<Config>,
}

/// A configuration tuned for fast tests: 10 ms ticks, aggressive lease
/// and watch cadences.
pub fn test_config(id: u64, dir: &std::path::Path, peers: &[u64]) -> Config {
    Config {
        node_id: id,
        data_dir: dir.to_path_buf(),
        initial_cluster: peers
            .iter()
            .map(|&id| PeerConfig {
                id,
                addr: format!("mesh-{id}"),
            })
            .collect(),
        raft: RaftConfig {
            tick_interval_ms: 10,
            election_ticks: 50,
            heartbeat_ticks: 2,
            pre_vote: true,
            check_quorum: true,
            snapshot_count: 100_000,
            snapshot_catchup_entries: 16,
            max_request_bytes: 1536 * 1024,
            max_inflight_proposals: 1024,
        },
        storage: StorageConfig {
            wal_segment_bytes: 4 * 1024 * 1024,
            backend_batch_limit: 64,
            backend_batch_interval_ms: 20,
            compaction_batch_limit: 64,
            max_key_bytes: 1536,
        },
        lease: LeaseConfig {
            tick_interval_ms: 50,
            min_ttl_secs: 1,
        },
        watch: WatchConfig {
            catchup_interval_ms: 20,
            batch_limit: 256,
            channel_capacity: 64,
            stall_budget: 20,
        },
    }
}

impl Cluster {
    /// Start `n` members, force member 1 to lead, and wait for it.
    pub async fn start(n: usize) -> Cluster {
        Self::start_with(n, |_| {}).await
    }

    /// Start `n` members with a config adjustment applied to each.
    pub async fn start_with(n: usize, tweak: impl Fn(&mut Config)) -> Cluster {
        let mesh = LocalMesh::new();
        let ids: Vec<u64> = (1..=n as u64).collect();
        let mut dirs = Vec::new();
        let mut nodes = Vec::new();
        let mut cfgs = Vec::new();
        for &id in &ids {
            let dir = tempfile::tempdir().expect("tempdir");
            let incoming = mesh.register(id);
            let mut cfg = test_config(id, dir.path(), &ids);
            tweak(&mut cfg);
            let transport: Arc<dyn Transport> = mesh.clone();
            let node = Node::start(cfg.clone(), transport, incoming)
                .await
                .expect("node start");
            dirs.push(dir);
            nodes.push(Some(node));
            cfgs.push(cfg);
        }
        let cluster = Cluster {
            mesh,
            nodes,
            dirs,
            cfgs,
        };
        cluster.node(1).campaign().await.expect("campaign");
        cluster.wait_for_leader().await;
        cluster
    }

    /// The running node with member id `id`. Panics when stopped.
    pub fn node(&self, id: u64) -> Arc<Node> {
        self.nodes[(id - 1) as usize]
            .as_ref()
            .expect("node is stopped")
            .clone()
    }

    /// Stop a member and cut it from the mesh.
    pub async fn kill(&mut self, id: u64) {
        if let Some(node) = self.nodes[(id - 1) as usize].take() {
            node.stop().await;
            self.mesh.deregister(id);
            drop(node);
        }
        // Background tasks unwind and release the data dir lock.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    /// Restart a previously killed member on its data dir with its
    /// original configuration.
    pub async fn restart(&mut self, id: u64) {
        let incoming = self.mesh.register(id);
        let cfg = self.cfgs[(id - 1) as usize].clone();
        let transport: Arc<dyn Transport> = self.mesh.clone();
        let node = Node::start(cfg, transport, incoming)
            .await
            .expect("node restart");
        self.nodes[(id - 1) as usize] = Some(node);
    }

    /// Wait until some member reports itself leader.
    pub async fn wait_for_leader(&self) -> u64 {
        for _ in 0..500 {
            for node in self.nodes.iter().flatten() {
                if node.is_leader() {
                    return node.id();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    /// The current leader.
    pub async fn leader(&self) -> Arc<Node> {
        let id = self.wait_for_leader().await;
        self.node(id)
    }

    /// Wait until every running member has applied up to `revision`.
    pub async fn wait_for_revision(&self, revision: i64) {
        for _ in 0..500 {
            let mut done = true;
            for node in self.nodes.iter().flatten() {
                let status = node.status().await.expect("status");
                if status.revision < revision {
                    done = false;
                }
            }
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cluster did not reach revision {revision}");
    }

    pub async fn stop_all(&mut self) {
        for slot in self.nodes.iter_mut() {
            if let Some(node) = slot.take() {
                node.stop().await;
            }
        }
    }
}

/// Put through `node`, returning the response revision.
pub async fn put(node: &Node, key: &[u8], value: &[u8]) -> i64 {
    put_with_lease(node, key, value, 0).await
}

/// Put with a lease attachment.
pub async fn put_with_lease(node: &Node, key: &[u8], value: &[u8], lease: i64) -> i64 {
    let resp = node
        .put(PutRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            lease,
            prev_kv: false,
        })
        .await
        .expect("put");
    match resp {
        CommandResponse::Put(p) => p.header.revision,
        other => panic!("unexpected response: {other:?}"),
    }
}

/// Serializable single-key read; `None` when absent.
pub async fn get(node: &Node, key: &[u8]) -> Option<Vec<u8>> {
    get_at(node, key, 0).await.expect("range")
}

/// Serializable single-key read at a revision.
pub async fn get_at(
    node: &Node,
    key: &[u8],
    revision: i64,
) -> strata::error::Result<Option<Vec<u8>>> {
    let resp = node
        .range(RangeRequest {
            key: key.to_vec(),
            revision,
            serializable: true,
            ..Default::default()
        })
        .await?;
    Ok(resp.kvs.into_iter().next().map(|kv| kv.value))
}

/// Poll `f` every 10 ms until it returns true or `timeout` passes.
pub async fn eventually(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}
