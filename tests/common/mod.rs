//! Shared harness for multi-replica integration tests: spins up in-process
//! clusters on localhost ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use paxkv::{KvsReplica, ReplicaId};

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One in-process test cluster.
pub struct TestCluster {
    /// Client-facing API addresses of the replicas, in replica ID order.
    pub api_addrs: Vec<SocketAddr>,

    /// Base directory of the replicas' storage and log roots.
    pub base_dir: PathBuf,

    /// Per-replica termination senders and task handles.
    handles: Vec<Option<(watch::Sender<bool>, JoinHandle<()>)>>,

    base_port: u16,
}

impl TestCluster {
    /// Starts `population` replicas named under `/tmp/paxkv-test-<name>`,
    /// with API ports at `base_port + 10*i` and peer ports one above.
    /// Wipes any prior state when `wipe` is set.
    pub async fn start(
        name: &str,
        base_port: u16,
        population: u8,
        wipe: bool,
    ) -> TestCluster {
        let base_dir = PathBuf::from(format!("/tmp/paxkv-test-{}", name));
        if wipe {
            let _ = tokio::fs::remove_dir_all(&base_dir).await;
        }

        let mut cluster = TestCluster {
            api_addrs: (0..population)
                .map(|i| api_addr_of(base_port, i))
                .collect(),
            base_dir,
            handles: (0..population).map(|_| None).collect(),
            base_port,
        };
        for id in 0..population {
            cluster.start_replica(id, population).await;
        }
        cluster
    }

    /// Starts (or restarts) one replica of the cluster.
    pub async fn start_replica(&mut self, id: ReplicaId, population: u8) {
        let api_addr = api_addr_of(self.base_port, id);
        let p2p_addr = p2p_addr_of(self.base_port, id);
        let peer_addrs: HashMap<ReplicaId, SocketAddr> = (0..population)
            .filter(|&peer| peer != id)
            .map(|peer| (peer, p2p_addr_of(self.base_port, peer)))
            .collect();
        let config_str = format!(
            "storage_root = '{}'\nlog_root = '{}'\ncache_capacity = {}\nlogger_sync = true",
            self.base_dir.join(format!("{}_sstables", id)).display(),
            self.base_dir.join(format!("{}_logs", id)).display(),
            1024 * 1024,
        );

        let (tx_term, rx_term) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut replica = KvsReplica::new_and_setup(
                id,
                population,
                api_addr,
                p2p_addr,
                peer_addrs,
                Some(&config_str),
            )
            .await
            .expect("replica setup failed");
            replica.run(rx_term).await.expect("replica run failed");
        });
        self.handles[id as usize] = Some((tx_term, handle));
    }

    /// Tears one replica down, keeping its on-disk state.
    pub fn kill_replica(&mut self, id: ReplicaId) {
        if let Some((tx_term, handle)) = self.handles[id as usize].take() {
            let _ = tx_term.send(true);
            handle.abort();
        }
    }

    /// Tears the whole cluster down.
    pub fn kill_all(&mut self) {
        for id in 0..self.handles.len() {
            self.kill_replica(id as ReplicaId);
        }
    }

    /// Path of one replica's log directory.
    pub fn log_dir(&self, id: ReplicaId) -> PathBuf {
        self.base_dir.join(format!("{}_logs", id))
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.kill_all();
    }
}

fn api_addr_of(base_port: u16, id: ReplicaId) -> SocketAddr {
    format!("127.0.0.1:{}", base_port + 10 * id as u16)
        .parse()
        .unwrap()
}

fn p2p_addr_of(base_port: u16, id: ReplicaId) -> SocketAddr {
    format!("127.0.0.1:{}", base_port + 10 * id as u16 + 1)
        .parse()
        .unwrap()
}
