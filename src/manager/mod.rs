//! Per-host controller: starts, stops, and enumerates KVS replicas on this
//! machine on behalf of an orchestrator.
//!
//! Addresses handed to `Start` are the replicas' client API addresses; each
//! replica binds its internal peer endpoint one port above its API port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::server::{KvsReplica, ReplicaId};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    PaxkvError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Offset of a replica's internal peer port above its client API port.
const P2P_PORT_OFFSET: u16 = 1;

/// Requests accepted by the controller.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlRequest {
    /// Spawn the replica at `replicas[index]`, clustered with the listed
    /// peers.
    Start {
        index: ReplicaId,
        replicas: Vec<SocketAddr>,
    },

    /// Shut down the replica bound to the given API address.
    Stop { addr: SocketAddr },

    /// List active replicas on this host.
    GetAll,

    /// Shut down all replicas on this host.
    KillAll,
}

/// Outcome codes of controller requests.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CtrlStatus {
    Ok,
    AlreadyExists,
    NotFound,
    InvalidArgument,
}

/// Replies sent back by the controller.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlReply {
    Start { status: CtrlStatus },
    Stop { status: CtrlStatus },
    GetAll { addrs: Vec<SocketAddr> },
    KillAll { stopped: u64 },
}

/// A running replica's lifecycle handles.
struct ReplicaHandle {
    tx_term: watch::Sender<bool>,
    join_handle: JoinHandle<()>,
}

/// Map from API address -> running replica, shared across servant tasks.
type ReplicaMap = Arc<Mutex<HashMap<SocketAddr, ReplicaHandle>>>;

/// Per-host controller service.
pub struct KvsController {
    /// IP address (as text) of the host this controller manages.
    host: String,

    /// Directory under which per-replica storage and log roots live.
    base_dir: PathBuf,

    /// Listener for orchestrator connections.
    listener: tokio::net::TcpListener,

    /// Replicas currently running on this host.
    replicas: ReplicaMap,
}

impl KvsController {
    /// Binds the controller on the given control address.
    pub async fn new_and_setup(
        ctrl_addr: SocketAddr,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self, PaxkvError> {
        let listener = tcp_bind_with_retry(ctrl_addr, 10).await?;
        pf_info!("ctrl"; "controller listening on '{}'", ctrl_addr);
        Ok(KvsController {
            host: ctrl_addr.ip().to_string(),
            base_dir: base_dir.into(),
            listener,
            replicas: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Serves orchestrator connections forever.
    pub async fn run(&mut self) -> Result<(), PaxkvError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            pf_debug!("ctrl"; "accepted orchestrator conn from '{}'",
                              peer_addr);
            let host = self.host.clone();
            let base_dir = self.base_dir.clone();
            let replicas = self.replicas.clone();
            tokio::spawn(async move {
                servant_task(stream, host, base_dir, replicas).await;
            });
        }
    }
}

/// Serves one orchestrator connection: a request/reply loop.
async fn servant_task(
    stream: TcpStream,
    host: String,
    base_dir: PathBuf,
    replicas: ReplicaMap,
) {
    let (mut conn_read, conn_write) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(8 + 1024);
    let mut write_buf = BytesMut::with_capacity(8 + 1024);
    let mut write_buf_cursor = 0;

    loop {
        let req: CtrlRequest =
            match safe_tcp_read(&mut read_buf, &mut conn_read).await {
                Ok(req) => req,
                Err(_e) => break, // orchestrator disconnected
            };

        let reply = handle_ctrl_req(&host, &base_dir, &replicas, req).await;

        let mut sent = match safe_tcp_write(
            &mut write_buf,
            &mut write_buf_cursor,
            &conn_write,
            Some(&reply),
        ) {
            Ok(sent) => sent,
            Err(_e) => break,
        };
        while !sent {
            match safe_tcp_write::<CtrlReply, _>(
                &mut write_buf,
                &mut write_buf_cursor,
                &conn_write,
                None,
            ) {
                Ok(s) => sent = s,
                Err(_e) => return,
            }
        }
    }
}

/// Carries out one controller request.
async fn handle_ctrl_req(
    host: &str,
    base_dir: &PathBuf,
    replicas: &ReplicaMap,
    req: CtrlRequest,
) -> CtrlReply {
    match req {
        CtrlRequest::Start {
            index,
            replicas: cluster,
        } => CtrlReply::Start {
            status: start_replica(host, base_dir, replicas, index, cluster)
                .await,
        },

        CtrlRequest::Stop { addr } => {
            let mut replicas = replicas.lock().await;
            match replicas.remove(&addr) {
                Some(handle) => {
                    stop_replica(addr, handle);
                    CtrlReply::Stop {
                        status: CtrlStatus::Ok,
                    }
                }
                None => CtrlReply::Stop {
                    status: CtrlStatus::NotFound,
                },
            }
        }

        CtrlRequest::GetAll => {
            let replicas = replicas.lock().await;
            CtrlReply::GetAll {
                addrs: replicas.keys().copied().collect(),
            }
        }

        CtrlRequest::KillAll => {
            let mut replicas = replicas.lock().await;
            let mut stopped = 0;
            for (addr, handle) in replicas.drain() {
                stop_replica(addr, handle);
                stopped += 1;
            }
            CtrlReply::KillAll { stopped }
        }
    }
}

/// Validates a Start request and spawns the replica.
async fn start_replica(
    host: &str,
    base_dir: &PathBuf,
    replicas: &ReplicaMap,
    index: ReplicaId,
    cluster: Vec<SocketAddr>,
) -> CtrlStatus {
    if cluster.is_empty() || (index as usize) >= cluster.len() {
        return CtrlStatus::InvalidArgument;
    }
    let api_addr = cluster[index as usize];
    if api_addr.ip().to_string() != host {
        return CtrlStatus::InvalidArgument;
    }

    let mut replicas_guard = replicas.lock().await;
    if replicas_guard.contains_key(&api_addr) {
        return CtrlStatus::AlreadyExists;
    }

    let population = cluster.len() as u8;
    let p2p_addr = SocketAddr::new(
        api_addr.ip(),
        api_addr.port() + P2P_PORT_OFFSET,
    );
    let peer_addrs: HashMap<ReplicaId, SocketAddr> = cluster
        .iter()
        .enumerate()
        .filter(|&(peer, _)| peer != index as usize)
        .map(|(peer, addr)| {
            (
                peer as ReplicaId,
                SocketAddr::new(addr.ip(), addr.port() + P2P_PORT_OFFSET),
            )
        })
        .collect();

    let config_str = format!(
        "storage_root = '{}'\nlog_root = '{}'",
        base_dir
            .join(format!("{}_sstables", api_addr.port()))
            .display(),
        base_dir.join(format!("{}_logs", api_addr.port())).display(),
    );

    let (tx_term, rx_term) = watch::channel(false);
    let join_handle = tokio::spawn(async move {
        let mut replica = match KvsReplica::new_and_setup(
            index,
            population,
            api_addr,
            p2p_addr,
            peer_addrs,
            Some(&config_str),
        )
        .await
        {
            Ok(replica) => replica,
            Err(e) => {
                pf_error!(index; "error setting up replica: {}", e);
                return;
            }
        };
        pf_info!(index; "replica listening on '{}'", api_addr);
        if let Err(e) = replica.run(rx_term).await {
            pf_error!(index; "replica exited with error: {}", e);
        }
    });

    replicas_guard.insert(
        api_addr,
        ReplicaHandle {
            tx_term,
            join_handle,
        },
    );
    CtrlStatus::Ok
}

/// Signals a replica to terminate and reclaims its task.
fn stop_replica(addr: SocketAddr, handle: ReplicaHandle) {
    pf_info!("ctrl"; "stopping replica on '{}'", addr);
    let _ = handle.tx_term.send(true);
    // abort in case the replica is wedged awaiting agreement; dropping the
    // replica releases its listeners
    handle.join_handle.abort();
}

/// Client-side stub to a controller.
pub struct CtrlStub {
    conn_read: tokio::net::tcp::OwnedReadHalf,
    conn_write: tokio::net::tcp::OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
}

impl CtrlStub {
    /// Connects to a controller's control address.
    pub async fn new_by_connect(
        ctrl_addr: SocketAddr,
    ) -> Result<Self, PaxkvError> {
        let conn = tcp_connect_with_retry(ctrl_addr, 3).await?;
        let (conn_read, conn_write) = conn.into_split();
        Ok(CtrlStub {
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
        })
    }

    /// Performs one request/reply round-trip.
    pub async fn call(
        &mut self,
        req: &CtrlRequest,
    ) -> Result<CtrlReply, PaxkvError> {
        let mut sent = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            Some(req),
        )?;
        while !sent {
            sent = safe_tcp_write::<CtrlRequest, _>(
                &mut self.write_buf,
                &mut self.write_buf_cursor,
                &self.conn_write,
                None,
            )?;
        }
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}
