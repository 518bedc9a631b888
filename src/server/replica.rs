//! The replicated state machine server: turns client requests into ops,
//! drives consensus, logs decisions durably, and applies them to the
//! storage engine in slot order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::client::ClientId;
use crate::paxos::{Paxos, SeqNum};
use crate::server::{
    ApiReply, ApiRequest, ExternalApi, Op, OpKind, OpLogger, OpOutput,
    ReplicaId, TransportHub,
};
use crate::storage::Store;
use crate::utils::PaxkvError;

use serde::Deserialize;

use tokio::sync::watch;
use tokio::time;

/// Interval between `status()` polls while waiting for a slot to decide.
const AGREEMENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Root directory of the per-cell sstable files.
    pub storage_root: String,

    /// Directory of the durable op log.
    pub log_root: String,

    /// Cache capacity in bytes.
    pub cache_capacity: usize,

    /// Client request batching interval in millisecs.
    pub batch_interval_ms: u64,

    /// Whether to call `fdatasync()` on the op logger.
    pub logger_sync: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            storage_root: "/tmp/paxkv.sstables".into(),
            log_root: "/tmp/paxkv.logs".into(),
            cache_capacity: 500 * 1024 * 1024,
            batch_interval_ms: 1,
            logger_sync: false,
        }
    }
}

/// One KVS server replica.
pub struct KvsReplica {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    _population: u8,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// Consensus layer handle.
    paxos: Paxos,

    /// Storage engine.
    store: Store,

    /// Durable op logger.
    logger: OpLogger,

    /// The highest consensus slot that has been applied locally.
    global_seq: SeqNum,

    /// Memoized outputs of processed requests, for answering client
    /// retries idempotently.
    visited_requests: HashMap<String, OpOutput>,
}

impl KvsReplica {
    /// Creates a replica and sets up all functionality modules: binds the
    /// peer transport, connects the cluster, and opens storage and log.
    pub async fn new_and_setup(
        id: ReplicaId,
        population: u8,
        api_addr: SocketAddr,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<ReplicaId, SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, PaxkvError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    storage_root, log_root, cache_capacity,
                                    batch_interval_ms, logger_sync)?;
        if config.batch_interval_ms == 0 {
            return logged_err!(
                id;
                "invalid config.batch_interval_ms '{}'",
                config.batch_interval_ms
            );
        }
        if config.cache_capacity == 0 {
            return logged_err!(
                id;
                "invalid config.cache_capacity '{}'",
                config.cache_capacity
            );
        }

        // set up transport hub and form the cluster group: I proactively
        // dial every lower-ID peer, and wait for higher-ID peers to dial me
        let mut transport_hub =
            TransportHub::new_and_setup(id, population, p2p_addr).await?;
        let mut lower_peers: Vec<(ReplicaId, SocketAddr)> = peer_addrs
            .iter()
            .filter(|(&peer, _)| peer < id)
            .map(|(&peer, &addr)| (peer, addr))
            .collect();
        lower_peers.sort();
        for (peer, addr) in lower_peers {
            transport_hub.connect_to_peer(peer, addr).await?;
        }
        transport_hub.wait_for_group(population).await?;
        pf_info!(id; "cluster group of size {} formed", population);

        let paxos = Paxos::new_and_setup(id, population, transport_hub)?;

        let external_api = ExternalApi::new_and_setup(
            id,
            api_addr,
            Duration::from_millis(config.batch_interval_ms),
        )
        .await?;

        let store = Store::new(&config.storage_root, config.cache_capacity);
        let logger =
            OpLogger::new_and_setup(id, &config.log_root, config.logger_sync)
                .await?;

        Ok(KvsReplica {
            id,
            _population: population,
            external_api,
            paxos,
            store,
            logger,
            global_seq: -1,
            visited_requests: HashMap::new(),
        })
    }

    /// Main event loop of the replica. Replays the durable log first, then
    /// serves client requests one at a time until the termination signal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), PaxkvError> {
        self.recover_from_log().await?;

        loop {
            tokio::select! {
                // client request batch
                req_batch = self.external_api.get_req_batch() => {
                    let req_batch = match req_batch {
                        Ok(batch) => batch,
                        Err(e) => {
                            pf_error!(self.id; "error getting req batch: {}", e);
                            continue;
                        }
                    };
                    for (client, req) in req_batch {
                        if let Err(e) = self.handle_req(client, req).await {
                            pf_error!(self.id; "error handling req: {}", e);
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "server caught termination signal");
                    return Ok(());
                }
            }
        }
    }

    /// Replica ID accessor.
    pub fn id(&self) -> ReplicaId {
        self.id
    }
}

// KvsReplica request handling
impl KvsReplica {
    /// Row/col validation applied at the RPC boundary.
    fn validate_key(key: &str) -> Result<(), String> {
        if key.is_empty() {
            Err("row/col cannot be empty".into())
        } else if key.contains(' ') {
            Err("row/col cannot contain spaces".into())
        } else {
            Ok(())
        }
    }

    /// Serializes one client request: validate, map to an `Op`, order it
    /// through consensus, apply, and reply.
    async fn handle_req(
        &mut self,
        client: ClientId,
        req: ApiRequest,
    ) -> Result<(), PaxkvError> {
        let reply = match req {
            ApiRequest::Put {
                row,
                col,
                new_value,
                curr_value,
                option,
                request_id,
                lock_id,
            } => {
                if let Err(reason) = Self::validate_key(&row)
                    .and_then(|()| Self::validate_key(&col))
                {
                    ApiReply::Invalid { reason }
                } else {
                    let kind = match option {
                        1 => OpKind::CPut,
                        2 => OpKind::Delete,
                        _ => OpKind::Put,
                    };
                    pf_debug!(self.id; "received Put {} on key {}-{}",
                                       request_id, row, col);
                    let op = Op::cell(
                        kind, row, col, new_value, curr_value, request_id,
                        lock_id,
                    );
                    let output = self.sequenced_output(op).await?;
                    ApiReply::Put {
                        success: output.success,
                    }
                }
            }

            ApiRequest::Get {
                row,
                col,
                request_id,
                lock_id,
            } => {
                if let Err(reason) = Self::validate_key(&row)
                    .and_then(|()| Self::validate_key(&col))
                {
                    ApiReply::Invalid { reason }
                } else {
                    pf_debug!(self.id; "received Get {} on key {}-{}",
                                       request_id, row, col);
                    let op = Op::cell(
                        OpKind::Get,
                        row,
                        col,
                        "",
                        "",
                        request_id,
                        lock_id,
                    );
                    let output = self.sequenced_output(op).await?;
                    ApiReply::Get {
                        success: output.success,
                        value: output.value,
                    }
                }
            }

            ApiRequest::SetNx {
                row,
                request_id,
                lock_id,
            } => {
                if let Err(reason) = Self::validate_key(&row) {
                    ApiReply::Invalid { reason }
                } else {
                    pf_debug!(self.id; "received SetNX {} on row {}",
                                       request_id, row);
                    let op =
                        Op::row_only(OpKind::SetNx, row, request_id, lock_id);
                    let output = self.sequenced_output(op).await?;
                    ApiReply::SetNx {
                        success: output.success,
                    }
                }
            }

            ApiRequest::Del {
                row,
                request_id,
                lock_id,
            } => {
                if let Err(reason) = Self::validate_key(&row) {
                    ApiReply::Invalid { reason }
                } else {
                    pf_debug!(self.id; "received Del {} on row {}",
                                       request_id, row);
                    let op = Op::row_only(
                        OpKind::DelLock,
                        row,
                        request_id,
                        lock_id,
                    );
                    let output = self.sequenced_output(op).await?;
                    ApiReply::Del {
                        success: output.success,
                    }
                }
            }

            ApiRequest::AllRows { request_id } => {
                pf_debug!(self.id; "received GetAllRows {}", request_id);
                let op = Op::row_only(OpKind::AllRows, "", request_id, "");
                let output = self.sequenced_output(op).await?;
                ApiReply::Rows {
                    items: output.values,
                }
            }

            ApiRequest::AllRowsLocal => {
                let items = self.store.get_all_rows().await?;
                ApiReply::Rows { items }
            }

            ApiRequest::ColsInRow {
                row,
                request_id,
                lock_id,
            } => {
                if let Err(reason) = Self::validate_key(&row) {
                    ApiReply::Invalid { reason }
                } else {
                    pf_debug!(self.id; "received GetColsInRow {} on row {}",
                                       request_id, row);
                    let op = Op::row_only(
                        OpKind::ColsInRow,
                        row,
                        request_id,
                        lock_id,
                    );
                    let output = self.sequenced_output(op).await?;
                    ApiReply::Cols {
                        items: output.values,
                    }
                }
            }

            ApiRequest::ColsInRowLocal { row, lock_id } => {
                let items = self
                    .store
                    .get_cols_in_row(&row, &lock_id)
                    .await?
                    .unwrap_or_default();
                ApiReply::Cols { items }
            }

            // leave notifications are answered by the servant task directly
            ApiRequest::Leave => return Ok(()),
        };

        self.external_api.send_reply(reply, client)
    }

    /// Produces the output of an op, answering repeats of an already
    /// processed request from the memo instead of re-proposing.
    async fn sequenced_output(
        &mut self,
        op: Op,
    ) -> Result<OpOutput, PaxkvError> {
        if let Some(output) = self.visited_requests.get(&op.request_id) {
            pf_debug!(self.id; "answering retried request {} from memo",
                               op.request_id);
            return Ok(output.clone());
        }
        self.make_agreement_and_apply(op).await
    }

    /// Orders an op through consensus and applies it. Catches up on any
    /// slots decided in between, logging and applying each before ours.
    async fn make_agreement_and_apply(
        &mut self,
        op: Op,
    ) -> Result<OpOutput, PaxkvError> {
        // propose at increasing slots until our op wins one
        let mut seq = self.global_seq + 1;
        loop {
            pf_debug!(self.id; "proposing {} at seq {}", op.request_id, seq);
            self.paxos.start(seq, op.clone())?;
            let decided = self.wait_for_agreement(seq).await;
            if decided.request_id == op.request_id {
                break;
            }
            seq += 1;
        }

        // catch up on any slots decided under other replicas' ops
        for missed_seq in (self.global_seq + 1)..seq {
            let missed_op = self.wait_for_agreement(missed_seq).await;
            self.logger.append(&missed_op, missed_seq).await?;
            self.apply_op(&missed_op).await?;
        }

        // log-then-apply our own op
        self.logger.append(&op, seq).await?;
        let output = self.apply_op(&op).await?;

        self.global_seq = seq;
        self.paxos.done(seq);

        Ok(output)
    }

    /// Polls consensus status until the slot is decided, returning the
    /// decided op.
    async fn wait_for_agreement(&self, seq: SeqNum) -> Op {
        loop {
            if let Some(op) = self.paxos.status(seq) {
                return op;
            }
            time::sleep(AGREEMENT_POLL_INTERVAL).await;
        }
    }

    /// Applies a decided op to the storage engine and memoizes its output.
    async fn apply_op(&mut self, op: &Op) -> Result<OpOutput, PaxkvError> {
        let output = match op.kind {
            OpKind::Get => {
                match self.store.get(&op.row, &op.col, &op.lock_id).await? {
                    Some(value) => OpOutput {
                        success: true,
                        value,
                        values: Vec::new(),
                    },
                    None => OpOutput::flag(false),
                }
            }
            OpKind::Put => OpOutput::flag(
                self.store
                    .put(&op.row, &op.col, &op.new_value, &op.lock_id)
                    .await?,
            ),
            OpKind::CPut => OpOutput::flag(
                self.store
                    .cput(
                        &op.row,
                        &op.col,
                        &op.curr_value,
                        &op.new_value,
                        &op.lock_id,
                    )
                    .await?,
            ),
            OpKind::Delete => OpOutput::flag(
                self.store
                    .delete(&op.row, &op.col, &op.lock_id)
                    .await?,
            ),
            OpKind::SetNx => {
                OpOutput::flag(self.store.set_nx(&op.row, &op.lock_id))
            }
            OpKind::DelLock => {
                OpOutput::flag(self.store.del_lock(&op.row))
            }
            OpKind::AllRows => OpOutput {
                success: true,
                value: String::new(),
                values: self.store.get_all_rows().await?,
            },
            OpKind::ColsInRow => {
                match self
                    .store
                    .get_cols_in_row(&op.row, &op.lock_id)
                    .await?
                {
                    Some(cols) => OpOutput {
                        success: true,
                        value: String::new(),
                        values: cols,
                    },
                    None => OpOutput::flag(false),
                }
            }
        };

        self.visited_requests
            .insert(op.request_id.clone(), output.clone());
        Ok(output)
    }

    /// Replays the durable op log on startup, reconstructing storage state
    /// up to the last logged slot. Must run before serving any request.
    async fn recover_from_log(&mut self) -> Result<(), PaxkvError> {
        if !self.logger.recoverable() {
            return Ok(());
        }

        if let Some(global_seq) = self.logger.recover_global_seq().await? {
            self.global_seq = global_seq;
        }

        let mut replayed = 0;
        while self.logger.has_next_op() {
            let op = self.logger.recover_op().await?;
            self.apply_op(&op).await?;
            replayed += 1;
        }
        pf_info!(self.id; "recovered {} logged ops, global_seq {}",
                          replayed, self.global_seq);
        Ok(())
    }
}
