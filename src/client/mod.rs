//! Client library: row-sharded addressing across clusters, per-op request
//! IDs, retrying RPC loops, and the client-side lock token cache.

mod apistub;
mod sharding;

pub use apistub::ClientApiStub;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::server::{ApiReply, ApiRequest};
use crate::storage::NO_LOCK;
use crate::utils::PaxkvError;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use rand::Rng;

use tokio::time::{self, Duration};

/// Client ID type.
pub type ClientId = u64;

/// `option` codes of the Put RPC.
pub const PUT_OPTION_PUT: u8 = 0;
pub const PUT_OPTION_CPUT: u8 = 1;
pub const PUT_OPTION_DELETE: u8 = 2;

/// Delay between full passes over a cluster's replicas when RPCs fail.
const RETRY_PASS_DELAY: Duration = Duration::from_millis(100);

/// KVS client handle. Rows are sharded across the configured clusters by a
/// deterministic hash; within a cluster, replicas are attempted in list
/// order with retries until one answers.
pub struct KvsClient {
    /// My client ID.
    id: ClientId,

    /// Monotonically increasing transaction counter.
    txn_id: u64,

    /// List of clusters, each a list of replica API addresses.
    clusters: Vec<Vec<SocketAddr>>,

    /// Established connection stubs, keyed by server address.
    stubs: HashMap<SocketAddr, ClientApiStub>,

    /// Row locks held by this client: row -> token.
    locks: HashMap<String, String>,
}

impl KvsClient {
    /// Creates a client over the given clusters of replica API addresses.
    pub fn new(clusters: Vec<Vec<SocketAddr>>) -> Self {
        assert!(
            !clusters.is_empty() && clusters.iter().all(|c| !c.is_empty()),
            "invalid clusters configuration"
        );
        KvsClient {
            id: rand::thread_rng().gen(),
            txn_id: 1,
            clusters,
            stubs: HashMap::new(),
            locks: HashMap::new(),
        }
    }

    /// Puts a cell value.
    pub async fn put(
        &mut self,
        row: &str,
        col: &str,
        value: &[u8],
        lock_id: &str,
    ) -> Result<bool, PaxkvError> {
        Self::validate_args(row, col)?;
        self.do_put(row, col, value, b"", lock_id, PUT_OPTION_PUT)
            .await
    }

    /// Puts a cell value iff its current value equals `old_value`.
    pub async fn cput(
        &mut self,
        row: &str,
        col: &str,
        old_value: &[u8],
        new_value: &[u8],
        lock_id: &str,
    ) -> Result<bool, PaxkvError> {
        Self::validate_args(row, col)?;
        self.do_put(row, col, new_value, old_value, lock_id, PUT_OPTION_CPUT)
            .await
    }

    /// Reads a cell value.
    pub async fn get(
        &mut self,
        row: &str,
        col: &str,
        lock_id: &str,
    ) -> Result<Option<Vec<u8>>, PaxkvError> {
        Self::validate_args(row, col)?;
        let req = ApiRequest::Get {
            row: row.into(),
            col: col.into(),
            request_id: self.generate_id(),
            lock_id: lock_id.into(),
        };
        let cluster = self.cluster_of(row);
        match self.call_cluster(cluster, &req).await? {
            ApiReply::Get {
                success: true,
                value,
            } => Ok(Some(BASE64.decode(value).map_err(PaxkvError::msg)?)),
            ApiReply::Get { success: false, .. } => Ok(None),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Deletes a cell.
    pub async fn delete(
        &mut self,
        row: &str,
        col: &str,
        lock_id: &str,
    ) -> Result<bool, PaxkvError> {
        Self::validate_args(row, col)?;
        self.do_put(row, col, b"", b"", lock_id, PUT_OPTION_DELETE).await
    }

    /// Acquires the lock of a row. On success returns the generated token,
    /// which must accompany all further operations on the row until
    /// released with `del()`. Returns `None` if the row is already locked
    /// (including by this client itself).
    pub async fn set_nx(
        &mut self,
        row: &str,
    ) -> Result<Option<String>, PaxkvError> {
        Self::validate_args(row, "1")?;
        if self.locks.contains_key(row) {
            return Ok(None);
        }

        let token = rand::thread_rng().gen::<u64>().to_string();
        let req = ApiRequest::SetNx {
            row: row.into(),
            request_id: self.generate_id(),
            lock_id: token.clone(),
        };
        let cluster = self.cluster_of(row);
        match self.call_cluster(cluster, &req).await? {
            ApiReply::SetNx { success: true } => {
                self.locks.insert(row.into(), token.clone());
                Ok(Some(token))
            }
            ApiReply::SetNx { success: false } => Ok(None),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Releases the lock of a row, if this client holds it under the given
    /// token.
    pub async fn del(
        &mut self,
        row: &str,
        token: &str,
    ) -> Result<bool, PaxkvError> {
        Self::validate_args(row, "1")?;
        match self.locks.get(row) {
            Some(held) if held == token => {}
            _ => return Ok(false),
        }

        let req = ApiRequest::Del {
            row: row.into(),
            request_id: self.generate_id(),
            lock_id: token.into(),
        };
        let cluster = self.cluster_of(row);
        match self.call_cluster(cluster, &req).await? {
            ApiReply::Del { success } => {
                self.locks.remove(row);
                Ok(success)
            }
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Enumerates all rows of the whole store, fanning out over every
    /// cluster. Duplicates are possible; callers de-duplicate when needed.
    pub async fn get_all_rows(&mut self) -> Result<Vec<String>, PaxkvError> {
        let mut rows = Vec::new();
        for cluster in 0..self.clusters.len() {
            let req = ApiRequest::AllRows {
                request_id: self.generate_id(),
            };
            match self.call_cluster(cluster, &req).await? {
                ApiReply::Rows { items } => rows.extend(items),
                reply => return Err(unexpected_reply(reply)),
            }
        }
        Ok(rows)
    }

    /// Enumerates the columns of a row.
    pub async fn get_cols_in_row(
        &mut self,
        row: &str,
        lock_id: &str,
    ) -> Result<Vec<String>, PaxkvError> {
        Self::validate_args(row, "1")?;
        let req = ApiRequest::ColsInRow {
            row: row.into(),
            request_id: self.generate_id(),
            lock_id: lock_id.into(),
        };
        let cluster = self.cluster_of(row);
        match self.call_cluster(cluster, &req).await? {
            ApiReply::Cols { items } => Ok(items),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Enumerates the rows held by one specific server, without consensus.
    pub async fn get_all_rows_on(
        &mut self,
        server: SocketAddr,
    ) -> Result<Vec<String>, PaxkvError> {
        match self.call_server(server, &ApiRequest::AllRowsLocal).await? {
            ApiReply::Rows { items } => Ok(items),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Enumerates the columns of a row on one specific server, without
    /// consensus.
    pub async fn get_cols_in_row_on(
        &mut self,
        server: SocketAddr,
        row: &str,
        lock_id: &str,
    ) -> Result<Vec<String>, PaxkvError> {
        let req = ApiRequest::ColsInRowLocal {
            row: row.into(),
            lock_id: lock_id.into(),
        };
        match self.call_server(server, &req).await? {
            ApiReply::Cols { items } => Ok(items),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Sends leave notifications over all established connections.
    pub async fn leave(&mut self) -> Result<(), PaxkvError> {
        for (addr, mut stub) in self.stubs.drain() {
            if stub.send_req_retrying(&ApiRequest::Leave).is_ok() {
                let _ = stub.recv_reply().await;
            }
            pf_debug!(self.id; "left server connection '{}'", addr);
        }
        Ok(())
    }

    /// Token carried by unlocked operations.
    pub fn no_lock() -> &'static str {
        NO_LOCK
    }
}

// KvsClient internal machinery
impl KvsClient {
    /// Row/col validation: non-empty and free of spaces.
    fn validate_args(row: &str, col: &str) -> Result<(), PaxkvError> {
        if row.is_empty() || col.is_empty() {
            return Err(PaxkvError::msg("row and col cannot be empty"));
        }
        if row.contains(' ') || col.contains(' ') {
            return Err(PaxkvError::msg("row and col cannot contain spaces"));
        }
        Ok(())
    }

    /// Index of the cluster owning a row.
    fn cluster_of(&self, row: &str) -> usize {
        sharding::cluster_index(row, self.clusters.len())
    }

    /// Generates a request ID unique with very high probability:
    /// `<clientID>-<wallclock>-<txnID>-<random64>`.
    fn generate_id(&mut self) -> String {
        let wallclock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let id = format!(
            "{}-{}-{}-{}",
            self.id,
            wallclock,
            self.txn_id,
            rand::thread_rng().gen::<u64>()
        );
        self.txn_id += 1;
        id
    }

    /// The shared mutation path of put/cput/delete.
    async fn do_put(
        &mut self,
        row: &str,
        col: &str,
        new_value: &[u8],
        old_value: &[u8],
        lock_id: &str,
        option: u8,
    ) -> Result<bool, PaxkvError> {
        let req = ApiRequest::Put {
            row: row.into(),
            col: col.into(),
            new_value: BASE64.encode(new_value),
            curr_value: BASE64.encode(old_value),
            option,
            request_id: self.generate_id(),
            lock_id: lock_id.into(),
        };
        let cluster = self.cluster_of(row);
        match self.call_cluster(cluster, &req).await? {
            ApiReply::Put { success } => Ok(success),
            reply => Err(unexpected_reply(reply)),
        }
    }

    /// Performs one RPC against a cluster: walks its replicas in list
    /// order, retrying after a short delay until some replica answers.
    async fn call_cluster(
        &mut self,
        cluster: usize,
        req: &ApiRequest,
    ) -> Result<ApiReply, PaxkvError> {
        loop {
            let servers = self.clusters[cluster].clone();
            for server in servers {
                match self.call_server(server, req).await {
                    Ok(reply) => return Ok(reply),
                    Err(_e) => continue, // try the next replica
                }
            }
            time::sleep(RETRY_PASS_DELAY).await;
        }
    }

    /// Performs one RPC round-trip against one server, connecting lazily.
    /// Any failure drops the cached connection so the next attempt dials
    /// afresh.
    async fn call_server(
        &mut self,
        server: SocketAddr,
        req: &ApiRequest,
    ) -> Result<ApiReply, PaxkvError> {
        if !self.stubs.contains_key(&server) {
            let stub = ClientApiStub::new_by_connect(self.id, server).await?;
            self.stubs.insert(server, stub);
        }

        let stub = self.stubs.get_mut(&server).unwrap();
        let result = async {
            stub.send_req_retrying(req)?;
            stub.recv_reply().await
        }
        .await;

        if result.is_err() {
            self.stubs.remove(&server);
        }
        result
    }
}

fn unexpected_reply(reply: ApiReply) -> PaxkvError {
    PaxkvError(format!("unexpected reply type received: {:?}", reply))
}

#[cfg(test)]
mod client_tests {
    use super::*;

    #[test]
    fn request_ids_unique() {
        let mut client = KvsClient::new(vec![vec!["127.0.0.1:39999"
            .parse()
            .unwrap()]]);
        let a = client.generate_id();
        let b = client.generate_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("{}-", client.id)));
        assert_eq!(a.split('-').count(), 4);
    }

    #[test]
    fn arg_validation() {
        assert!(KvsClient::validate_args("row", "col").is_ok());
        assert!(KvsClient::validate_args("", "col").is_err());
        assert!(KvsClient::validate_args("row", "").is_err());
        assert!(KvsClient::validate_args("has space", "col").is_err());
        assert!(KvsClient::validate_args("row", "c ol").is_err());
    }

    #[test]
    #[should_panic]
    fn empty_clusters_rejected() {
        KvsClient::new(vec![]);
    }
}
