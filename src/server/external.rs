//! Server external client-facing API module.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClientId;
use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, PaxkvError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Request received from client, mirroring the KVS RPC surface. `option`
/// of `Put` selects the mutation: 0 = put, 1 = conditional put, 2 = delete.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// PUT / CPUT / DELETE on one cell, selected by `option`.
    Put {
        row: String,
        col: String,
        new_value: String,
        curr_value: String,
        option: u8,
        request_id: String,
        lock_id: String,
    },

    /// Read one cell.
    Get {
        row: String,
        col: String,
        request_id: String,
        lock_id: String,
    },

    /// Acquire the row lock under the carried token.
    SetNx {
        row: String,
        request_id: String,
        lock_id: String,
    },

    /// Release the row lock.
    Del {
        row: String,
        request_id: String,
        lock_id: String,
    },

    /// Enumerate all rows, ordered through consensus.
    AllRows { request_id: String },

    /// Enumerate all rows of this replica only, no consensus.
    AllRowsLocal,

    /// Enumerate the columns of one row, ordered through consensus.
    ColsInRow {
        row: String,
        request_id: String,
        lock_id: String,
    },

    /// Enumerate the columns of one row on this replica only, no consensus.
    ColsInRowLocal { row: String, lock_id: String },

    /// Client leave notification.
    Leave,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Success flag of a PUT / CPUT / DELETE.
    Put { success: bool },

    /// Result of a GET; `value` is empty when unsuccessful.
    Get { success: bool, value: String },

    /// Success flag of a lock acquire.
    SetNx { success: bool },

    /// Success flag of a lock release.
    Del { success: bool },

    /// Row enumeration result.
    Rows { items: Vec<String> },

    /// Column enumeration result.
    Cols { items: Vec<String> },

    /// The request failed validation at the RPC boundary.
    Invalid { reason: String },

    /// Reply to client leave notification.
    Leave,
}

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, ApiRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    /// Notify used as batch dumping signal, shared with the batch ticker
    /// task.
    batch_notify: Arc<Notify>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Join handle of the batch ticker task.
    _batch_ticker_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module. Spawns the client acceptor task
    /// and the batch ticker task. Creates a req channel for buffering
    /// incoming client requests.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        api_addr: SocketAddr,
        batch_interval: Duration,
    ) -> Result<Self, PaxkvError> {
        if batch_interval < Duration::from_micros(1) {
            return logged_err!(
                me;
                "batch_interval {:?} too small",
                batch_interval
            );
        }

        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) = flashmap::new::<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >();

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;

        let mut acceptor = ClientAcceptorTask::new(
            me,
            tx_req,
            client_listener,
            tx_replies_write,
        );
        let client_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        let batch_notify = Arc::new(Notify::new());
        let batch_notify_ref = batch_notify.clone();
        let batch_ticker_handle = tokio::spawn(async move {
            let mut interval = time::interval(batch_interval);
            loop {
                interval.tick().await;
                batch_notify_ref.notify_one();
            }
        });

        Ok(ExternalApi {
            me,
            rx_req,
            tx_replies: tx_replies_read,
            batch_notify,
            _client_acceptor_handle: client_acceptor_handle,
            _batch_ticker_handle: batch_ticker_handle,
        })
    }

    /// Waits for the next batch dumping signal and collects all requests
    /// currently in the req channel. Returns a non-empty `VecDeque` of
    /// requests on success.
    pub(crate) async fn get_req_batch(
        &mut self,
    ) -> Result<VecDeque<(ClientId, ApiRequest)>, PaxkvError> {
        let mut batch = VecDeque::new();
        while batch.is_empty() {
            self.batch_notify.notified().await;
            loop {
                match self.rx_req.try_recv() {
                    Ok((client, req)) => batch.push_back((client, req)),
                    Err(TryRecvError::Empty) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(batch)
    }

    /// Sends a reply back to a client by sending to its reply channel.
    pub(crate) fn send_reply(
        &mut self,
        reply: ApiReply,
        client: ClientId,
    ) -> Result<(), PaxkvError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(PaxkvError::msg)?;
                Ok(())
            }
            None => logged_err!(
                self.me;
                "client ID {} not found among active clients",
                client
            ),
        }
    }
}

impl Drop for ExternalApi {
    /// Aborts the helper tasks so the API port is released on teardown.
    fn drop(&mut self) {
        self._client_acceptor_handle.abort();
        self._batch_ticker_handle.abort();
    }
}

/// ExternalApi client acceptor task.
struct ClientAcceptorTask {
    me: ReplicaId,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    client_listener: TcpListener,
    tx_replies:
        flashmap::WriteHandle<ClientId, mpsc::UnboundedSender<ApiReply>>,

    tx_exit: mpsc::UnboundedSender<ClientId>,
    rx_exit: mpsc::UnboundedReceiver<ClientId>,
}

impl ClientAcceptorTask {
    fn new(
        me: ReplicaId,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        client_listener: TcpListener,
        tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<ApiReply>,
        >,
    ) -> Self {
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();
        ClientAcceptorTask {
            me,
            tx_req,
            client_listener,
            tx_replies,
            tx_exit,
            rx_exit,
        }
    }

    /// Accepts a new client connection.
    async fn accept_new_client(
        &mut self,
        mut stream: TcpStream,
    ) -> Result<(), PaxkvError> {
        let id = match stream.read_u64().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving client ID: {}", e)
            }
        };

        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate client ID listened: {}", id);
        }
        pf_info!(self.me; "accepted new client {}", id);

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply);

        let mut servant = ClientServantTask::new(
            self.me,
            id,
            stream,
            self.tx_req.clone(),
            rx_reply,
            self.tx_exit.clone(),
        );
        tokio::spawn(async move { servant.run().await });

        tx_replies_guard.publish();
        Ok(())
    }

    /// Removes a disconnected client's reply channel.
    fn remove_left_client(&mut self, id: ClientId) -> Result<(), PaxkvError> {
        let mut tx_replies_guard = self.tx_replies.guard();
        if !tx_replies_guard.contains_key(&id) {
            return logged_err!(self.me; "client {} not found among active", id);
        }
        tx_replies_guard.remove(id);
        tx_replies_guard.publish();
        Ok(())
    }

    /// Starts the client acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_acceptor task spawned");

        loop {
            tokio::select! {
                // new client connection accepted
                accepted = self.client_listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            pf_warn!(self.me; "error accepting client: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.accept_new_client(stream).await {
                        pf_error!(self.me; "error accepting new client: {}", e);
                    }
                },

                // a client servant task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = self.remove_left_client(id) {
                        pf_error!(self.me; "error removing left client {}: {}",
                                           id, e);
                    }
                },
            }
        }
    }
}

/// ExternalApi per-client servant task.
struct ClientServantTask {
    me: ReplicaId,
    id: ClientId,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
    rx_reply: mpsc::UnboundedReceiver<ApiReply>,

    read_buf: BytesMut,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ClientId>,
}

impl ClientServantTask {
    fn new(
        me: ReplicaId,
        id: ClientId,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, ApiRequest)>,
        rx_reply: mpsc::UnboundedReceiver<ApiReply>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();
        ClientServantTask {
            me,
            id,
            conn_read,
            conn_write,
            tx_req,
            rx_reply,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Writes a reply through the TcpStream.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&ApiReply>,
    ) -> Result<bool, PaxkvError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }

    /// Reads a client request from the TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<ApiRequest, PaxkvError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-client servant task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "client_servant task for {} spawned", self.id);

        loop {
            tokio::select! {
                // select between getting a new reply to send back and
                // receiving a new client request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = self.rx_reply.recv(), if !self.retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {
                                    pf_trace!(self.me; "replied -> {} reply {:?}",
                                                       self.id, reply);
                                }
                                Ok(false) => {
                                    self.retrying = true;
                                }
                                Err(_e) => break, // connection gone
                            }
                        },
                        None => break, // channel closed, no replies remain
                    }
                },

                // retrying last unsuccessful reply send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_reply(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            self.retrying = false;
                        }
                        Ok(false) => {},
                        Err(_e) => break,
                    }
                },

                // receives a client request
                req = Self::read_req(&mut self.read_buf, &mut self.conn_read) => {
                    match req {
                        Ok(ApiRequest::Leave) => {
                            // client leaving, reply dummy and close
                            let _ = Self::write_reply(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&ApiReply::Leave),
                            );
                            pf_debug!(self.me; "client {} has left", self.id);
                            break;
                        },
                        Ok(req) => {
                            pf_trace!(self.me; "request <- {} req {:?}",
                                               self.id, req);
                            if let Err(e) = self.tx_req.send((self.id, req)) {
                                pf_error!(self.me; "error sending to tx_req \
                                                    for {}: {}", self.id, e);
                            }
                        },
                        Err(_e) => break, // client likely disconnected
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                               self.id, e);
        }
        pf_debug!(self.me; "client_servant task for {} exited", self.id);
    }
}

#[cfg(test)]
mod external_tests {
    use super::*;
    use crate::client::ClientApiStub;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn req_reply_api() -> Result<(), PaxkvError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        tokio::spawn(async move {
            // server side
            let mut api = ExternalApi::new_and_setup(
                0,
                "127.0.0.1:30210".parse()?,
                Duration::from_millis(1),
            )
            .await?;
            barrier2.wait().await;

            let mut reqs = VecDeque::new();
            while reqs.len() < 2 {
                let mut batch = api.get_req_batch().await?;
                reqs.append(&mut batch);
            }
            let client = reqs[0].0;
            assert_eq!(
                reqs.pop_front().unwrap().1,
                ApiRequest::Put {
                    row: "Jose".into(),
                    col: "col".into(),
                    new_value: "123".into(),
                    curr_value: "".into(),
                    option: 0,
                    request_id: "req-0".into(),
                    lock_id: "-".into(),
                }
            );
            assert_eq!(
                reqs.pop_front().unwrap().1,
                ApiRequest::Get {
                    row: "Jose".into(),
                    col: "col".into(),
                    request_id: "req-1".into(),
                    lock_id: "-".into(),
                }
            );
            api.send_reply(ApiReply::Put { success: true }, client)?;
            api.send_reply(
                ApiReply::Get {
                    success: true,
                    value: "123".into(),
                },
                client,
            )?;
            Ok::<(), PaxkvError>(())
        });

        // client side
        barrier.wait().await;
        let mut stub =
            ClientApiStub::new_by_connect(7, "127.0.0.1:30210".parse()?)
                .await?;
        stub.send_req(Some(&ApiRequest::Put {
            row: "Jose".into(),
            col: "col".into(),
            new_value: "123".into(),
            curr_value: "".into(),
            option: 0,
            request_id: "req-0".into(),
            lock_id: "-".into(),
        }))?;
        stub.send_req(Some(&ApiRequest::Get {
            row: "Jose".into(),
            col: "col".into(),
            request_id: "req-1".into(),
            lock_id: "-".into(),
        }))?;
        assert_eq!(
            stub.recv_reply().await?,
            ApiReply::Put { success: true }
        );
        assert_eq!(
            stub.recv_reply().await?,
            ApiReply::Get {
                success: true,
                value: "123".into()
            }
        );
        Ok(())
    }
}
