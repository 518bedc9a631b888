//! Server internal TCP transport module.
//!
//! NOTE: In concept, all messages are sent through unstable communication
//! channels, and are retried if the sender did not receive an ACK in a
//! timely manner. Here, we use TCP to get the same effect of "every message
//! a sender wants to send will be retried until eventually delivered".

use std::fmt;
use std::net::SocketAddr;

use crate::server::ReplicaId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
    Bitmap, PaxkvError,
};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Peer-peer message wrapper type that includes leave notification variants.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
enum PeerMessage<Msg> {
    /// Normal protocol-specific message.
    Msg { msg: Msg },

    /// Server leave notification.
    Leave,

    /// Reply to leave notification.
    LeaveReply,
}

/// Server internal TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ReplicaId, PeerMessage<Msg>)>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends: flashmap::ReadHandle<
        ReplicaId,
        mpsc::UnboundedSender<PeerMessage<Msg>>,
    >,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ReplicaId, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<ReplicaId>,

    /// Map from peer ID -> peer messenger task join handles, shared with
    /// the peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<ReplicaId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new server internal TCP transport hub. Spawns the peer
    /// acceptor task and creates a recv channel for listening on peers'
    /// messages.
    pub(crate) async fn new_and_setup(
        me: ReplicaId,
        population: u8,
        p2p_addr: SocketAddr,
    ) -> Result<Self, PaxkvError> {
        if population <= me {
            return logged_err!(me; "invalid population {}", population);
        }

        let (tx_recv, rx_recv) =
            mpsc::unbounded_channel::<(ReplicaId, PeerMessage<Msg>)>();

        let (tx_sends_write, tx_sends_read) = flashmap::new::<
            ReplicaId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >();

        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<ReplicaId, JoinHandle<()>>();

        // the connect & connack channels are used to notify the peer
        // acceptor task to proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = PeerAcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            population,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer replica proactively, and spawns the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ReplicaId,
        peer_addr: SocketAddr,
    ) -> Result<(), PaxkvError> {
        self.tx_connect.send((id, peer_addr))?;
        match self.rx_connack.recv().await {
            Some(ack_id) if ack_id == id => Ok(()),
            Some(ack_id) => logged_err!(
                self.me;
                "peer ID mismatch: expected {}, got {}",
                id,
                ack_id
            ),
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Waits until enough peers have been connected to me to form a group
    /// of the specified size.
    pub(crate) async fn wait_for_group(
        &self,
        group: u8,
    ) -> Result<(), PaxkvError> {
        if group == 0 {
            return logged_err!(self.me; "invalid group size {}", group);
        }
        while self.current_peers()?.count() + 1 < group {
            time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Gets a bitmap where currently connected peers are set true.
    pub(crate) fn current_peers(&self) -> Result<Bitmap, PaxkvError> {
        let tx_sends_guard = self.tx_sends.guard();
        let mut peers = Bitmap::new(self.population, false);
        for &id in tx_sends_guard.keys() {
            if let Err(e) = peers.set(id, true) {
                return logged_err!(self.me; "error setting peer {}: {}", id, e);
            }
        }
        Ok(peers)
    }

    /// Sends a message to a specified peer by sending to the send channel.
    /// Messages to peers that are not currently connected are dropped.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: ReplicaId,
    ) -> Result<(), PaxkvError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            tx_send
                .send(PeerMessage::Msg { msg })
                .map_err(PaxkvError::msg)?;
        }
        Ok(())
    }

    /// Broadcasts a message to all currently connected peers. A peer whose
    /// messenger just went away is skipped; the rest still get the message.
    pub(crate) fn bcast_msg(&mut self, msg: Msg) -> Result<(), PaxkvError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            if tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(PeerMessage::Msg { msg: msg.clone() })
                .is_err()
            {
                pf_debug!(self.me; "dropping msg to left peer {}", peer);
            }
        }
        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ReplicaId, Msg), PaxkvError> {
        loop {
            match self.rx_recv.recv().await {
                Some((id, PeerMessage::Msg { msg })) => return Ok((id, msg)),
                Some((_, _)) => continue, // leave-related, ignore here
                None => {
                    return logged_err!(self.me; "recv channel has been closed")
                }
            }
        }
    }

    /// Broadcasts leave notifications to all peers.
    pub(crate) async fn leave(&mut self) -> Result<(), PaxkvError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(PeerMessage::Leave)
                .map_err(PaxkvError::msg)?;
        }
        Ok(())
    }
}

impl<Msg> Drop for TransportHub<Msg> {
    /// Aborts the acceptor task so the p2p port is released on teardown.
    fn drop(&mut self) {
        self._peer_acceptor_handle.abort();
    }
}

/// TransportHub peer acceptor task.
struct PeerAcceptorTask<Msg> {
    me: ReplicaId,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
    tx_sends: flashmap::WriteHandle<
        ReplicaId,
        mpsc::UnboundedSender<PeerMessage<Msg>>,
    >,

    peer_listener: TcpListener,
    peer_messenger_handles: flashmap::WriteHandle<ReplicaId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<ReplicaId>,

    tx_exit: mpsc::UnboundedSender<ReplicaId>,
    rx_exit: mpsc::UnboundedReceiver<ReplicaId>,
}

impl<Msg> PeerAcceptorTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn new(
        me: ReplicaId,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            ReplicaId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        peer_messenger_handles: flashmap::WriteHandle<
            ReplicaId,
            JoinHandle<()>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(ReplicaId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        // the exit channel gets notified about termination of peer
        // messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        PeerAcceptorTask {
            me,
            tx_recv,
            peer_listener,
            tx_sends,
            peer_messenger_handles,
            rx_connect,
            tx_connack,
            tx_exit,
            rx_exit,
        }
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: ReplicaId,
        conn_addr: SocketAddr,
    ) -> Result<(), PaxkvError> {
        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_u8(self.me).await?; // send my ID

        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate peer ID to connect: {}", id);
        }

        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        let mut messenger = PeerMessengerTask::new(
            self.me,
            id,
            conn_addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let peer_messenger_handle =
            tokio::spawn(async move { messenger.run().await });
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        peer_messenger_handles_guard.publish();
        tx_sends_guard.publish();

        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), PaxkvError> {
        let id = match stream.read_u8().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving peer ID: {}", e)
            }
        };

        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            return logged_err!(self.me; "duplicate peer ID listened: {}", id);
        }

        let mut tx_sends_guard = self.tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        let mut messenger = PeerMessengerTask::new(
            self.me,
            id,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let peer_messenger_handle =
            tokio::spawn(async move { messenger.run().await });
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        peer_messenger_handles_guard.publish();
        tx_sends_guard.publish();

        pf_debug!(self.me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a left peer connection.
    fn remove_left_peer(&mut self, id: ReplicaId) -> Result<(), PaxkvError> {
        let mut tx_sends_guard = self.tx_sends.guard();
        if !tx_sends_guard.contains_key(&id) {
            return logged_err!(self.me; "peer {} not found among connected", id);
        }
        tx_sends_guard.remove(id);

        let mut peer_messenger_handles_guard =
            self.peer_messenger_handles.guard();
        peer_messenger_handles_guard.remove(id);

        peer_messenger_handles_guard.publish();
        tx_sends_guard.publish();

        Ok(())
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    let (peer, conn_addr) = match to_connect {
                        Some(pair) => pair,
                        None => break, // channel closed, no messages remain
                    };
                    if let Err(e) = self.connect_new_peer(peer, conn_addr).await {
                        pf_error!(self.me; "error connecting to new peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!(self.me; "error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            pf_warn!(self.me; "error accepting peer: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.accept_new_peer(stream, addr).await {
                        pf_error!(self.me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = self.rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = self.remove_left_peer(id) {
                        pf_error!(self.me; "error removing left peer {}: {}",
                                           id, e);
                    }
                },
            }
        }
    }
}

/// TransportHub per-peer messenger task.
struct PeerMessengerTask<Msg> {
    me: ReplicaId,

    /// Corresponding peer's ID and address.
    id: ReplicaId,
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ReplicaId>,
}

impl<Msg> PeerMessengerTask<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    fn new(
        me: ReplicaId,
        id: ReplicaId,
        addr: SocketAddr,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
        tx_recv: mpsc::UnboundedSender<(ReplicaId, PeerMessage<Msg>)>,
        tx_exit: mpsc::UnboundedSender<ReplicaId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        PeerMessengerTask {
            me,
            id,
            addr,
            conn_read,
            conn_write,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            tx_recv,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Writes a message through the TcpStream.
    /// A non-method function to ease `tokio::select!` sharing.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&PeerMessage<Msg>>,
    ) -> Result<bool, PaxkvError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from the TcpStream.
    /// A non-method function to ease `tokio::select!` sharing.
    async fn read_msg(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<PeerMessage<Msg>, PaxkvError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_messenger task for {} '{}' spawned",
                           self.id, self.addr);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(PeerMessage::Leave) => {
                            // I decide to leave, notify peer
                            if Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&PeerMessage::Leave),
                            ).is_ok() {
                                pf_debug!(self.me; "sent leave -> {}", self.id);
                            }
                        },

                        Some(PeerMessage::LeaveReply) => {
                            pf_error!(self.me; "proactively sending LeaveReply");
                        },

                        Some(msg @ PeerMessage::Msg { .. }) => {
                            match Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    pf_debug!(self.me; "retrying msg send -> {}",
                                                       self.id);
                                    self.retrying = true;
                                }
                                Err(_e) => {
                                    // peer likely unreachable; messages are
                                    // best-effort at this layer
                                }
                            }
                        },

                        None => break, // channel closed, no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_msg(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me; "finished retrying send -> {}",
                                               self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(self.me; "still retrying send -> {}",
                                               self.id);
                        }
                        Err(_e) => {}
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(PeerMessage::Leave) => {
                            // peer is leaving, reply and break
                            if Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&PeerMessage::LeaveReply),
                            ).is_ok() {
                                pf_debug!(self.me; "peer {} has left", self.id);
                            }
                            break;
                        },

                        Ok(PeerMessage::LeaveReply) => {
                            // my leave notification is acked by peer, break
                            if let Err(e) = self.tx_recv.send(
                                (self.id, PeerMessage::LeaveReply),
                            ) {
                                pf_error!(self.me; "error sending to tx_recv \
                                                    for {}: {}", self.id, e);
                            }
                            break;
                        }

                        Ok(msg @ PeerMessage::Msg { .. }) => {
                            if let Err(e) = self.tx_recv.send((self.id, msg)) {
                                pf_error!(self.me; "error sending to tx_recv \
                                                    for {}: {}", self.id, e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                               self.id, e);
        }
        pf_debug!(self.me; "peer_messenger task for {} '{}' exited",
                           self.id, self.addr);
    }
}
