//! Client API communication stub.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{ApiReply, ApiRequest};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, PaxkvError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client API connection stub over one TCP connection to one server.
pub struct ClientApiStub {
    /// My client ID.
    id: ClientId,

    /// Read-half of the connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half of the connection stream.
    conn_write: OwnedWriteHalf,

    /// Reply read buffer for cancellation safety.
    read_buf: BytesMut,

    /// Request write buffer for deadlock avoidance.
    write_buf: BytesMut,

    /// Write buffer cursor at first unwritten byte.
    write_buf_cursor: usize,
}

impl ClientApiStub {
    /// Connects to the given server address and identifies myself with my
    /// client ID.
    pub async fn new_by_connect(
        id: ClientId,
        addr: SocketAddr,
    ) -> Result<Self, PaxkvError> {
        pf_debug!(id; "connecting to server '{}'...", addr);
        let mut stream = tcp_connect_with_retry(addr, 3).await?;
        stream.write_u64(id).await?; // send my client ID

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientApiStub {
            id,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
        })
    }

    /// Sends a request to the established connection. Returns:
    ///   - `Ok(true)` if successful
    ///   - `Ok(false)` if the socket would block; the next calls must pass
    ///     `req == None` to retry until successful
    ///   - `Err(err)` if any unexpected error occurs
    pub fn send_req(
        &mut self,
        req: Option<&ApiRequest>,
    ) -> Result<bool, PaxkvError> {
        let sent = safe_tcp_write(
            &mut self.write_buf,
            &mut self.write_buf_cursor,
            &self.conn_write,
            req,
        )?;
        if !sent {
            pf_debug!(self.id; "send_req would block; TCP buffer full?");
        }
        Ok(sent)
    }

    /// Sends a request, spinning on the would-block path until the whole
    /// frame is out.
    pub fn send_req_retrying(
        &mut self,
        req: &ApiRequest,
    ) -> Result<(), PaxkvError> {
        let mut sent = self.send_req(Some(req))?;
        while !sent {
            sent = self.send_req(None)?;
        }
        Ok(())
    }

    /// Receives a reply from the established connection.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, PaxkvError> {
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}
