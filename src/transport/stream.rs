//! Reliable-mode framing.
//!
//! In `transport_mode: reliable` each path carries its packets over one
//! bidirectional QUIC stream as `[u16 len][payload]` frames instead of
//! datagrams. The send side is serialized by a lock so the length prefix
//! and payload always land contiguously on the wire.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, TransportError};

/// Largest frame the 2-byte length prefix can describe.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// A bidirectional QUIC stream presenting the datagram interface.
pub struct StreamConn {
    connection: quinn::Connection,
    send: Mutex<quinn::SendStream>,
    recv: Mutex<quinn::RecvStream>,
}

impl StreamConn {
    pub fn new(
        connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Self {
        Self {
            connection,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
        }
    }

    /// Client side: open the tunnel stream on a fresh connection.
    pub async fn open(connection: quinn::Connection) -> Result<Self> {
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok(Self::new(connection, send, recv))
    }

    /// Server side: accept the tunnel stream the client opens.
    pub async fn accept(connection: quinn::Connection) -> Result<Self> {
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        Ok(Self::new(connection, send, recv))
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }
}

#[async_trait]
impl super::DatagramConn for StreamConn {
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()> {
        if pkt.len() > MAX_FRAME {
            return Err(TransportError::MtuExceeded {
                size: pkt.len(),
                max: MAX_FRAME,
            }
            .into());
        }
        // Hold the lock across both writes: frames must not interleave.
        let mut send = self.send.lock().await;
        send.write_all(&(pkt.len() as u16).to_be_bytes())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        send.write_all(pkt)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let mut recv = self.recv.lock().await;
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            frame = read_frame(&mut recv) => frame,
        }
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"shutdown");
    }
}

async fn read_frame(recv: &mut quinn::RecvStream) -> Result<Bytes> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut payload = vec![0u8; len];
    recv.read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
    Ok(Bytes::from(payload))
}
