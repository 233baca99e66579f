//! Datagram transports.
//!
//! Everything the scheduler and the server connection table move packets
//! through implements [`DatagramConn`]: QUIC datagrams, a reliable QUIC
//! stream with length-prefixed framing, and the FEC-striped UDP transport.
//! The trait deliberately mirrors an unreliable datagram service; ordering
//! and retransmission belong to the IP traffic inside the tunnel.

pub mod quic;
pub mod stream;

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use quic::{dial_quic, listen_quic, QuicDatagramConn};
pub use stream::StreamConn;

/// One datagram-oriented tunnel transport.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    /// Send one IP packet. Non-blocking or briefly blocking; a failure
    /// marks the owning path down.
    async fn send_datagram(&self, pkt: &[u8]) -> Result<()>;

    /// Receive one IP packet, suspending until data arrives, the transport
    /// fails, or `cancel` fires (then `Error::Cancelled`).
    async fn recv_datagram(&self, cancel: &CancellationToken) -> Result<Bytes>;

    /// Close underlying sockets/streams. Must be idempotent and callable
    /// without holding any scheduler lock.
    fn close(&self);
}

/// Create a non-blocking UDP socket bound to `bind`, with address reuse so
/// rapid reconnects don't trip on lingering sockets.
pub fn create_udp_socket(bind: SocketAddr) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| crate::error::TransportError::SocketError(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| crate::error::TransportError::SocketError(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| crate::error::TransportError::SocketError(e.to_string()))?;
    socket
        .bind(&bind.into())
        .map_err(|e| crate::error::TransportError::BindFailed {
            addr: bind,
            reason: e.to_string(),
        })?;
    Ok(socket.into())
}
