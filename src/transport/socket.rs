//! Datagram plumbing for LSP endpoints.
//!
//! [`MessageSocket`] wraps any [`DatagramTransport`] and speaks whole
//! [`Message`]s. It is cheap to clone: every connection task holds one for
//! sending while the endpoint's receive task reads from the same transport.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket, lookup_host};
use tracing::{trace, warn};

use super::message::Message;
use crate::core::constants::MAX_DATAGRAM_SIZE;
use crate::core::{CodecError, DatagramTransport, LspError, LspResult};

impl DatagramTransport for UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Resolve a host/port pair to the first matching socket address.
pub async fn resolve(target: impl ToSocketAddrs) -> LspResult<SocketAddr> {
    let mut addrs = lookup_host(target)
        .await
        .map_err(|e| LspError::Resolve(e.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| LspError::Resolve("no addresses found".to_string()))
}

/// Bind a UDP socket, reporting failures as [`LspError::Bind`].
pub async fn bind_udp(addr: SocketAddr) -> LspResult<UdpSocket> {
    UdpSocket::bind(addr).await.map_err(LspError::Bind)
}

/// Unspecified local address of the same family as `peer`, any port.
pub fn ephemeral_addr_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Message-level view of a shared datagram transport.
#[derive(Debug)]
pub struct MessageSocket<T> {
    transport: Arc<T>,
}

impl<T> Clone for MessageSocket<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: DatagramTransport> MessageSocket<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Local address of the underlying transport.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Send one message.
    ///
    /// Failures are logged and swallowed: to the protocol a failed send is
    /// indistinguishable from a lost datagram and is repaired the same way.
    pub async fn send(&self, msg: &Message, addr: SocketAddr) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%msg, error = %e, "dropping unencodable message");
                return;
            }
        };

        trace!(%msg, %addr, "send");
        if let Err(e) = self.transport.send_to(&bytes, addr).await {
            warn!(%msg, %addr, error = %e, "send failed");
        }
    }

    /// Send a batch of messages in order.
    pub async fn send_all(&self, msgs: &[Message], addr: SocketAddr) {
        for msg in msgs {
            self.send(msg, addr).await;
        }
    }

    /// Receive one datagram and decode it.
    ///
    /// The outer result carries transport failures; the inner one carries
    /// malformed datagrams, which callers drop.
    pub async fn recv(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(Result<Message, CodecError>, SocketAddr)> {
        let (len, addr) = self.transport.recv_from(buf).await?;
        Ok((Message::decode(&buf[..len]), addr))
    }
}

/// Allocate a receive buffer large enough for any datagram.
pub fn recv_buffer() -> Vec<u8> {
    vec![0u8; MAX_DATAGRAM_SIZE]
}
