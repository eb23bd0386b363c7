//! Core traits for LSP.
//!
//! The protocol engine only needs an unreliable datagram service; anything
//! that can send and receive whole datagrams can carry LSP.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

/// Unreliable, unordered datagram transport.
///
/// # Requirements
///
/// - `send_to` MUST write the buffer as one datagram (or not at all)
/// - `recv_from` MUST return exactly one datagram per call
/// - implementations MUST tolerate concurrent `send_to` calls from many tasks
///   while one task is parked in `recv_from`
///
/// Loss, duplication and reordering are all permitted; recovering from them
/// is the protocol's job.
///
/// # Example
///
/// ```ignore
/// struct Loopback { inner: tokio::net::UdpSocket }
///
/// impl DatagramTransport for Loopback {
///     async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
///         self.inner.send_to(buf, addr).await
///     }
///
///     async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
///         self.inner.recv_from(buf).await
///     }
///
///     fn local_addr(&self) -> io::Result<SocketAddr> {
///         self.inner.local_addr()
///     }
/// }
/// ```
pub trait DatagramTransport: Send + Sync + 'static {
    /// Send one datagram to `addr`.
    fn send_to(
        &self,
        buf: &[u8],
        addr: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive one datagram, returning its length and sender.
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Local address the transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
