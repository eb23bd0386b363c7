//! High-level LSP client API.
//!
//! Provides [`LspClient`] for connecting to an LSP server and exchanging
//! reliable, in-order messages with it.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::handshake::handshake;
use crate::core::{DatagramTransport, LspResult, Params};
use crate::transport::{
    ConnId, Connection, ConnectionHandle, ConnectionPhase, Delivery, MessageSocket, MessageType,
    bind_udp, ephemeral_addr_for, recv_buffer, resolve, spawn_connection,
};

/// An LSP client with one connection to one server.
///
/// Every method takes `&self`; wrap the client in an
/// [`Arc`](std::sync::Arc) to read and write from different tasks.
///
/// # Example
///
/// ```no_run
/// use lsp_protocol::client::LspClient;
/// use lsp_protocol::core::Params;
///
/// # async fn demo() -> lsp_protocol::core::LspResult<()> {
/// let client = LspClient::connect("127.0.0.1:9999", Params::default()).await?;
/// client.write(b"hello".to_vec())?;
/// if let Some(reply) = client.read().await {
///     println!("{}", String::from_utf8_lossy(&reply));
/// }
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct LspClient<T = UdpSocket> {
    conn_id: ConnId,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    params: Params,
    handle: ConnectionHandle,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    transport: PhantomData<fn() -> T>,
}

impl LspClient<UdpSocket> {
    /// Connect to the server at `addr` from an ephemeral local port.
    ///
    /// Fails with [`LspError::ConnectTimeout`](crate::core::LspError::ConnectTimeout)
    /// if the server does not answer within `params.epoch_limit` epochs.
    pub async fn connect(addr: impl ToSocketAddrs, params: Params) -> LspResult<Self> {
        params.validate()?;
        let server_addr = resolve(addr).await?;
        let socket = bind_udp(ephemeral_addr_for(server_addr)).await?;
        Self::connect_with(socket, server_addr, params).await
    }
}

impl<T: DatagramTransport> LspClient<T> {
    /// Connect over an already bound transport.
    pub async fn connect_with(
        transport: T,
        server_addr: SocketAddr,
        params: Params,
    ) -> LspResult<Self> {
        params.validate()?;
        let local_addr = transport.local_addr()?;
        let socket = MessageSocket::new(transport);

        let conn_id = handshake(&socket, server_addr, &params).await?;
        info!(%conn_id, %server_addr, %local_addr, "connected");

        let (read_tx, read_rx) = mpsc::channel(params.read_buffer);
        let handle = spawn_connection(
            Connection::new(conn_id, server_addr, &params),
            socket.clone(),
            params.epoch(),
            read_tx,
            |conn_id, phase| match phase {
                ConnectionPhase::Lost => warn!(%conn_id, "connection lost"),
                _ => info!(%conn_id, ?phase, "connection finished"),
            },
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let receive_task = tokio::spawn(receive_loop(
            socket,
            server_addr,
            handle.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            conn_id,
            server_addr,
            local_addr,
            params,
            handle,
            read_rx: tokio::sync::Mutex::new(read_rx),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            receive_task: Mutex::new(Some(receive_task)),
            transport: PhantomData,
        })
    }

    /// Connection ID assigned by the server.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Address of the server.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Local address of the client's socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Parameters the connection runs with.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Current connection phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.handle.phase()
    }

    /// Wait for the next in-order payload from the server.
    ///
    /// Returns `None` once the connection is gone and everything it
    /// acknowledged has been read. Payloads that arrived before
    /// [`LspClient::close`] finished are still returned after it.
    pub async fn read(&self) -> Option<Vec<u8>> {
        let mut read_rx = self.read_rx.lock().await;
        read_rx.recv().await.map(|d| d.payload)
    }

    /// Queue `payload` for reliable, in-order delivery to the server.
    ///
    /// Never waits for the network.
    pub fn write(&self, payload: impl Into<Vec<u8>>) -> LspResult<()> {
        self.handle.write(payload.into())
    }

    /// Close the connection.
    ///
    /// Waits until every pending write has been acknowledged or the server
    /// is declared lost. Calling it again is a no-op.
    pub async fn close(&self) -> LspResult<()> {
        if self.handle.close().is_err() {
            trace!(conn_id = %self.conn_id, "connection already finished");
        }
        let phase = self.handle.terminated().await;

        self.stop_receiving();
        let receive_task = self
            .receive_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = receive_task {
            if let Err(e) = task.await {
                warn!(error = %e, "receive task failed");
            }
        }

        debug!(conn_id = %self.conn_id, ?phase, "client closed");
        Ok(())
    }

    fn stop_receiving(&self) {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
    }
}

/// Route datagrams from the server to the connection until it terminates.
async fn receive_loop<T: DatagramTransport>(
    socket: MessageSocket<T>,
    server_addr: SocketAddr,
    handle: ConnectionHandle,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let conn_id = handle.conn_id();
    let mut buf = recv_buffer();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = handle.terminated() => break,
            result = socket.recv(&mut buf) => match result {
                Ok((Ok(msg), from)) => {
                    if from != server_addr || msg.conn_id() != conn_id {
                        trace!(%msg, %from, "ignoring foreign datagram");
                    } else if msg.kind() == MessageType::Connect {
                        trace!(%msg, "ignoring connect");
                    } else {
                        handle.deliver(msg);
                    }
                }
                Ok((Err(e), from)) => trace!(%from, error = %e, "dropping malformed datagram"),
                Err(e) => {
                    warn!(%conn_id, error = %e, "socket read failed");
                    handle.abort();
                    break;
                }
            },
        }
    }

    debug!(%conn_id, "receive loop stopped");
}

impl<T> std::fmt::Debug for LspClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("conn_id", &self.conn_id)
            .field("server_addr", &self.server_addr)
            .field("local_addr", &self.local_addr)
            .field("phase", &self.handle.phase())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LspClient<T> {
    fn drop(&mut self) {
        let shutdown_tx = self
            .shutdown_tx
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LspError;
    use crate::transport::Message;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_params() -> Params {
        Params::builder()
            .epoch_millis(20)
            .epoch_limit(5)
            .build()
            .unwrap()
    }

    /// Minimal hand-driven server end.
    struct FakeServer {
        socket: MessageSocket<UdpSocket>,
    }

    impl FakeServer {
        async fn start() -> Self {
            Self {
                socket: MessageSocket::new(bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap()),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv(&self) -> (Message, SocketAddr) {
            let mut buf = recv_buffer();
            let (msg, from) = timeout(Duration::from_secs(5), self.socket.recv(&mut buf))
                .await
                .expect("timed out")
                .unwrap();
            (msg.unwrap(), from)
        }

        /// Answer the first connect request with `conn_id`.
        async fn accept(&self, conn_id: ConnId) -> SocketAddr {
            loop {
                let (msg, from) = self.recv().await;
                if msg.kind() == MessageType::Connect {
                    self.socket.send(&Message::ack(conn_id, 0), from).await;
                    return from;
                }
            }
        }

        /// Next data message, skipping heartbeats and retransmitted connects.
        async fn recv_data(&self) -> Message {
            loop {
                let (msg, _) = self.recv().await;
                if msg.kind() == MessageType::Data {
                    return msg;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_write() {
        let server = FakeServer::start().await;
        let server_addr = server.addr();
        let (client, peer) = tokio::join!(
            LspClient::connect(server_addr, test_params()),
            server.accept(ConnId::new(5)),
        );
        let client = client.unwrap();
        assert_eq!(client.conn_id(), ConnId::new(5));
        assert_eq!(client.server_addr(), server_addr);
        assert_eq!(client.local_addr().port(), peer.port());
        assert_eq!(client.phase(), ConnectionPhase::Active);

        client.write(b"hello".to_vec()).unwrap();
        let data = server.recv_data().await;
        assert_eq!(data, Message::data(ConnId::new(5), 1, b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_read_ignores_foreign_datagrams() {
        let server = FakeServer::start().await;
        let (client, peer) = tokio::join!(
            LspClient::connect(server.addr(), test_params()),
            server.accept(ConnId::new(5)),
        );
        let client = client.unwrap();

        // Wrong connection ID, then wrong sender.
        server
            .socket
            .send(&Message::data(ConnId::new(6), 1, b"nope".to_vec()), peer)
            .await;
        let stranger = FakeServer::start().await;
        stranger
            .socket
            .send(&Message::data(ConnId::new(5), 1, b"nope".to_vec()), peer)
            .await;
        server
            .socket
            .send(&Message::data(ConnId::new(5), 1, b"yes".to_vec()), peer)
            .await;

        let payload = timeout(Duration::from_secs(5), client.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"yes");
    }

    #[tokio::test]
    async fn test_oversized_write_is_rejected() {
        let server = FakeServer::start().await;
        let (client, _) = tokio::join!(
            LspClient::connect(server.addr(), test_params()),
            server.accept(ConnId::new(1)),
        );
        let client = client.unwrap();

        let err = client.write(vec![0u8; 5000]).unwrap_err();
        assert!(matches!(err, LspError::PayloadTooLarge { size: 5000, .. }));
    }

    #[tokio::test]
    async fn test_close_waits_for_ack() {
        let server = FakeServer::start().await;
        let (client, peer) = tokio::join!(
            LspClient::connect(server.addr(), test_params()),
            server.accept(ConnId::new(2)),
        );
        let client = client.unwrap();

        client.write(b"last words".to_vec()).unwrap();
        let data = server.recv_data().await;

        let closer = async {
            client.close().await.unwrap();
        };
        let acker = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(client.phase(), ConnectionPhase::Closing);
            server
                .socket
                .send(&Message::ack(ConnId::new(2), data.seq_num()), peer)
                .await;
        };
        timeout(Duration::from_secs(5), async { tokio::join!(closer, acker) })
            .await
            .unwrap();

        assert_eq!(client.phase(), ConnectionPhase::Closed);
        assert!(matches!(
            client.write(b"more".to_vec()),
            Err(LspError::ConnectionClosed)
        ));
        assert_eq!(client.read().await, None);
    }

    #[tokio::test]
    async fn test_read_after_close_returns_acked_data() {
        let server = FakeServer::start().await;
        let (client, peer) = tokio::join!(
            LspClient::connect(server.addr(), test_params()),
            server.accept(ConnId::new(4)),
        );
        let client = client.unwrap();

        server
            .socket
            .send(&Message::data(ConnId::new(4), 1, b"queued".to_vec()), peer)
            .await;
        loop {
            let (msg, _) = server.recv().await;
            if msg.kind() == MessageType::Ack && msg.seq_num() == 1 {
                break;
            }
        }

        timeout(Duration::from_secs(5), client.close())
            .await
            .unwrap()
            .unwrap();
        let first = timeout(Duration::from_secs(5), client.read()).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"queued"[..]));
        let second = timeout(Duration::from_secs(5), client.read()).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_silent_server_is_lost() {
        let server = FakeServer::start().await;
        let (client, _) = tokio::join!(
            LspClient::connect(server.addr(), test_params()),
            server.accept(ConnId::new(3)),
        );
        let client = client.unwrap();

        let payload = timeout(Duration::from_secs(5), client.read()).await.unwrap();
        assert_eq!(payload, None);
        assert_eq!(client.phase(), ConnectionPhase::Lost);
        assert!(client.write(b"x".to_vec()).is_err());
    }
}
