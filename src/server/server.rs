//! High-level LSP server API.
//!
//! Provides [`LspServer`], which accepts connections from any number of
//! clients on one datagram socket and multiplexes their in-order payloads
//! into a single read queue.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::table::ConnectionTable;
use crate::core::constants::FIRST_DATA_SEQ_NUM;
use crate::core::{DatagramTransport, LspError, LspResult, Params};
use crate::transport::{
    ConnId, Connection, ConnectionHandle, ConnectionPhase, Delivery, Message, MessageSocket,
    MessageType, bind_udp, recv_buffer, resolve, spawn_connection,
};

/// State shared between the server value, its receive task and the exit
/// callbacks of its connections.
struct Shared<T> {
    socket: MessageSocket<T>,
    params: Params,
    table: Mutex<ConnectionTable<ConnectionHandle>>,
    read_tx: mpsc::Sender<Delivery>,
    live: watch::Sender<usize>,
    closing: watch::Sender<bool>,
}

impl<T: DatagramTransport> Shared<T> {
    fn table(&self) -> MutexGuard<'_, ConnectionTable<ConnectionHandle>> {
        // The table stays consistent even if a holder panicked.
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn on_datagram(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        match msg.kind() {
            MessageType::Connect => self.on_connect(from).await,
            MessageType::Data | MessageType::Ack => {
                let table = self.table();
                match table.get(msg.conn_id()) {
                    Some(entry) => {
                        entry.handle.deliver(msg);
                    }
                    None => trace!(%msg, %from, "no such connection, dropping"),
                }
            }
        }
    }

    async fn on_connect(self: &Arc<Self>, from: SocketAddr) {
        let conn_id = {
            let mut table = self.table();
            if table.is_closing() {
                debug!(%from, "closing, ignoring connect");
                return;
            }

            // Before any data arrives a repeated connect only means our ack
            // was lost. After that, the same address is a restarted client
            // that reused the port: it gets a fresh connection and the old
            // one is left to time out.
            let known = table.lookup_addr(from).and_then(|conn_id| {
                table
                    .get(conn_id)
                    .map(|entry| (conn_id, entry.handle.last_delivered()))
            });
            match known {
                Some((conn_id, last_delivered)) if last_delivered < FIRST_DATA_SEQ_NUM => {
                    debug!(%conn_id, %from, "duplicate connect");
                    conn_id
                }
                _ => {
                    if let Some((stale, _)) = known {
                        debug!(
                            conn_id = %stale,
                            %from,
                            "connect from a used address, replacing"
                        );
                    }
                    let conn_id = table.allocate_id();
                    let conn = Connection::new(conn_id, from, &self.params);
                    let weak = Arc::downgrade(self);
                    let handle = spawn_connection(
                        conn,
                        self.socket.clone(),
                        self.params.epoch(),
                        self.read_tx.clone(),
                        move |conn_id, phase| on_connection_exit(&weak, conn_id, phase),
                    );
                    table.insert(conn_id, from, handle);
                    self.live.send_replace(table.len());
                    info!(%conn_id, %from, "connection accepted");
                    conn_id
                }
            }
        };

        self.socket.send(&Message::ack(conn_id, 0), from).await;
    }

    fn abort_all(&self) {
        let mut table = self.table();
        table.begin_close(|entry| entry.handle.abort());
        self.closing.send_replace(true);
    }
}

fn on_connection_exit<T: DatagramTransport>(
    shared: &Weak<Shared<T>>,
    conn_id: ConnId,
    phase: ConnectionPhase,
) {
    match phase {
        ConnectionPhase::Lost => warn!(%conn_id, "connection lost"),
        _ => info!(%conn_id, ?phase, "connection finished"),
    }

    if let Some(shared) = shared.upgrade() {
        let mut table = shared.table();
        if table.remove(conn_id) {
            shared.live.send_replace(table.len());
        }
    }
}

async fn receive_loop<T: DatagramTransport>(
    shared: Arc<Shared<T>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut buf = recv_buffer();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            result = shared.socket.recv(&mut buf) => match result {
                Ok((Ok(msg), from)) => shared.on_datagram(msg, from).await,
                Ok((Err(e), from)) => trace!(%from, error = %e, "dropping malformed datagram"),
                Err(e) => {
                    warn!(error = %e, "socket read failed, aborting all connections");
                    shared.abort_all();
                    break;
                }
            },
        }
    }

    debug!("receive loop stopped");
}

/// LSP server.
///
/// Every method takes `&self`; wrap the server in an [`Arc`] to share it
/// between reader and writer tasks.
pub struct LspServer<T = UdpSocket> {
    shared: Arc<Shared<T>>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl LspServer<UdpSocket> {
    /// Bind a UDP socket on `addr` and start accepting connections.
    ///
    /// Port 0 picks an ephemeral port; see [`LspServer::local_addr`].
    pub async fn bind(addr: impl ToSocketAddrs, params: Params) -> LspResult<Self> {
        params.validate()?;
        let addr = resolve(addr).await?;
        let socket = bind_udp(addr).await?;
        Self::with_transport(socket, params)
    }
}

impl<T: DatagramTransport> LspServer<T> {
    /// Start a server on an already bound transport.
    pub fn with_transport(transport: T, params: Params) -> LspResult<Self> {
        params.validate()?;
        let local_addr = transport.local_addr()?;

        let (read_tx, read_rx) = mpsc::channel(params.read_buffer);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            socket: MessageSocket::new(transport),
            params,
            table: Mutex::new(ConnectionTable::new()),
            read_tx,
            live: watch::Sender::new(0),
            closing: watch::Sender::new(false),
        });

        let receive_task = tokio::spawn(receive_loop(Arc::clone(&shared), shutdown_rx));
        info!(%local_addr, "server listening");

        Ok(Self {
            shared,
            read_rx: tokio::sync::Mutex::new(read_rx),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            receive_task: Mutex::new(Some(receive_task)),
            local_addr,
        })
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Parameters every accepted connection runs with.
    pub fn params(&self) -> &Params {
        &self.shared.params
    }

    /// Wait for the next in-order payload from any client.
    ///
    /// Returns `None` once the server is closing.
    pub async fn read(&self) -> Option<(ConnId, Vec<u8>)> {
        let mut closing = self.shared.closing.subscribe();
        let mut read_rx = self.read_rx.lock().await;

        tokio::select! {
            biased;
            _ = closing.wait_for(|closing| *closing) => None,
            delivery = read_rx.recv() => delivery.map(|d| (d.conn_id, d.payload)),
        }
    }

    /// Queue `payload` for reliable, in-order delivery to `conn_id`.
    ///
    /// Never waits for the network. Fails if the connection does not exist,
    /// is closing or is lost, or if the payload is too large.
    pub fn write(&self, conn_id: ConnId, payload: impl Into<Vec<u8>>) -> LspResult<()> {
        let table = self.shared.table();
        if table.is_closing() {
            return Err(LspError::ConnectionClosed);
        }
        match table.get(conn_id) {
            Some(entry) if !entry.close_requested => entry.handle.write(payload.into()),
            _ => Err(LspError::ConnectionClosed),
        }
    }

    /// Close one connection gracefully.
    ///
    /// Returns immediately. Pending writes are still delivered; further
    /// writes to `conn_id` fail.
    pub fn close_conn(&self, conn_id: ConnId) -> LspResult<()> {
        let mut table = self.shared.table();
        let entry = table.get_mut(conn_id).ok_or(LspError::ConnectionClosed)?;
        entry.close_requested = true;
        debug!(%conn_id, "close requested");
        entry.handle.close()
    }

    /// Current phase of `conn_id`, or `None` once it has been removed.
    pub fn connection_phase(&self, conn_id: ConnId) -> Option<ConnectionPhase> {
        self.shared
            .table()
            .get(conn_id)
            .map(|entry| entry.handle.phase())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.table().len()
    }

    /// Close every connection and stop the server.
    ///
    /// Waits until each connection has delivered its pending writes or been
    /// declared lost. Pending and later [`LspServer::read`] calls return
    /// `None`. Calling it again is a no-op.
    pub async fn close(&self) -> LspResult<()> {
        {
            let mut table = self.shared.table();
            table.begin_close(|entry| {
                let _ = entry.handle.close();
            });
        }
        self.shared.closing.send_replace(true);
        info!(local_addr = %self.local_addr, "server closing");

        let mut live = self.shared.live.subscribe();
        let _ = live.wait_for(|count| *count == 0).await;

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

        info!(local_addr = %self.local_addr, "server closed");
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

impl<T> std::fmt::Debug for LspServer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspServer")
            .field("local_addr", &self.local_addr)
            .field("params", &self.shared.params)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LspServer<T> {
    fn drop(&mut self) {
        self.shared.closing.send_replace(true);
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
