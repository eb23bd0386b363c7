//! Per-connection event loop.
//!
//! Each connection runs in its own task, which is the only code that touches
//! its [`Connection`]. Everything else talks to it through channels:
//!
//! - application commands (write, close) on an unbounded command channel
//! - messages routed by the endpoint on a bounded inbound channel
//! - in-order payloads leave through the endpoint's shared read queue
//!
//! The loop publishes its [`ConnectionPhase`] on a watch channel. Other tasks
//! may observe the phase but can only *request* transitions.
//!
//! After a graceful close the task lives on until every message that was
//! already acknowledged to the peer has been handed to the application, the
//! application queue is dropped, or the connection is aborted.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::connection::{Connection, ConnectionPhase};
use super::message::{ConnId, Message, SeqNum};
use super::socket::MessageSocket;
use crate::core::constants::{INBOUND_QUEUE_CAPACITY, MAX_PAYLOAD_SIZE};
use crate::core::{DatagramTransport, LspError, LspResult};

/// Requests sent to a connection's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Admit a payload for sending.
    Write(Vec<u8>),
    /// Begin a graceful close.
    Close,
    /// Give up on the connection immediately.
    Abort,
}

/// An in-order payload handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Connection the payload arrived on.
    pub conn_id: ConnId,
    /// Application bytes.
    pub payload: Vec<u8>,
}

/// Handle to a running connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: ConnId,
    commands: mpsc::UnboundedSender<Command>,
    inbound: mpsc::Sender<Message>,
    phase: watch::Receiver<ConnectionPhase>,
    delivered: watch::Receiver<SeqNum>,
}

impl ConnectionHandle {
    /// Connection identifier.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Most recently published phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Highest in-order sequence number received from the peer so far.
    pub fn last_delivered(&self) -> SeqNum {
        *self.delivered.borrow()
    }

    /// Queue a payload for reliable delivery.
    pub fn write(&self, payload: Vec<u8>) -> LspResult<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LspError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if !self.phase().accepts_writes() {
            return Err(LspError::ConnectionClosed);
        }
        self.commands
            .send(Command::Write(payload))
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Request a graceful close.
    pub fn close(&self) -> LspResult<()> {
        self.commands
            .send(Command::Close)
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Force the connection into [`ConnectionPhase::Lost`].
    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort);
    }

    /// Route a message from the peer to the loop.
    ///
    /// Returns `false` if it was dropped because the loop is gone or its
    /// queue is full.
    pub fn deliver(&self, msg: Message) -> bool {
        match self.inbound.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                trace!(conn_id = %self.conn_id, %msg, "inbound queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Wait until the connection reaches `Lost` or `Closed`.
    pub async fn terminated(&self) -> ConnectionPhase {
        let mut phase = self.phase.clone();
        let done = phase.wait_for(|p| p.is_terminal()).await.map(|p| *p);
        done.unwrap_or_else(|_| *phase.borrow())
    }
}

/// Start the event loop for `conn` on the current tokio runtime.
///
/// `on_exit` runs on the loop's task as soon as the connection reaches a
/// terminal phase and owed acknowledgments are flushed. A gracefully closed
/// connection then hands its remaining in-order messages to `app_tx`.
pub fn spawn_connection<T, F>(
    conn: Connection,
    socket: MessageSocket<T>,
    epoch: Duration,
    app_tx: mpsc::Sender<Delivery>,
    on_exit: F,
) -> ConnectionHandle
where
    T: DatagramTransport,
    F: FnOnce(ConnId, ConnectionPhase) + Send + 'static,
{
    let conn_id = conn.conn_id();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let (phase_tx, phase_rx) = watch::channel(conn.phase());
    let (delivered_tx, delivered_rx) = watch::channel(conn.last_delivered());
    let status = Status {
        phase: phase_tx,
        delivered: delivered_tx,
    };

    tokio::spawn(async move {
        let mut conn = run_connection(
            conn,
            socket,
            epoch,
            &mut command_rx,
            inbound_rx,
            &app_tx,
            status,
        )
        .await;
        on_exit(conn_id, conn.phase());
        flush_ready(&mut conn, &mut command_rx, &app_tx).await;
    });

    ConnectionHandle {
        conn_id,
        commands: command_tx,
        inbound: inbound_tx,
        phase: phase_rx,
        delivered: delivered_rx,
    }
}

/// Watch channels the loop publishes its progress on.
struct Status {
    phase: watch::Sender<ConnectionPhase>,
    delivered: watch::Sender<SeqNum>,
}

impl Status {
    fn publish(&self, conn: &Connection) {
        self.phase.send_if_modified(|phase| {
            let changed = *phase != conn.phase();
            *phase = conn.phase();
            changed
        });
        self.delivered.send_if_modified(|seq| {
            let changed = *seq != conn.last_delivered();
            *seq = conn.last_delivered();
            changed
        });
    }
}

/// Drive one connection until it reaches a terminal phase.
async fn run_connection<T: DatagramTransport>(
    mut conn: Connection,
    socket: MessageSocket<T>,
    epoch: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    mut inbound: mpsc::Receiver<Message>,
    app_tx: &mpsc::Sender<Delivery>,
    status: Status,
) -> Connection {
    let conn_id = conn.conn_id();
    let peer = conn.peer();
    let mut ticker = time::interval_at(Instant::now() + epoch, epoch);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commands_open = true;

    debug!(%conn_id, %peer, "connection started");

    loop {
        let outbound = conn.take_outbound();
        socket.send_all(&outbound, peer).await;
        status.publish(&conn);

        if conn.phase().is_terminal() {
            break;
        }

        tokio::select! {
            cmd = commands.recv(), if commands_open => match cmd {
                Some(Command::Write(payload)) => {
                    conn.admit_for_send(payload);
                }
                Some(Command::Close) => conn.request_close(),
                Some(Command::Abort) => conn.abort(),
                None => {
                    commands_open = false;
                    conn.request_close();
                }
            },
            _ = ticker.tick() => conn.on_epoch_tick(),
            Some(msg) = inbound.recv() => {
                trace!(%conn_id, %msg, "recv");
                conn.on_message(msg);
            }
            permit = app_tx.reserve(), if conn.has_ready() => match permit {
                Ok(permit) => {
                    if let Some(msg) = conn.pop_ready() {
                        permit.send(Delivery {
                            conn_id,
                            payload: msg.into_payload(),
                        });
                    }
                }
                Err(_) => {
                    // Nobody is reading any more; keep acking but stop queueing.
                    while conn.pop_ready().is_some() {}
                }
            },
        }
    }

    debug!(%conn_id, %peer, phase = ?conn.phase(), "connection finished");
    conn
}

/// Hand messages still waiting in a closed connection to the application.
///
/// Stops early when the application queue is dropped or on
/// [`Command::Abort`]. A dropped command channel does not stop it.
async fn flush_ready(
    conn: &mut Connection,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    app_tx: &mpsc::Sender<Delivery>,
) {
    let conn_id = conn.conn_id();
    let mut commands_open = true;

    while conn.has_ready() {
        tokio::select! {
            cmd = commands.recv(), if commands_open => match cmd {
                Some(Command::Abort) => {
                    debug!(%conn_id, "aborted with undelivered messages");
                    return;
                }
                Some(_) => {}
                None => commands_open = false,
            },
            permit = app_tx.reserve() => match permit {
                Ok(permit) => {
                    if let Some(msg) = conn.pop_ready() {
                        permit.send(Delivery {
                            conn_id,
                            payload: msg.into_payload(),
                        });
                    }
                }
                Err(_) => {
                    trace!(%conn_id, "reader gone, discarding undelivered messages");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Params;
    use crate::transport::message::MessageType;
    use std::future;
    use std::io;
    use std::net::SocketAddr;
    use tokio::sync::oneshot;

    /// Records every datagram sent; never receives anything.
    struct RecordingTransport {
        sent: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl DatagramTransport for RecordingTransport {
        async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            let _ = self.sent.send(buf.to_vec());
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            future::pending().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }
    }

    struct Harness {
        handle: ConnectionHandle,
        sent: mpsc::UnboundedReceiver<Vec<u8>>,
        app_rx: mpsc::Receiver<Delivery>,
        exited: oneshot::Receiver<ConnectionPhase>,
    }

    impl Harness {
        fn start(params: Params) -> Self {
            let (sent_tx, sent) = mpsc::unbounded_channel();
            let (app_tx, app_rx) = mpsc::channel(params.read_buffer);
            let (exit_tx, exited) = oneshot::channel();

            let conn = Connection::new(ConnId::new(9), "127.0.0.1:2".parse().unwrap(), &params);
            let socket = MessageSocket::new(RecordingTransport { sent: sent_tx });
            let handle = spawn_connection(conn, socket, params.epoch(), app_tx, move |_, phase| {
                let _ = exit_tx.send(phase);
            });

            Self {
                handle,
                sent,
                app_rx,
                exited,
            }
        }

        async fn next_sent(&mut self) -> (MessageType, u32) {
            let bytes = self.sent.recv().await.expect("transport dropped");
            let msg = Message::decode(&bytes).unwrap();
            (msg.kind(), msg.seq_num())
        }

        fn data(&self, seq: u32, payload: &[u8]) -> Message {
            Message::data(ConnId::new(9), seq, payload.to_vec())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_retransmit_each_epoch() {
        let mut h = Harness::start(Params::new(1, 100, 5));

        h.handle.write(b"a".to_vec()).unwrap();
        assert_eq!(h.next_sent().await, (MessageType::Data, 1));

        // Nothing acked: next epoch resends the data and a heartbeat.
        assert_eq!(h.next_sent().await, (MessageType::Data, 1));
        assert_eq!(h.next_sent().await, (MessageType::Ack, 0));

        h.handle.deliver(Message::ack(ConnId::new(9), 1));
        assert_eq!(h.next_sent().await, (MessageType::Ack, 0));
        assert_eq!(h.handle.phase(), ConnectionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reordered_data_delivered_in_order() {
        let mut h = Harness::start(Params::new(1, 100, 5));

        h.handle.deliver(h.data(2, b"second"));
        h.handle.deliver(h.data(1, b"first"));

        let first = h.app_rx.recv().await.unwrap();
        let second = h.app_rx.recv().await.unwrap();
        assert_eq!(first.payload, b"first");
        assert_eq!(second.payload, b"second");
        assert_eq!(first.conn_id, ConnId::new(9));

        assert_eq!(h.next_sent().await, (MessageType::Ack, 2));
        assert_eq!(h.next_sent().await, (MessageType::Ack, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_lost() {
        let h = Harness::start(Params::new(1, 100, 2));

        assert_eq!(h.handle.terminated().await, ConnectionPhase::Lost);
        assert_eq!(h.exited.await.unwrap(), ConnectionPhase::Lost);
        assert!(matches!(
            h.handle.write(b"x".to_vec()),
            Err(LspError::ConnectionClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_outstanding_ack() {
        let mut h = Harness::start(Params::new(1, 100, 50));

        h.handle.write(b"bye".to_vec()).unwrap();
        assert_eq!(h.next_sent().await, (MessageType::Data, 1));
        h.handle.close().unwrap();

        // Still retransmitting while closing.
        assert_eq!(h.next_sent().await, (MessageType::Data, 1));
        assert_eq!(h.handle.phase(), ConnectionPhase::Closing);
        assert!(matches!(
            h.handle.write(b"more".to_vec()),
            Err(LspError::ConnectionClosed)
        ));

        h.handle.deliver(Message::ack(ConnId::new(9), 1));
        assert_eq!(h.handle.terminated().await, ConnectionPhase::Closed);
        assert_eq!(h.exited.await.unwrap(), ConnectionPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_read_queue_does_not_block_acks() {
        let mut params = Params::new(1, 100, 50);
        params.read_buffer = 1;
        let mut h = Harness::start(params);

        for seq in 1..=3 {
            h.handle.deliver(h.data(seq, &[seq as u8]));
        }
        for seq in 1..=3 {
            assert_eq!(h.next_sent().await, (MessageType::Ack, seq));
        }

        // Close is honoured while deliveries are still pending, and nothing
        // that was acknowledged goes missing.
        h.handle.close().unwrap();
        assert_eq!(h.handle.terminated().await, ConnectionPhase::Closed);
        for seq in 1..=3u8 {
            assert_eq!(h.app_rx.recv().await.unwrap().payload, vec![seq]);
        }
        assert!(h.app_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_delivers_acknowledged_data() {
        // Close and delivery race inside the loop; run it enough times for
        // both orders to come up.
        for _ in 0..50 {
            let mut h = Harness::start(Params::new(1, 100, 50));

            h.handle.deliver(h.data(1, b"acked"));
            assert_eq!(h.next_sent().await, (MessageType::Ack, 1));
            h.handle.close().unwrap();

            assert_eq!(h.app_rx.recv().await.unwrap().payload, b"acked");
            assert!(h.app_rx.recv().await.is_none());
            assert_eq!(h.exited.await.unwrap(), ConnectionPhase::Closed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_flush_after_close() {
        let mut params = Params::new(1, 100, 50);
        params.read_buffer = 1;
        let mut h = Harness::start(params);

        for seq in 1..=3 {
            h.handle.deliver(h.data(seq, &[seq as u8]));
        }
        for seq in 1..=3 {
            assert_eq!(h.next_sent().await, (MessageType::Ack, seq));
        }
        h.handle.close().unwrap();
        assert_eq!(h.handle.terminated().await, ConnectionPhase::Closed);

        // The queue is full, so the flush is parked until the abort lands.
        h.handle.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.app_rx.recv().await.unwrap().payload, vec![1]);
        assert!(h.app_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_delivered_is_published() {
        let mut h = Harness::start(Params::new(1, 100, 50));
        assert_eq!(h.handle.last_delivered(), 0);

        h.handle.deliver(h.data(2, b"second"));
        assert_eq!(h.next_sent().await, (MessageType::Ack, 2));
        assert_eq!(h.handle.last_delivered(), 0);

        h.handle.deliver(h.data(1, b"first"));
        assert_eq!(h.next_sent().await, (MessageType::Ack, 1));
        assert_eq!(h.handle.last_delivered(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_write_rejected() {
        let h = Harness::start(Params::default());
        let err = h.handle.write(vec![0u8; MAX_PAYLOAD_SIZE + 1]).unwrap_err();
        assert!(matches!(err, LspError::PayloadTooLarge { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handles_close_connection() {
        let Harness { handle, exited, .. } = Harness::start(Params::new(1, 100, 50));
        drop(handle);
        assert_eq!(exited.await.unwrap(), ConnectionPhase::Closed);
    }
}
