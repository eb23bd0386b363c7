//! Connection state machine for the LSP transport layer.
//!
//! A [`Connection`] is pure protocol state for one peer: sequence numbers,
//! the sliding send window, retransmission bookkeeping and the reorder
//! buffer. It performs no I/O. Every operation that needs to put something on
//! the wire appends to an outbox which the owner drains with
//! [`Connection::take_outbound`].
//!
//! ```text
//!   admit_for_send ──► pending_send ──► slide_window / un_acked ──► wire
//!                                             │        ▲
//!                                  pending_resend ─────┘ (every epoch)
//!
//!   wire ──► pending_received ──► ready (contiguous, in order) ──► app
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;
use std::net::SocketAddr;

use tracing::{debug, trace};

use super::message::{ConnId, Message, MessageType, SeqNum};
use crate::core::constants::{FIRST_DATA_SEQ_NUM, HANDSHAKE_SEQ_NUM, MAX_WINDOW_SIZE};
use crate::core::Params;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Normal duplex operation.
    Active,
    /// Local close requested; draining outstanding data.
    Closing,
    /// Peer presumed dead (epoch limit exceeded).
    Lost,
    /// Graceful close completed.
    Closed,
}

impl ConnectionPhase {
    /// `Lost` and `Closed` are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionPhase::Lost | ConnectionPhase::Closed)
    }

    /// Whether new application payloads are accepted.
    pub fn accepts_writes(self) -> bool {
        self == ConnectionPhase::Active
    }
}

/// Reliable-delivery state for a single peer.
#[derive(Debug)]
pub struct Connection {
    conn_id: ConnId,
    peer: SocketAddr,
    phase: ConnectionPhase,
    window_size: usize,
    epoch_limit: u32,

    /// Sequence number for the next admitted payload.
    next_send_seq: SeqNum,
    /// Outstanding sequence numbers, oldest first. Never longer than `window_size`.
    slide_window: VecDeque<SeqNum>,
    /// Admitted messages waiting for room in the window.
    pending_send: VecDeque<Message>,
    /// Sent but not yet acknowledged.
    un_acked: BTreeSet<SeqNum>,
    /// Last transmitted copy of every unacknowledged message.
    pending_resend: BTreeMap<SeqNum, Message>,

    /// Highest contiguous sequence number handed towards the application.
    last_delivered: SeqNum,
    /// Out-of-order arrivals above `last_delivered + 1`.
    pending_received: BTreeMap<SeqNum, Message>,
    /// Contiguous messages waiting to be delivered.
    ready: VecDeque<Message>,
    /// Highest sequence number acknowledged to the peer.
    last_ack_owed: Option<SeqNum>,

    epochs_since_activity: u32,
    outbox: Vec<Message>,
}

impl Connection {
    /// Create an active connection.
    pub fn new(conn_id: ConnId, peer: SocketAddr, params: &Params) -> Self {
        Self {
            conn_id,
            peer,
            phase: ConnectionPhase::Active,
            window_size: params.window_size,
            epoch_limit: params.epoch_limit,

            next_send_seq: FIRST_DATA_SEQ_NUM,
            slide_window: VecDeque::with_capacity(params.window_size),
            pending_send: VecDeque::new(),
            un_acked: BTreeSet::new(),
            pending_resend: BTreeMap::new(),

            last_delivered: FIRST_DATA_SEQ_NUM - 1,
            pending_received: BTreeMap::new(),
            ready: VecDeque::new(),
            last_ack_owed: None,

            epochs_since_activity: 0,
            outbox: Vec::new(),
        }
    }

    /// Connection identifier.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Number of sequence numbers currently in the window.
    pub fn window_len(&self) -> usize {
        self.slide_window.len()
    }

    /// Number of sent but unacknowledged messages.
    pub fn unacked_len(&self) -> usize {
        self.un_acked.len()
    }

    /// Number of admitted messages still waiting for the window.
    pub fn pending_send_len(&self) -> usize {
        self.pending_send.len()
    }

    /// Number of out-of-order messages held for reassembly.
    pub fn pending_received_len(&self) -> usize {
        self.pending_received.len()
    }

    /// Highest contiguous sequence number received.
    pub fn last_delivered(&self) -> SeqNum {
        self.last_delivered
    }

    /// Sequence number the next admitted payload will get.
    pub fn next_send_seq(&self) -> SeqNum {
        self.next_send_seq
    }

    /// Consecutive epochs without hearing from the peer.
    pub fn epochs_since_activity(&self) -> u32 {
        self.epochs_since_activity
    }

    /// Whether there is anything left to send or to be acknowledged.
    pub fn has_outstanding(&self) -> bool {
        !self.un_acked.is_empty() || !self.pending_send.is_empty()
    }

    /// Whether an in-order message is waiting for the application.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Take the next in-order message for the application.
    pub fn pop_ready(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    /// Drain every message produced since the last call, in send order.
    pub fn take_outbound(&mut self) -> Vec<Message> {
        mem::take(&mut self.outbox)
    }

    /// Queue an application payload for sending.
    ///
    /// Returns `false` (the payload is dropped) unless the connection is
    /// [`ConnectionPhase::Active`].
    pub fn admit_for_send(&mut self, payload: Vec<u8>) -> bool {
        if !self.phase.accepts_writes() {
            trace!(conn_id = %self.conn_id, phase = ?self.phase, "dropping write");
            return false;
        }

        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        self.pending_send
            .push_back(Message::data(self.conn_id, seq, payload));
        self.slide_window_advance();
        true
    }

    /// Move queued messages into the window while there is room.
    pub fn slide_window_advance(&mut self) {
        if self.phase.is_terminal() {
            return;
        }

        while self.slide_window.len() < self.window_size {
            let Some(msg) = self.pending_send.pop_front() else {
                break;
            };
            let seq = msg.seq_num();
            self.slide_window.push_back(seq);
            self.un_acked.insert(seq);
            self.outbox.push(msg.clone());
            self.pending_resend.insert(seq, msg);
        }
    }

    /// Apply any message received from the peer.
    pub fn on_message(&mut self, msg: Message) {
        if self.phase.is_terminal() {
            return;
        }

        self.on_inbound_activity();
        match msg.kind() {
            MessageType::Ack => self.on_ack(msg.seq_num()),
            MessageType::Data => self.on_data_received(msg),
            // Retransmitted connect requests are answered by the endpoint.
            MessageType::Connect => {}
        }
    }

    /// Reset the liveness counter.
    pub fn on_inbound_activity(&mut self) {
        self.epochs_since_activity = 0;
    }

    /// Process an acknowledgment.
    ///
    /// The window front only moves when the front itself is acknowledged;
    /// acks for later entries are recorded and skipped over at that point.
    pub fn on_ack(&mut self, seq: SeqNum) {
        if self.phase.is_terminal() || seq == HANDSHAKE_SEQ_NUM {
            return;
        }

        if !self.un_acked.remove(&seq) {
            trace!(conn_id = %self.conn_id, seq, "ignoring stale ack");
            return;
        }
        self.pending_resend.remove(&seq);

        if self.slide_window.front() == Some(&seq) {
            while let Some(front) = self.slide_window.front() {
                if self.un_acked.contains(front) {
                    break;
                }
                self.slide_window.pop_front();
            }
            self.slide_window_advance();
        }

        self.maybe_finish_close();
    }

    /// Process a data message: acknowledge it and reassemble in order.
    ///
    /// Sequence numbers more than [`MAX_WINDOW_SIZE`] past the last in-order
    /// message cannot come from a conforming sender and are dropped without
    /// an acknowledgment.
    pub fn on_data_received(&mut self, msg: Message) {
        if self.phase.is_terminal() {
            return;
        }

        let seq = msg.seq_num();
        if u64::from(seq) > u64::from(self.last_delivered) + MAX_WINDOW_SIZE as u64 {
            trace!(
                conn_id = %self.conn_id,
                seq,
                last_delivered = self.last_delivered,
                "data beyond receive horizon"
            );
            return;
        }
        self.outbox.push(Message::ack(self.conn_id, seq));
        self.last_ack_owed = Some(self.last_ack_owed.map_or(seq, |owed| owed.max(seq)));

        if seq <= self.last_delivered {
            trace!(conn_id = %self.conn_id, seq, "duplicate data");
            return;
        }
        self.pending_received.entry(seq).or_insert(msg);

        while let Some(next) = self.pending_received.remove(&(self.last_delivered + 1)) {
            self.last_delivered += 1;
            self.ready.push_back(next);
        }
    }

    /// Advance the epoch clock.
    ///
    /// Either declares the peer lost or retransmits every unacknowledged
    /// message and the latest acknowledgment (a heartbeat Ack 0 if nothing
    /// has been received yet).
    pub fn on_epoch_tick(&mut self) {
        if self.phase.is_terminal() {
            return;
        }

        self.epochs_since_activity += 1;
        if self.epochs_since_activity > self.epoch_limit {
            debug!(
                conn_id = %self.conn_id,
                peer = %self.peer,
                epochs = self.epochs_since_activity,
                "peer silent past epoch limit"
            );
            self.mark_lost();
            return;
        }

        self.outbox.extend(self.pending_resend.values().cloned());
        let ack_seq = self.last_ack_owed.unwrap_or(HANDSHAKE_SEQ_NUM);
        self.outbox.push(Message::ack(self.conn_id, ack_seq));
    }

    /// Request a graceful close.
    pub fn request_close(&mut self) {
        if self.phase == ConnectionPhase::Active {
            debug!(
                conn_id = %self.conn_id,
                outstanding = self.un_acked.len() + self.pending_send.len(),
                "closing"
            );
            self.phase = ConnectionPhase::Closing;
            self.maybe_finish_close();
        }
    }

    /// Force the connection into [`ConnectionPhase::Lost`].
    pub fn abort(&mut self) {
        if !self.phase.is_terminal() {
            self.mark_lost();
        }
    }

    // `ready` survives a graceful close: its messages were already acked
    // to the peer and still belong to the application.
    fn maybe_finish_close(&mut self) {
        if self.phase == ConnectionPhase::Closing && !self.has_outstanding() {
            self.phase = ConnectionPhase::Closed;
            self.release_protocol_buffers();
        }
    }

    fn mark_lost(&mut self) {
        self.phase = ConnectionPhase::Lost;
        self.release_protocol_buffers();
        self.ready = VecDeque::new();
        self.outbox.retain(|msg| msg.kind() == MessageType::Ack);
    }

    fn release_protocol_buffers(&mut self) {
        self.slide_window = VecDeque::new();
        self.pending_send = VecDeque::new();
        self.un_acked = BTreeSet::new();
        self.pending_resend = BTreeMap::new();
        self.pending_received = BTreeMap::new();
    }
}
