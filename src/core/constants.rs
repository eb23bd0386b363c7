//! Protocol constants for LSP.
//!
//! Wire values in this module are fixed by the protocol and MUST NOT be
//! changed; the defaults may be overridden through [`Params`](super::Params).

use std::time::Duration;

// =============================================================================
// MESSAGE KINDS
// =============================================================================

/// Connection request (client -> server).
pub const MSG_TYPE_CONNECT: u8 = 0x00;

/// Sequenced data message.
pub const MSG_TYPE_DATA: u8 = 0x01;

/// Acknowledgment of a data message (or of a connect, with sequence 0).
pub const MSG_TYPE_ACK: u8 = 0x02;

// =============================================================================
// SEQUENCE NUMBERS
// =============================================================================

/// Sequence number carried by the connect handshake and by heartbeats.
pub const HANDSHAKE_SEQ_NUM: u32 = 0;

/// Sequence number of the first data message in each direction.
pub const FIRST_DATA_SEQ_NUM: u32 = 1;

/// Connection ID carried by a connect request (not yet assigned).
pub const UNASSIGNED_CONN_ID: u32 = 0;

/// First connection ID handed out by a server.
pub const FIRST_CONN_ID: u32 = 1;

// =============================================================================
// MESSAGE SIZES
// =============================================================================

/// Header size (kind + conn_id + seq_num + size).
pub const MESSAGE_HEADER_SIZE: usize = 1 + 4 + 4 + 2;

/// Largest payload accepted by `write`.
///
/// Keeps every datagram below common mobile path MTUs.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

/// Largest datagram an endpoint will attempt to receive.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

// =============================================================================
// DEFAULT PARAMETERS
// =============================================================================

/// Largest accepted sliding window size.
///
/// Also bounds how far ahead of the last in-order message a received
/// sequence number may be before it is dropped unacknowledged.
pub const MAX_WINDOW_SIZE: usize = 4096;

/// Default sliding window size (stop-and-wait).
pub const DEFAULT_WINDOW_SIZE: usize = 1;

/// Default epoch length.
pub const DEFAULT_EPOCH: Duration = Duration::from_millis(2000);

/// Default number of silent epochs before a peer is declared lost.
pub const DEFAULT_EPOCH_LIMIT: u32 = 5;

/// Default capacity of the application-facing ready-to-read queue.
pub const DEFAULT_READ_BUFFER: usize = 10;

/// Capacity of each connection's inbound message queue.
///
/// A full queue drops the datagram, which the protocol already tolerates as
/// network loss.
pub const INBOUND_QUEUE_CAPACITY: usize = 256;
