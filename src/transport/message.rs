//! Message encoding and decoding for LSP.
//!
//! Every LSP datagram carries exactly one message. Wire format (11-byte
//! header, little endian):
//!
//! ```text
//! +--------+-------------+-------------+-------------+-----------------+
//! | Kind   | Conn ID     | Seq Num     | Size        | Payload         |
//! | 1 byte | 4 bytes LE  | 4 bytes LE  | 2 bytes LE  | Size bytes      |
//! +--------+-------------+-------------+-------------+-----------------+
//! ```

use std::fmt;

use crate::core::constants::{
    HANDSHAKE_SEQ_NUM, MESSAGE_HEADER_SIZE, MSG_TYPE_ACK, MSG_TYPE_CONNECT, MSG_TYPE_DATA,
    UNASSIGNED_CONN_ID,
};
use crate::core::CodecError;

/// Per-connection, per-direction sequence number.
pub type SeqNum = u32;

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Connection request.
    Connect = MSG_TYPE_CONNECT,
    /// Sequenced application payload.
    Data = MSG_TYPE_DATA,
    /// Acknowledgment.
    Ack = MSG_TYPE_ACK,
}

impl MessageType {
    /// Parse a message kind from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            MSG_TYPE_CONNECT => Some(Self::Connect),
            MSG_TYPE_DATA => Some(Self::Data),
            MSG_TYPE_ACK => Some(Self::Ack),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Connection identifier assigned by the server during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnId(u32);

impl ConnId {
    /// Create a connection ID from its raw value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The placeholder ID carried by connect requests.
    pub const fn unassigned() -> Self {
        Self(UNASSIGNED_CONN_ID)
    }

    /// Raw value.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ConnId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ConnId> for u32 {
    fn from(id: ConnId) -> u32 {
        id.0
    }
}

/// A single protocol message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    conn_id: ConnId,
    seq_num: SeqNum,
    payload: Vec<u8>,
}

impl Message {
    /// Connection request. Carries no ID and sequence 0.
    pub fn connect() -> Self {
        Self {
            kind: MessageType::Connect,
            conn_id: ConnId::unassigned(),
            seq_num: HANDSHAKE_SEQ_NUM,
            payload: Vec::new(),
        }
    }

    /// Data message.
    pub fn data(conn_id: ConnId, seq_num: SeqNum, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Data,
            conn_id,
            seq_num,
            payload,
        }
    }

    /// Acknowledgment of `seq_num`. Sequence 0 acknowledges the handshake
    /// and doubles as a heartbeat.
    pub fn ack(conn_id: ConnId, seq_num: SeqNum) -> Self {
        Self {
            kind: MessageType::Ack,
            conn_id,
            seq_num,
            payload: Vec::new(),
        }
    }

    /// Message kind.
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Connection the message belongs to.
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Sequence number.
    pub fn seq_num(&self) -> SeqNum {
        self.seq_num
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Consume the message, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }

    /// Serialize to a datagram.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let size = u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&self.conn_id.as_u32().to_le_bytes());
        buf.extend_from_slice(&self.seq_num.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a datagram.
    ///
    /// Bytes past the announced payload size are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(CodecError::TooShort {
                expected: MESSAGE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let kind = MessageType::from_byte(bytes[0]).ok_or(CodecError::InvalidType(bytes[0]))?;
        let conn_id = ConnId(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]));
        let seq_num = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let size = u16::from_le_bytes([bytes[9], bytes[10]]) as usize;

        let body = &bytes[MESSAGE_HEADER_SIZE..];
        if body.len() < size {
            return Err(CodecError::PayloadTruncated {
                expected: size,
                actual: body.len(),
            });
        }
        if kind != MessageType::Data && size != 0 {
            return Err(CodecError::UnexpectedPayload(size));
        }

        Ok(Self {
            kind,
            conn_id,
            seq_num,
            payload: body[..size].to_vec(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageType::Connect => write!(f, "[Connect {} {}]", self.conn_id, self.seq_num),
            MessageType::Data => write!(
                f,
                "[Data {} {} {}]",
                self.conn_id,
                self.seq_num,
                self.payload.len()
            ),
            MessageType::Ack => write!(f, "[Ack {} {}]", self.conn_id, self.seq_num),
        }
    }
}
