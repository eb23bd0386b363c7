//! Error types for the LSP protocol.

use std::io;

use thiserror::Error;

/// Errors that can occur while encoding or decoding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Datagram is shorter than the message header.
    #[error("message too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Unknown message kind byte.
    #[error("invalid message type: 0x{0:02x}")]
    InvalidType(u8),

    /// Header announces more payload than the datagram carries.
    #[error("payload truncated: header says {expected} bytes, but {actual} available")]
    PayloadTruncated {
        /// Payload length from the header.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Payload does not fit in the 16-bit size field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Connect and ack messages never carry a payload.
    #[error("unexpected payload of {0} bytes on a control message")]
    UnexpectedPayload(usize),
}

/// Invalid protocol parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Window size must allow at least one message in flight.
    #[error("window size must be at least 1")]
    ZeroWindow,

    /// Window size above the protocol limit.
    #[error("window size {size} exceeds the maximum of {max}")]
    WindowTooLarge {
        /// Requested window size.
        size: usize,
        /// Largest accepted window size.
        max: usize,
    },

    /// Epoch length must be non-zero.
    #[error("epoch length must be greater than zero")]
    ZeroEpoch,

    /// Epoch limit must be at least one epoch.
    #[error("epoch limit must be at least 1")]
    ZeroEpochLimit,

    /// The ready-to-read queue needs room for one message.
    #[error("read buffer must hold at least one message")]
    ZeroReadBuffer,
}

/// Top-level LSP errors.
#[derive(Debug, Error)]
pub enum LspError {
    /// The connection (or the whole endpoint) is closed, closing, or lost.
    #[error("connection closed")]
    ConnectionClosed,

    /// Payload exceeds the maximum message size.
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// Offered payload size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Host name did not resolve to any address.
    #[error("could not resolve address: {0}")]
    Resolve(String),

    /// Binding the local socket failed.
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// No connect acknowledgment within the epoch limit.
    #[error("connect timed out after {epochs} epochs")]
    ConnectTimeout {
        /// Epochs waited without an answer.
        epochs: u32,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for LSP operations.
pub type LspResult<T> = Result<T, LspError>;
