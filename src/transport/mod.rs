//! LSP Transport Layer
//!
//! Everything needed to run one reliable, ordered connection over datagrams:
//!
//! - **Message encoding/decoding**: [`Message`], [`MessageType`] and the wire format
//! - **Connection state machine**: [`Connection`] with sliding window, reorder
//!   buffer and epoch-driven retransmission
//! - **Event loop**: [`spawn_connection`] runs a connection in its own task
//!   behind a [`ConnectionHandle`]
//! - **Async sockets**: [`MessageSocket`] over any [`DatagramTransport`](crate::core::DatagramTransport)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Client / Server                 │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   messages, window, epochs, tasks       │
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod event_loop;
mod message;
mod socket;

pub use connection::*;
pub use event_loop::*;
pub use message::*;
pub use socket::*;
