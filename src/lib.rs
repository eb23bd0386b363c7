//! # LSP Protocol
//!
//! **L**ive **S**equenced **P**rotocol
//!
//! LSP provides reliable, ordered, connection-oriented message delivery on
//! top of UDP. It provides:
//!
//! - **Reliability**: Every message is retransmitted until acknowledged
//! - **Ordering**: Messages are handed to the application in send order, once
//! - **Flow control**: A sliding window bounds unacknowledged messages
//! - **Liveness**: Heartbeats every epoch; silent peers are declared lost
//! - **Multiplexing**: One server socket serves any number of clients
//!
//! ## Feature Flags
//!
//! - `transport` (default): Messages, connection state machine, event loop, sockets
//! - `client` (default): [`client::LspClient`]
//! - `server` (default): [`server::LspServer`]
//!
//! ## Modules
//!
//! - [`core`]: Core traits, constants, parameters and error types (always included)
//! - [`transport`]: Transport layer (requires `transport` feature)
//! - [`client`]: Client endpoint (requires `client` feature)
//! - [`server`]: Server endpoint (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```no_run
//! use lsp_protocol::prelude::*;
//!
//! # async fn demo() -> LspResult<()> {
//! let params = Params::builder().window_size(4).epoch_millis(500).build()?;
//!
//! let server = LspServer::bind("127.0.0.1:0", params.clone()).await?;
//! let client = LspClient::connect(server.local_addr(), params).await?;
//!
//! client.write(b"hello".to_vec())?;
//! if let Some((conn_id, payload)) = server.read().await {
//!     server.write(conn_id, payload)?;
//! }
//! assert_eq!(client.read().await.as_deref(), Some(&b"hello"[..]));
//!
//! client.close().await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    // Core traits and types
    pub use crate::core::*;

    #[cfg(feature = "transport")]
    pub use crate::transport::{ConnId, ConnectionPhase, Message, MessageType, SeqNum};

    #[cfg(feature = "client")]
    pub use crate::client::LspClient;

    #[cfg(feature = "server")]
    pub use crate::server::LspServer;
}

// Re-export commonly used items at crate root
pub use crate::core::{LspError, LspResult, Params};

#[cfg(feature = "transport")]
pub use crate::transport::{ConnId, ConnectionPhase, Message};
