//! LSP Protocol - Client Library
//!
//! High-level API for LSP clients.

#[allow(clippy::module_inception)]
mod client;
mod handshake;

pub use client::*;
pub use handshake::*;
