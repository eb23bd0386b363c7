//! LSP Protocol - Server Library
//!
//! High-level API for LSP servers.

#[allow(clippy::module_inception)]
mod server;
mod table;

pub use server::*;
