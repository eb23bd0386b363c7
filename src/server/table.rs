//! Server connection table.
//!
//! Maps connection IDs to running connections and peer addresses to
//! connection IDs. The table is plain data; the server keeps it behind a
//! single mutex and only ever holds that lock for lookup, insert and delete.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::core::constants::FIRST_CONN_ID;
use crate::transport::ConnId;

/// One registered connection.
#[derive(Debug)]
pub(crate) struct TableEntry<H> {
    /// Handle to the connection's task.
    pub handle: H,
    /// Peer address the connect request came from.
    pub peer: SocketAddr,
    /// Set once the application asked to close this connection.
    pub close_requested: bool,
}

/// Live connections of a server.
#[derive(Debug)]
pub(crate) struct ConnectionTable<H> {
    conns: HashMap<ConnId, TableEntry<H>>,
    by_addr: HashMap<SocketAddr, ConnId>,
    next_id: u32,
    closing: bool,
}

impl<H> ConnectionTable<H> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            by_addr: HashMap::new(),
            next_id: FIRST_CONN_ID,
            closing: false,
        }
    }

    /// Hand out the next connection ID. IDs are never reused.
    pub fn allocate_id(&mut self) -> ConnId {
        let id = ConnId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register a connection.
    pub fn insert(&mut self, conn_id: ConnId, peer: SocketAddr, handle: H) {
        self.by_addr.insert(peer, conn_id);
        self.conns.insert(
            conn_id,
            TableEntry {
                handle,
                peer,
                close_requested: false,
            },
        );
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn remove(&mut self, conn_id: ConnId) -> bool {
        match self.conns.remove(&conn_id) {
            Some(entry) => {
                if self.by_addr.get(&entry.peer) == Some(&conn_id) {
                    self.by_addr.remove(&entry.peer);
                }
                true
            }
            None => false,
        }
    }

    /// Look up a connection by ID.
    pub fn get(&self, conn_id: ConnId) -> Option<&TableEntry<H>> {
        self.conns.get(&conn_id)
    }

    /// Look up a connection by ID, mutably.
    pub fn get_mut(&mut self, conn_id: ConnId) -> Option<&mut TableEntry<H>> {
        self.conns.get_mut(&conn_id)
    }

    /// Connection already established from `peer`, if any.
    pub fn lookup_addr(&self, peer: SocketAddr) -> Option<ConnId> {
        self.by_addr.get(&peer).copied()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the server is shutting down.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Mark the server as closing and visit every live connection once.
    pub fn begin_close(&mut self, mut f: impl FnMut(&mut TableEntry<H>)) {
        self.closing = true;
        for entry in self.conns.values_mut() {
            entry.close_requested = true;
            f(entry);
        }
    }
}
