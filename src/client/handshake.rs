//! Client connection setup.
//!
//! The client sends a connect request and repeats it once per epoch until the
//! server answers with `Ack(conn_id, 0)`. The answer may be lost, and so may
//! the request, so either side simply retries.

use std::net::SocketAddr;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace};

use crate::core::{DatagramTransport, LspError, LspResult, Params};
use crate::transport::{ConnId, Message, MessageSocket, MessageType, recv_buffer};

/// Whether `msg` from `from` completes a handshake with `server_addr`.
fn accepts(msg: &Message, from: SocketAddr, server_addr: SocketAddr) -> bool {
    from == server_addr
        && msg.kind() == MessageType::Ack
        && msg.seq_num() == 0
        && msg.conn_id() != ConnId::unassigned()
}

/// Establish a connection with the server at `server_addr`.
///
/// Gives up with [`LspError::ConnectTimeout`] after more than
/// `params.epoch_limit` epochs without an answer.
#[instrument(skip(socket, params), fields(epoch_millis = params.epoch_millis))]
pub async fn handshake<T: DatagramTransport>(
    socket: &MessageSocket<T>,
    server_addr: SocketAddr,
    params: &Params,
) -> LspResult<ConnId> {
    let connect = Message::connect();
    let epoch = params.epoch();
    let mut buf = recv_buffer();
    let mut ticker = time::interval_at(Instant::now() + epoch, epoch);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut silent_epochs = 0u32;

    socket.send(&connect, server_addr).await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                silent_epochs += 1;
                if silent_epochs > params.epoch_limit {
                    debug!(silent_epochs, "server never answered");
                    return Err(LspError::ConnectTimeout { epochs: silent_epochs });
                }
                trace!(silent_epochs, "resending connect");
                socket.send(&connect, server_addr).await;
            }
            result = socket.recv(&mut buf) => match result? {
                (Ok(msg), from) if accepts(&msg, from, server_addr) => {
                    debug!(conn_id = %msg.conn_id(), "connected");
                    return Ok(msg.conn_id());
                }
                (Ok(msg), from) => trace!(%msg, %from, "ignoring datagram during handshake"),
                (Err(e), from) => trace!(%from, error = %e, "dropping malformed datagram"),
            },
        }
    }
}
