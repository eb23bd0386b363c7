//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsp_protocol::client::LspClient;
use lsp_protocol::core::{DatagramTransport, Params};
use lsp_protocol::server::LspServer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// Install a test-friendly subscriber. Set `RUST_LOG=lsp_protocol=trace` to
/// watch a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parameters with short epochs so tests finish quickly.
pub fn fast_params(window_size: usize) -> Params {
    Params::builder()
        .window_size(window_size)
        .epoch_millis(30)
        .epoch_limit(10)
        .build()
        .unwrap()
}

/// Bind a socket to an OS-assigned port on loopback.
pub async fn ephemeral() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind failed")
}

/// How a [`FaultyTransport`] mistreats outgoing datagrams.
#[derive(Debug, Clone, Copy)]
pub struct Faults {
    /// Probability a datagram is silently dropped.
    pub loss: f64,
    /// Probability a datagram is sent twice.
    pub duplicate: f64,
    /// Probability a datagram is held back for a while.
    pub delay: f64,
    /// Upper bound for held-back datagrams.
    pub max_delay: Duration,
}

impl Faults {
    /// A well-behaved network.
    pub fn none() -> Self {
        Self {
            loss: 0.0,
            duplicate: 0.0,
            delay: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Loss, duplication and reordering at once.
    pub fn hostile() -> Self {
        Self {
            loss: 0.2,
            duplicate: 0.1,
            delay: 0.2,
            max_delay: Duration::from_millis(40),
        }
    }
}

enum Fate {
    Drop,
    Send { copies: usize },
    Delay(Duration),
}

/// UDP socket that loses, duplicates and reorders what it sends.
///
/// Randomness comes from a seeded [`StdRng`] so a failing run can be
/// replayed.
pub struct FaultyTransport {
    socket: Arc<UdpSocket>,
    faults: Faults,
    rng: Mutex<StdRng>,
}

impl FaultyTransport {
    pub fn new(socket: UdpSocket, faults: Faults, seed: u64) -> Self {
        Self {
            socket: Arc::new(socket),
            faults,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn decide(&self) -> Fate {
        let mut rng = self.rng.lock().unwrap();
        if rng.gen_bool(self.faults.loss) {
            Fate::Drop
        } else if rng.gen_bool(self.faults.delay) {
            let millis = self.faults.max_delay.as_millis().max(1) as u64;
            Fate::Delay(Duration::from_millis(rng.gen_range(1..=millis)))
        } else if rng.gen_bool(self.faults.duplicate) {
            Fate::Send { copies: 2 }
        } else {
            Fate::Send { copies: 1 }
        }
    }
}

impl DatagramTransport for FaultyTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.decide() {
            Fate::Drop => Ok(buf.len()),
            Fate::Send { copies } => {
                for _ in 0..copies {
                    self.socket.send_to(buf, addr).await?;
                }
                Ok(buf.len())
            }
            Fate::Delay(delay) => {
                let socket = Arc::clone(&self.socket);
                let datagram = buf.to_vec();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = socket.send_to(&datagram, addr).await;
                });
                Ok(buf.len())
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Server whose outgoing datagrams suffer `faults`.
pub async fn faulty_server(
    faults: Faults,
    seed: u64,
    params: Params,
) -> LspServer<FaultyTransport> {
    let transport = FaultyTransport::new(ephemeral().await, faults, seed);
    LspServer::with_transport(transport, params).expect("server start")
}

/// Client whose outgoing datagrams suffer `faults`.
pub async fn faulty_client(
    server_addr: SocketAddr,
    faults: Faults,
    seed: u64,
    params: Params,
) -> LspClient<FaultyTransport> {
    let transport = FaultyTransport::new(ephemeral().await, faults, seed);
    LspClient::connect_with(transport, server_addr, params)
        .await
        .expect("connect")
}

/// UDP socket whose reads can be made to fail on demand.
pub struct BreakableTransport {
    socket: UdpSocket,
    broken: Arc<Notify>,
}

/// Trigger for a [`BreakableTransport`] that has been handed to an endpoint.
#[derive(Clone)]
pub struct Breaker(Arc<Notify>);

impl Breaker {
    /// Fail the pending (or next) `recv_from` with an I/O error.
    pub fn break_reads(&self) {
        self.0.notify_one();
    }
}

impl BreakableTransport {
    pub fn new(socket: UdpSocket) -> (Self, Breaker) {
        let broken = Arc::new(Notify::new());
        let breaker = Breaker(Arc::clone(&broken));
        (Self { socket, broken }, breaker)
    }
}

impl DatagramTransport for BreakableTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::select! {
            _ = self.broken.notified() => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "socket broken",
            )),
            result = self.socket.recv_from(buf) => result,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
