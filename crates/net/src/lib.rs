//! Peer-to-peer networking core of the emberd node.
//!
//! [`Network`] owns the listening socket, the connected-session table, the
//! in-memory ban table, and the persistent peer directory. Three long-lived
//! workers run concurrently: an acceptor for inbound connections, a
//! dialer/maintainer that keeps the connected set populated and the
//! directory fresh, and a syncer that pulls missing blocks whenever a peer
//! advertises a better chain. Every remote message is treated as untrusted:
//! misbehavior accumulates a per-peer score, and crossing the threshold
//! bans the address for a day.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use emberd_chain::ChainEngine;
use emberd_primitives::{Block, Transaction};
use emberd_storage::{KeyValueStore, StoreError};

pub mod directory;
mod manager;
mod peer_book;
pub mod session;
mod sync;
pub mod wire;

pub use directory::{PeerDirectory, PeerRecord};
pub use session::{CounterSnapshot, PeerSession};
pub use wire::InfoReply;

use peer_book::{unix_now, PeerTables};
use session::SessionContext;

/// Transport- or protocol-level failure of one session operation.
#[derive(Debug)]
pub enum NetworkError {
    /// The request timed out or the connect deadline passed.
    Timeout,
    /// The session is gone; the socket closed under us.
    Closed,
    /// The operating system failed the read or write.
    Io(String),
    /// The remote answered with something that does not parse as the
    /// expected reply. Scored harder than a mere transport error.
    Malformed(String),
    /// The remote violated the protocol (bad magic, oversized frame,
    /// explicit error reply).
    Protocol(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Timeout => write!(f, "request timed out"),
            NetworkError::Closed => write!(f, "session closed"),
            NetworkError::Io(message) => write!(f, "io error: {message}"),
            NetworkError::Malformed(message) => write!(f, "malformed message: {message}"),
            NetworkError::Protocol(message) => write!(f, "protocol error: {message}"),
        }
    }
}

impl std::error::Error for NetworkError {}

/// Fatal startup failure. These are the only errors that escape the core;
/// everything after startup is handled per-iteration inside the workers.
#[derive(Debug)]
pub enum StartupError {
    SeedFile(String),
    Bind(String),
    Store(StoreError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::SeedFile(message) => write!(f, "seed file error: {message}"),
            StartupError::Bind(message) => write!(f, "listener error: {message}"),
            StartupError::Store(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<StoreError> for StartupError {
    fn from(err: StoreError) -> Self {
        StartupError::Store(err)
    }
}

pub const DEFAULT_PORT: u16 = 8704;

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Local address the listener binds to; outbound sockets bind here too
    /// when it names a concrete interface.
    pub bind_addr: IpAddr,
    /// The network-wide port: we listen on it and dial peers on it.
    pub port: u16,
    /// Our own public address, filtered from dial candidates and inbound
    /// connections.
    pub public_addr: Option<IpAddr>,
    /// Software version advertised in handshakes; peers with a different
    /// major version are disconnected.
    pub version: String,
    /// One-address-per-line seed list; unreadable is a fatal startup error.
    pub seed_file: PathBuf,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Pause between dialer/maintainer iterations.
    pub short_sleep: Duration,
    /// Pause when the connection cap is reached or there is nothing to sync.
    pub long_sleep: Duration,
    /// Permits loopback peers for single-host regtest clusters.
    pub allow_loopback: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            public_addr: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            seed_file: PathBuf::from("peers.txt"),
            max_connections: peer_book::MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            short_sleep: Duration::from_millis(20),
            long_sleep: Duration::from_secs(20),
            allow_loopback: false,
        }
    }
}

/// State shared between the workers and the public surface.
pub(crate) struct Shared {
    pub tables: Mutex<PeerTables>,
    pub current_height: AtomicU64,
    pub best_height: AtomicU64,
    pub config: NetConfig,
}

impl Shared {
    fn new(config: NetConfig, tip_height: u64) -> Self {
        Self {
            tables: Mutex::new(PeerTables::default()),
            current_height: AtomicU64::new(tip_height),
            best_height: AtomicU64::new(tip_height),
            config,
        }
    }

    pub fn connections(&self) -> usize {
        self.tables
            .lock()
            .map(|tables| tables.connected.len())
            .unwrap_or(0)
    }

    pub fn connected_addrs(&self) -> Vec<String> {
        self.tables
            .lock()
            .map(|tables| tables.connected.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<(String, Arc<PeerSession>)> {
        self.tables
            .lock()
            .map(|tables| tables.sessions())
            .unwrap_or_default()
    }

    /// Connected peers advertising a chain above `height`.
    pub fn usable_peers(&self, height: u64) -> Vec<(String, Arc<PeerSession>)> {
        self.tables
            .lock()
            .map(|tables| {
                tables
                    .connected
                    .iter()
                    .filter(|(_, slot)| slot.record.height > height)
                    .map(|(addr, slot)| (addr.clone(), Arc::clone(&slot.session)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Scores a peer if it is still connected.
    pub fn penalize(&self, addr: &str, delta: u64) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.change_score(addr, delta, unix_now());
        }
    }

    pub fn record_of(&self, addr: &str) -> Option<PeerRecord> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.connected.get(addr).map(|slot| slot.record.clone()))
    }

    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::Relaxed)
    }

    pub fn current_height(&self) -> u64 {
        self.current_height.load(Ordering::Relaxed)
    }

    pub fn publish_current_height(&self, height: u64) {
        self.current_height.store(height, Ordering::Relaxed);
        // best height never trails the local tip
        self.best_height.fetch_max(height, Ordering::Relaxed);
    }

    pub fn recompute_best_height(&self) {
        let floor = self.current_height();
        if let Ok(tables) = self.tables.lock() {
            self.best_height
                .store(tables.best_height(floor), Ordering::Relaxed);
        }
    }
}

/// Shutdown was signalled, or the network handle is gone entirely.
pub(crate) fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

/// Sleeps for `duration` unless shutdown is signalled first.
pub(crate) async fn stoppable_sleep(duration: Duration, stop: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stop.changed() => {}
    }
}

/// Per-peer statistics as reported by [`Network::peer_stats`].
#[derive(Clone, Debug)]
pub struct PeerStats {
    pub version: String,
    pub height: u64,
    pub inbound: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests_in: u64,
    pub requests_out: u64,
}

pub struct Network<S> {
    shared: Arc<Shared>,
    directory: Arc<PeerDirectory<S>>,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: KeyValueStore + 'static> Network<S> {
    /// Seeds the directory, binds the listener, and spawns the three
    /// workers. The returned handle owns them; dropping it signals them to
    /// stop, but only [`Network::shutdown`] joins them and closes the
    /// remaining sessions.
    pub async fn start(
        config: NetConfig,
        store: Arc<S>,
        engine: Arc<dyn ChainEngine>,
    ) -> Result<Self, StartupError> {
        let directory = Arc::new(PeerDirectory::new(store));
        let seeded = directory.seed_from_file(&config.seed_file)?;
        if seeded > 0 {
            info!(
                "seeded {seeded} peers from {}",
                config.seed_file.display()
            );
        }

        let bind = SocketAddr::new(config.bind_addr, config.port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|err| StartupError::Bind(format!("could not bind to {bind}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| StartupError::Bind(err.to_string()))?;
        info!("listening on {local_addr}");

        let shared = Arc::new(Shared::new(config.clone(), engine.tip_height()));
        let ctx = SessionContext {
            engine: Arc::clone(&engine),
            shared: Arc::downgrade(&shared),
            version: config.version.clone(),
        };
        let (stop_tx, stop_rx) = watch::channel(false);

        let workers = vec![
            tokio::spawn(manager::accept_loop(
                listener,
                Arc::clone(&shared),
                Arc::clone(&directory),
                ctx.clone(),
                stop_rx.clone(),
            )),
            tokio::spawn(manager::maintain_loop(
                Arc::clone(&shared),
                Arc::clone(&directory),
                ctx,
                stop_rx.clone(),
            )),
            tokio::spawn(sync::sync_loop(Arc::clone(&shared), engine, stop_rx)),
        ];

        Ok(Self {
            shared,
            directory,
            local_addr,
            stop: stop_tx,
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn directory(&self) -> &PeerDirectory<S> {
        &self.directory
    }

    pub fn connections(&self) -> usize {
        self.shared.connections()
    }

    pub fn connected_peers(&self) -> BTreeSet<String> {
        self.shared.connected_addrs().into_iter().collect()
    }

    pub fn current_height(&self) -> u64 {
        self.shared.current_height()
    }

    pub fn best_height(&self) -> u64 {
        self.shared.best_height()
    }

    /// Fraction of the best advertised chain we hold locally.
    pub fn sync_progress(&self) -> f64 {
        let best = self.shared.best_height();
        if best == 0 {
            return 0.0;
        }
        (self.shared.current_height() as f64 / best as f64).min(1.0)
    }

    /// Addresses banned right now, with their expiry times.
    pub fn banned_peers(&self) -> Vec<(String, u64)> {
        let now = unix_now();
        self.shared
            .tables
            .lock()
            .map(|tables| {
                tables
                    .banned
                    .iter()
                    .filter(|(_, until)| **until > now)
                    .map(|(addr, until)| (addr.clone(), *until))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn peer_stats(&self) -> HashMap<String, PeerStats> {
        self.shared
            .tables
            .lock()
            .map(|tables| {
                tables
                    .connected
                    .iter()
                    .map(|(addr, slot)| {
                        let counters = slot.session.stats();
                        (
                            addr.clone(),
                            PeerStats {
                                version: slot.record.version.clone(),
                                height: slot.record.height,
                                inbound: slot.inbound,
                                bytes_in: counters.bytes_in,
                                bytes_out: counters.bytes_out,
                                requests_in: counters.requests_in,
                                requests_out: counters.requests_out,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fans a block out to every current session, tolerating per-peer
    /// failures. Works from a point-in-time snapshot of the connected set.
    pub async fn broadcast_block(&self, block: &Block) {
        for (addr, session) in self.shared.sessions() {
            if let Err(err) = session.send_block(block).await {
                warn!("failed to send block to {addr}: {err}");
            }
        }
    }

    pub async fn broadcast_transactions(&self, txs: &[Transaction]) {
        if txs.is_empty() {
            return;
        }
        for (addr, session) in self.shared.sessions() {
            if let Err(err) = session.send_transactions(txs).await {
                warn!("failed to send transactions to {addr}: {err}");
            }
        }
    }

    /// Cooperative shutdown: signals the workers, joins them, and closes
    /// every remaining session.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        let sessions: Vec<Arc<PeerSession>> = self
            .shared
            .tables
            .lock()
            .map(|mut tables| {
                tables
                    .connected
                    .drain()
                    .map(|(_, slot)| slot.session)
                    .collect()
            })
            .unwrap_or_default();
        for session in sessions {
            session.close().await;
        }
        info!("network stopped");
    }
}
