//! One framed session to one remote node.
//!
//! Requests multiplex over the single stream by id: the caller registers a
//! response slot, the reader task fulfills it when the matching response
//! frame arrives. The same reader serves the remote's requests from the
//! local engine and dispatches its block/transaction pushes, so a session
//! stays responsive while `get_info`/`get_blocks` calls are in flight.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use emberd_chain::ChainEngine;
use emberd_primitives::{Block, Transaction};

use crate::wire::{self, Envelope, InfoReply, Push, Reply, Request};
use crate::{NetConfig, NetworkError, Shared};

/// Longest block range a session will serve in one reply.
const MAX_BLOCKS_PER_REQUEST: u64 = 500;
/// Penalty for pushing a block the engine rejects as peer-attributable.
const BAD_BLOCK_SCORE: u64 = 50;

/// Everything the reader task needs to serve the remote side.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub engine: Arc<dyn ChainEngine>,
    pub shared: Weak<Shared>,
    pub version: String,
}

#[derive(Debug, Default)]
pub struct SessionCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    requests_in: AtomicU64,
    requests_out: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CounterSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests_in: u64,
    pub requests_out: u64,
}

impl SessionCounters {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            requests_in: self.requests_in.load(Ordering::Relaxed),
            requests_out: self.requests_out.load(Ordering::Relaxed),
        }
    }
}

pub struct PeerSession {
    addr: IpAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    // None once the reader has exited; late registrations fail fast
    pending: Mutex<Option<HashMap<u64, oneshot::Sender<serde_json::Value>>>>,
    next_request: AtomicU64,
    counters: SessionCounters,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl PeerSession {
    pub(crate) fn start(
        stream: TcpStream,
        addr: IpAddr,
        ctx: SessionContext,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            addr,
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(Some(HashMap::new())),
            next_request: AtomicU64::new(rand::random::<u32>() as u64),
            counters: SessionCounters::default(),
            reader: Mutex::new(None),
            request_timeout,
        });
        let handle = tokio::spawn(read_loop(Arc::clone(&session), read_half, ctx));
        if let Ok(mut reader) = session.reader.lock() {
            *reader = Some(handle);
        }
        session
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn addr_key(&self) -> String {
        self.addr.to_string()
    }

    pub fn stats(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub async fn get_info(&self) -> Result<InfoReply, NetworkError> {
        let body = self.request(Request::GetInfo).await?;
        wire::expect_info(body)
    }

    /// Blocks with heights in `lo..=hi` as served by the remote: newest
    /// first, possibly empty, possibly shorter than requested.
    pub async fn get_blocks(&self, lo: u64, hi: u64) -> Result<Vec<Block>, NetworkError> {
        let body = self.request(Request::GetBlocks { lo, hi }).await?;
        wire::expect_blocks(body)
    }

    pub async fn send_block(&self, block: &Block) -> Result<(), NetworkError> {
        let frame = wire::encode_frame(&Envelope::Push(Push::Block(block.clone())))?;
        self.send_frame(&frame).await
    }

    pub async fn send_transactions(&self, txs: &[Transaction]) -> Result<(), NetworkError> {
        let frame = wire::encode_frame(&Envelope::Push(Push::Transactions(txs.to_vec())))?;
        self.send_frame(&frame).await
    }

    /// Tears the session down: aborts the reader, shuts the socket down, and
    /// fails outstanding requests.
    pub(crate) async fn close(&self) {
        let handle = self.reader.lock().ok().and_then(|mut reader| reader.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.fail_pending();
    }

    async fn request(&self, body: Request) -> Result<serde_json::Value, NetworkError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| NetworkError::Closed)?;
            match pending.as_mut() {
                Some(map) => {
                    map.insert(id, tx);
                }
                None => return Err(NetworkError::Closed),
            }
        }

        let frame = wire::encode_frame(&Envelope::Request { id, body })?;
        if let Err(err) = self.send_frame(&frame).await {
            self.take_pending(id);
            return Err(err);
        }
        self.counters.requests_out.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(NetworkError::Closed),
            Err(_) => {
                self.take_pending(id);
                Err(NetworkError::Timeout)
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<(), NetworkError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame)
            .await
            .map_err(|err| NetworkError::Io(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| NetworkError::Io(err.to_string()))?;
        self.counters
            .bytes_out
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<serde_json::Value>> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.as_mut().and_then(|map| map.remove(&id)))
    }

    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            // dropping the senders wakes every waiter with Closed
            pending.take();
        }
    }
}

/// Dials `ip` on the network port and performs the `get_info` handshake.
/// The session is closed again if the handshake fails.
pub(crate) async fn dial_session(
    ip: IpAddr,
    config: &NetConfig,
    ctx: SessionContext,
) -> Result<(Arc<PeerSession>, InfoReply), NetworkError> {
    let target = SocketAddr::new(ip, config.port);
    let stream = tokio::time::timeout(config.connect_timeout, connect(target, config))
        .await
        .map_err(|_| NetworkError::Timeout)?
        .map_err(|err| NetworkError::Io(err.to_string()))?;

    let session = PeerSession::start(stream, ip, ctx, config.request_timeout);
    match session.get_info().await {
        Ok(info) => Ok((session, info)),
        Err(err) => {
            session.close().await;
            Err(err)
        }
    }
}

async fn connect(target: SocketAddr, config: &NetConfig) -> std::io::Result<TcpStream> {
    let bind_matches_family = match (config.bind_addr, target) {
        (IpAddr::V4(_), SocketAddr::V4(_)) => true,
        (IpAddr::V6(_), SocketAddr::V6(_)) => true,
        _ => false,
    };
    if config.bind_addr.is_unspecified() || !bind_matches_family {
        return TcpStream::connect(target).await;
    }
    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(config.bind_addr, 0))?;
    socket.connect(target).await
}

async fn read_loop(session: Arc<PeerSession>, mut reader: OwnedReadHalf, ctx: SessionContext) {
    loop {
        let envelope = match read_frame(&mut reader, &session.counters).await {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("session with {} ended: {err}", session.addr);
                break;
            }
        };
        match envelope {
            Envelope::Response { id, body } => match session.take_pending(id) {
                Some(tx) => {
                    let _ = tx.send(body);
                }
                None => debug!("{} sent an unsolicited response", session.addr),
            },
            Envelope::Request { id, body } => {
                session.counters.requests_in.fetch_add(1, Ordering::Relaxed);
                let reply = serve_request(&ctx, body);
                let body = match serde_json::to_value(&reply) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!("failed to encode reply for {}: {err}", session.addr);
                        break;
                    }
                };
                let frame = match wire::encode_frame(&Envelope::Response { id, body }) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("failed to frame reply for {}: {err}", session.addr);
                        break;
                    }
                };
                if session.send_frame(&frame).await.is_err() {
                    break;
                }
            }
            Envelope::Push(push) => handle_push(&ctx, session.as_ref(), push),
        }
    }
    session.fail_pending();
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    counters: &SessionCounters,
) -> Result<Envelope, NetworkError> {
    let mut header = [0u8; wire::FRAME_HEADER_BYTES];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| NetworkError::Io(err.to_string()))?;
    let length = wire::decode_header(&header)?;
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| NetworkError::Io(err.to_string()))?;
    counters
        .bytes_in
        .fetch_add((wire::FRAME_HEADER_BYTES + length) as u64, Ordering::Relaxed);
    wire::decode_envelope(&payload)
}

fn serve_request(ctx: &SessionContext, request: Request) -> Reply {
    match request {
        Request::GetInfo => {
            let peers = ctx
                .shared
                .upgrade()
                .map(|shared| shared.connected_addrs())
                .unwrap_or_default();
            Reply::Info(InfoReply {
                tip_height: ctx.engine.tip_height(),
                version: ctx.version.clone(),
                peers,
            })
        }
        Request::GetBlocks { lo, hi } => {
            if lo == 0 || hi < lo || hi - lo >= MAX_BLOCKS_PER_REQUEST {
                return Reply::Error("bad block range".to_string());
            }
            let mut blocks = ctx.engine.blocks_range(lo, hi);
            blocks.reverse(); // newest first on the wire
            Reply::Blocks(blocks)
        }
    }
}

fn handle_push(ctx: &SessionContext, session: &PeerSession, push: Push) {
    match push {
        Push::Block(block) => {
            let outcome = ctx.engine.submit_block(block);
            if outcome.misbehavior {
                if let Some(shared) = ctx.shared.upgrade() {
                    shared.penalize(&session.addr_key(), BAD_BLOCK_SCORE);
                }
            }
        }
        Push::Transactions(txs) => ctx.engine.submit_transactions(txs),
    }
}
