//! Connection manager: the inbound acceptor and the dialer/maintainer.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use emberd_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::directory::{stage_record, PeerDirectory, PeerRecord};
use crate::peer_book::{
    canonical_peer_ip, dial_cooloff_active, is_filtered_address, major_version, unix_now, PeerSlot,
};
use crate::session::{dial_session, PeerSession, SessionContext};
use crate::wire::InfoReply;
use crate::{stop_requested, stoppable_sleep, NetworkError, Shared};

/// Penalty for a structurally malformed info reply.
const MALFORMED_INFO_SCORE: u64 = 50;
/// Penalty for gossiping a syntactically invalid address.
const INVALID_GOSSIP_SCORE: u64 = 10;

/// Accepts inbound connections, applying the same filters as the dialer,
/// and inserts handshaken sessions into the connected table.
pub(crate) async fn accept_loop<S: KeyValueStore + 'static>(
    listener: TcpListener,
    shared: Arc<Shared>,
    directory: Arc<PeerDirectory<S>>,
    ctx: SessionContext,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            },
        };
        if *stop.borrow() {
            break;
        }

        let ip = remote.ip();
        let key = ip.to_string();
        {
            let Ok(tables) = shared.tables.lock() else {
                continue;
            };
            if tables.connected.contains_key(&key) {
                info!("incoming connection duplicates existing connection for {key}");
                continue;
            }
            if tables.is_banned(&key, unix_now()) {
                info!("incoming connection from {key} is banned");
                continue;
            }
        }
        if is_filtered_address(&ip, &shared.config) {
            info!("incoming connection from {key} is connecting to self");
            continue;
        }

        info!("peer connected from {remote}");
        let session = PeerSession::start(stream, ip, ctx.clone(), shared.config.request_timeout);
        let info = match session.get_info().await {
            Ok(info) => info,
            Err(err) => {
                warn!("failed to get information from connecting peer {key}: {err}");
                session.close().await;
                continue;
            }
        };

        let record = PeerRecord {
            last_seen: unix_now(),
            last_attempt: 0,
            height: info.tip_height,
            version: info.version,
            score: 0,
        };
        let inserted = insert_session(&shared, &key, Arc::clone(&session), record.clone(), true);
        if !inserted {
            session.close().await;
            continue;
        }
        if let Err(err) = directory.upsert(&key, &record) {
            warn!("failed to persist peer record for {key}: {err}");
        }
    }
}

/// One dial attempt plus a maintenance pass per iteration, then a short or
/// long sleep. All directory writes of an iteration commit as one batch.
pub(crate) async fn maintain_loop<S: KeyValueStore + 'static>(
    shared: Arc<Shared>,
    directory: Arc<PeerDirectory<S>>,
    ctx: SessionContext,
    mut stop: watch::Receiver<bool>,
) {
    while !stop_requested(&stop) {
        let mut batch = WriteBatch::new();

        let mut cap_reached = false;
        match dial_step(&shared, &directory, &ctx, &mut batch).await {
            Ok(reached) => cap_reached = reached,
            Err(err) => warn!("peer directory scan failed: {err}"),
        }

        if let Err(err) = maintenance_pass(&shared, &directory, &mut batch).await {
            warn!("maintenance pass failed: {err}");
        }

        if let Err(err) = directory.commit(batch) {
            warn!("failed to commit peer directory updates: {err}");
        }

        if cap_reached {
            stoppable_sleep(shared.config.long_sleep, &mut stop).await;
        } else {
            stoppable_sleep(shared.config.short_sleep, &mut stop).await;
        }
    }
}

/// Scans the directory for the first dialable candidate and attempts it.
/// Returns true when the connection cap made dialing pointless.
async fn dial_step<S: KeyValueStore>(
    shared: &Arc<Shared>,
    directory: &PeerDirectory<S>,
    ctx: &SessionContext,
    batch: &mut WriteBatch,
) -> Result<bool, StoreError> {
    if shared.connections() >= shared.config.max_connections {
        return Ok(true);
    }

    for (addr, mut record) in directory.entries()? {
        let Some(ip) = canonical_peer_ip(&addr) else {
            continue;
        };
        if is_filtered_address(&ip, &shared.config) {
            continue;
        }
        let now = unix_now();
        if dial_cooloff_active(&record, now) {
            continue;
        }
        {
            let Ok(tables) = shared.tables.lock() else {
                break;
            };
            if tables.connected.contains_key(&addr) || tables.is_banned(&addr, now) {
                continue;
            }
        }

        info!("attempting to connect to {addr}");
        record.last_attempt = now;
        match dial_session(ip, &shared.config, ctx.clone()).await {
            Ok((session, info)) => {
                record.height = info.tip_height;
                record.version = info.version;
                record.last_seen = now;
                record.score = 0;
                if insert_session(shared, &addr, Arc::clone(&session), record.clone(), false) {
                    info!("successfully connected to {addr}");
                } else {
                    session.close().await;
                }
            }
            Err(err) => {
                warn!("failed to connect to {addr}: {err}");
            }
        }
        stage_record(batch, &addr, &record)?;
        // one dial attempt per iteration
        break;
    }
    Ok(false)
}

enum Verdict {
    Keep(Vec<String>),
    Drop(&'static str),
    Penalize(u64, &'static str),
}

/// Re-polls every live session: refreshes its record, enforces the
/// major-version match, applies bans, and harvests gossiped addresses.
async fn maintenance_pass<S: KeyValueStore>(
    shared: &Arc<Shared>,
    directory: &PeerDirectory<S>,
    batch: &mut WriteBatch,
) -> Result<(), StoreError> {
    let sessions = shared.sessions();
    let mut removals: Vec<String> = Vec::new();
    let mut discovered: Vec<String> = Vec::new();

    for (addr, session) in sessions {
        match session.get_info().await {
            Ok(info) => {
                let now = unix_now();
                let verdict = judge_info(shared, &addr, &info, now);
                match verdict {
                    Some(Verdict::Keep(gossip)) => discovered.extend(gossip),
                    Some(Verdict::Drop(reason)) => {
                        warn!("disconnecting {addr}: {reason}");
                        removals.push(addr.clone());
                    }
                    Some(Verdict::Penalize(score, reason)) => {
                        warn!("disconnecting {addr}: {reason}");
                        shared.penalize(&addr, score);
                        removals.push(addr.clone());
                    }
                    None => continue,
                }
                // the record (including any penalty) rides the pass batch
                if let Some(record) = shared.record_of(&addr) {
                    stage_record(batch, &addr, &record)?;
                }
            }
            Err(NetworkError::Malformed(_)) => {
                warn!("{addr} sent a malformed info message");
                shared.penalize(&addr, MALFORMED_INFO_SCORE);
                if let Some(record) = shared.record_of(&addr) {
                    stage_record(batch, &addr, &record)?;
                }
                removals.push(addr);
            }
            Err(err) => {
                warn!("error with {addr}, disconnecting it: {err}");
                removals.push(addr);
            }
        }
    }

    for addr in discovered {
        if directory.get(&addr)?.is_none() {
            info!("discovered new peer: {addr}");
            stage_record(batch, &addr, &PeerRecord::default())?;
        }
    }

    let closed: Vec<Arc<PeerSession>> = {
        match shared.tables.lock() {
            Ok(mut tables) => removals
                .iter()
                .filter_map(|addr| tables.connected.remove(addr))
                .map(|slot| slot.session)
                .collect(),
            Err(_) => Vec::new(),
        }
    };
    for session in closed {
        session.close().await;
    }

    shared.recompute_best_height();
    Ok(())
}

/// Applies one info reply to a connected peer's record under the lock.
/// Returns None when the peer vanished mid-pass.
fn judge_info(shared: &Shared, addr: &str, info: &InfoReply, now: u64) -> Option<Verdict> {
    let mut tables = shared.tables.lock().ok()?;
    let banned = tables.is_banned(addr, now);
    let slot = tables.connected.get_mut(addr)?;

    if major_version(&info.version) != major_version(&shared.config.version) {
        return Some(Verdict::Drop("different major version than us"));
    }
    if banned {
        return Some(Verdict::Drop("banned"));
    }

    slot.record.height = info.tip_height;
    slot.record.version = info.version.clone();
    slot.record.last_seen = now;

    let mut gossip = Vec::with_capacity(info.peers.len());
    for peer_addr in &info.peers {
        match canonical_peer_ip(peer_addr) {
            Some(ip) => gossip.push(ip.to_string()),
            None => {
                return Some(Verdict::Penalize(
                    INVALID_GOSSIP_SCORE,
                    "gossiped an invalid address",
                ));
            }
        }
    }
    Some(Verdict::Keep(gossip))
}

/// Inserts a session into the connected table unless the cap, a duplicate,
/// or a ban got there first.
fn insert_session(
    shared: &Shared,
    addr: &str,
    session: Arc<PeerSession>,
    record: PeerRecord,
    inbound: bool,
) -> bool {
    let Ok(mut tables) = shared.tables.lock() else {
        return false;
    };
    if tables.connected.len() >= shared.config.max_connections {
        debug!("connection cap reached, dropping session with {addr}");
        return false;
    }
    if tables.connected.contains_key(addr) || tables.is_banned(addr, unix_now()) {
        return false;
    }
    tables.connected.insert(
        addr.to_string(),
        PeerSlot {
            session,
            record,
            inbound,
        },
    );
    true
}
