//! End-to-end tests over real localhost sockets.
//!
//! Each node binds its own 127.x address on a shared port, which is how the
//! production dialer works too (one network-wide port, addresses in the
//! directory are bare IPs). `allow_loopback` plus distinct `public_addr`s
//! keep the self-dial filter honest on a single host.

use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use emberd_chain::{genesis_block, next_block, ChainEngine, MemoryChain};
use emberd_net::wire::{self, Envelope, InfoReply, Reply, Request};
use emberd_net::{NetConfig, Network};
use emberd_primitives::Transaction;
use emberd_storage::memory::MemoryStore;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .expect("bind probe")
        .local_addr()
        .expect("probe addr")
        .port()
}

fn seed_file(tag: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("emberd-net-{}-{tag}", std::process::id()));
    std::fs::write(&path, contents).expect("write seed file");
    path
}

fn node_config(host: &str, port: u16, seed: PathBuf) -> NetConfig {
    NetConfig {
        bind_addr: host.parse().expect("bind addr"),
        port,
        public_addr: Some(host.parse().expect("public addr")),
        seed_file: seed,
        connect_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        short_sleep: Duration::from_millis(10),
        long_sleep: Duration::from_millis(50),
        allow_loopback: true,
        ..NetConfig::default()
    }
}

async fn wait_for(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn node_syncs_and_receives_broadcasts() {
    let port = free_port();
    let genesis = genesis_block();

    // node a holds a 25-block chain
    let chain_a = Arc::new(MemoryChain::with_genesis(genesis.clone()));
    for _ in 1..25 {
        assert!(chain_a.submit_block(next_block(&chain_a.tip())).accepted);
    }
    assert_eq!(chain_a.tip_height(), 25);
    let seed_a = seed_file("sync-a", "");
    let node_a = Network::start(
        node_config("127.0.0.1", port, seed_a.clone()),
        Arc::new(MemoryStore::new()),
        Arc::clone(&chain_a) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node a");

    // node b starts at the shared genesis and learns of a from its seed file
    let chain_b = Arc::new(MemoryChain::with_genesis(genesis));
    let seed_b = seed_file("sync-b", "127.0.0.1\n");
    let node_b = Network::start(
        node_config("127.0.0.2", port, seed_b.clone()),
        Arc::new(MemoryStore::new()),
        Arc::clone(&chain_b) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node b");

    // b dials a, downloads 2..=25, and submits them in ascending order;
    // the reference engine only extends its tip, so reaching height 25
    // proves the run was gap-free and ascending
    wait_for("node b to sync", Duration::from_secs(15), || {
        chain_b.tip_height() == 25
    })
    .await;

    assert_eq!(node_b.connections(), 1);
    assert!(node_b.connected_peers().contains("127.0.0.1"));
    wait_for("node a to see the inbound peer", Duration::from_secs(5), || {
        node_a.connections() == 1
    })
    .await;
    assert!(node_a.connected_peers().contains("127.0.0.2"));

    wait_for("sync progress to settle", Duration::from_secs(5), || {
        node_b.current_height() == 25
    })
    .await;
    let progress = node_b.sync_progress();
    assert!((0.0..=1.0).contains(&progress));
    assert!((progress - 1.0).abs() < 1e-9);

    let stats = node_b.peer_stats();
    let peer = stats.get("127.0.0.1").expect("stats for node a");
    assert_eq!(peer.height, 25);
    assert!(!peer.inbound);
    assert!(peer.bytes_in > 0);
    assert!(peer.bytes_out > 0);
    assert!(peer.requests_out > 0);

    // a mines one more block and broadcasts it; b applies the push
    let block = next_block(&chain_a.tip());
    assert!(chain_a.submit_block(block.clone()).accepted);
    node_a.broadcast_block(&block).await;
    wait_for("broadcast block to land on b", Duration::from_secs(5), || {
        chain_b.tip_height() == 26
    })
    .await;

    // transactions relay into b's mempool
    node_a
        .broadcast_transactions(&[Transaction::new("coffee")])
        .await;
    wait_for("broadcast tx to land on b", Duration::from_secs(5), || {
        chain_b.mempool_len() == 1
    })
    .await;

    node_a.shutdown().await;
    node_b.shutdown().await;
    std::fs::remove_file(seed_a).ok();
    std::fs::remove_file(seed_b).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn genesis_disagreement_gets_the_peer_banned() {
    let port = free_port();

    // node a grows a chain on a different genesis block
    let mut foreign = genesis_block();
    foreign.timestamp += 1;
    foreign.id = foreign.compute_id();
    let chain_a = Arc::new(MemoryChain::with_genesis(foreign));
    for _ in 1..10 {
        assert!(chain_a.submit_block(next_block(&chain_a.tip())).accepted);
    }
    let seed_a = seed_file("genesis-a", "");
    let node_a = Network::start(
        node_config("127.0.0.1", port, seed_a.clone()),
        Arc::new(MemoryStore::new()),
        Arc::clone(&chain_a) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node a");

    let chain_b = Arc::new(MemoryChain::with_genesis(genesis_block()));
    let seed_b = seed_file("genesis-b", "127.0.0.1\n");
    let node_b = Network::start(
        node_config("127.0.0.2", port, seed_b.clone()),
        Arc::new(MemoryStore::new()),
        Arc::clone(&chain_b) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node b");

    // the first primed range has an unknown parent at local height 1:
    // +250 crosses the ban threshold and the next maintenance pass
    // disconnects the peer
    wait_for("node b to ban node a", Duration::from_secs(15), || {
        node_b
            .banned_peers()
            .iter()
            .any(|(addr, _)| addr == "127.0.0.1")
    })
    .await;
    wait_for("node b to drop the session", Duration::from_secs(5), || {
        node_b.connections() == 0
    })
    .await;
    assert_eq!(chain_b.tip_height(), 1);

    node_a.shutdown().await;
    node_b.shutdown().await;
    std::fs::remove_file(seed_a).ok();
    std::fs::remove_file(seed_b).ok();
}

/// A hand-driven peer that answers `get_info` from a script, repeating the
/// last entry once the script runs out. It never pushes or requests.
async fn scripted_peer(listener: TcpListener, replies: Vec<InfoReply>) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let (mut read, mut write) = stream.into_split();
    let mut script = replies.into_iter();
    let mut current: Option<InfoReply> = None;
    loop {
        let mut header = [0u8; wire::FRAME_HEADER_BYTES];
        if read.read_exact(&mut header).await.is_err() {
            return;
        }
        let Ok(length) = wire::decode_header(&header) else {
            return;
        };
        let mut payload = vec![0u8; length];
        if read.read_exact(&mut payload).await.is_err() {
            return;
        }
        let Ok(envelope) = wire::decode_envelope(&payload) else {
            return;
        };
        let Envelope::Request { id, body } = envelope else {
            continue;
        };
        let reply = match body {
            Request::GetInfo => {
                if let Some(next) = script.next() {
                    current = Some(next);
                }
                Reply::Info(current.clone().expect("script not empty"))
            }
            Request::GetBlocks { .. } => Reply::Blocks(Vec::new()),
        };
        let body = serde_json::to_value(&reply).expect("encode reply");
        let frame =
            wire::encode_frame(&Envelope::Response { id, body }).expect("frame reply");
        if write.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn idle_info(version: &str, peers: Vec<String>) -> InfoReply {
    InfoReply {
        tip_height: 1,
        version: version.to_string(),
        peers,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_gossip_scores_and_disconnects() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.3", port))
        .await
        .expect("bind scripted peer");

    let config = node_config("127.0.0.4", port, seed_file("gossip", "127.0.0.3\n"));
    let version = config.version.clone();
    let seed = config.seed_file.clone();

    // handshake succeeds, then maintenance sees a bogus gossiped address
    tokio::spawn(scripted_peer(
        listener,
        vec![
            idle_info(&version, Vec::new()),
            idle_info(&version, vec!["not-an-ip".to_string()]),
        ],
    ));

    let node = Network::start(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryChain::with_genesis(genesis_block())) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node");

    // the dial and the penalizing maintenance pass commit as one batch, so
    // the persisted score is the proof both happened
    wait_for("the peer to be scored", Duration::from_secs(10), || {
        node.directory()
            .get("127.0.0.3")
            .expect("directory read")
            .map(|record| record.score == 10)
            .unwrap_or(false)
    })
    .await;

    // the reporting session was dropped in the same pass, +10 does not ban,
    // and no record is created for the bogus address
    assert_eq!(node.connections(), 0);
    assert!(node.banned_peers().is_empty());
    assert!(node
        .directory()
        .get("not-an-ip")
        .expect("directory read")
        .is_none());

    node.shutdown().await;
    std::fs::remove_file(seed).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn major_version_mismatch_disconnects_without_ban() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.5", port))
        .await
        .expect("bind scripted peer");

    let config = node_config("127.0.0.6", port, seed_file("version", "127.0.0.5\n"));
    let seed = config.seed_file.clone();

    tokio::spawn(scripted_peer(
        listener,
        vec![idle_info("2.0.0", Vec::new())],
    ));

    let node = Network::start(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryChain::with_genesis(genesis_block())) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node");

    // the handshake itself does not gate on version; the first maintenance
    // pass enforces the major-version match. A persisted record with
    // last_seen set proves the dial went through.
    wait_for("the dial to be recorded", Duration::from_secs(10), || {
        node.directory()
            .get("127.0.0.5")
            .expect("directory read")
            .map(|record| record.last_seen > 0)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(node.connections(), 0);
    // a version mismatch is not misbehavior
    assert!(node.banned_peers().is_empty());

    node.shutdown().await;
    std::fs::remove_file(seed).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn own_address_is_never_dialed() {
    let port = free_port();
    let config = node_config("127.0.0.7", port, seed_file("self", "127.0.0.7\n"));
    let seed = config.seed_file.clone();

    let node = Network::start(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryChain::with_genesis(genesis_block())) as Arc<dyn ChainEngine>,
    )
    .await
    .expect("start node");

    // give the dialer a few iterations
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node.connections(), 0);
    let record = node
        .directory()
        .get("127.0.0.7")
        .expect("directory read")
        .expect("own record");
    assert_eq!(record.last_attempt, 0);

    node.shutdown().await;
    std::fs::remove_file(seed).ok();
}
