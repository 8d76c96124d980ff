//! Chain synchronization worker.
//!
//! When the best advertised height beats the local tip, one peer is chosen
//! and blocks are pulled in short ranges into a single ascending gap-free
//! run, which is then handed to a single-slot block processor. The previous
//! processor is always joined before a new run starts, so the engine sees
//! strictly ascending submissions.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use emberd_chain::ChainEngine;
use emberd_primitives::Block;

use crate::peer_book::unix_now;
use crate::session::PeerSession;
use crate::{stop_requested, stoppable_sleep, Shared};

/// Blocks requested per range.
const SYNC_RANGE: u64 = 6;
/// Cap on one staged run.
const MAX_RUN_BLOCKS: usize = 2000;
/// Penalty for serving a chain that does not share our genesis block.
const GENESIS_MISMATCH_SCORE: u64 = 250;
/// Penalty for a block the engine rejects as peer-attributable.
const BAD_BLOCK_SCORE: u64 = 50;

pub(crate) async fn sync_loop(
    shared: Arc<Shared>,
    engine: Arc<dyn ChainEngine>,
    mut stop: watch::Receiver<bool>,
) {
    let mut processor: Option<JoinHandle<bool>> = None;
    let mut current_height = engine.tip_height();
    shared.publish_current_height(current_height);

    while !stop_requested(&stop) {
        let tip = engine.tip_height();
        if current_height < tip {
            current_height = tip;
        }
        shared.publish_current_height(current_height);

        let best = shared.best_height();
        debug!("current height {current_height}, best height {best}");

        let mut staged: Vec<Block> = Vec::new();
        let mut source = String::new();
        let mut usable_peers = 0;
        if best > current_height {
            let usable = shared.usable_peers(current_height);
            usable_peers = usable.len();
            if usable_peers > 0 {
                let (addr, session) = usable[unix_now() as usize % usable.len()].clone();
                source = addr;
                staged = download_run(
                    &source,
                    session.as_ref(),
                    engine.as_ref(),
                    &shared,
                    &mut current_height,
                    best,
                    processor.is_none(),
                    &stop,
                )
                .await;
                shared.publish_current_height(current_height);
            }
        }

        if let Some(handle) = processor.take() {
            match handle.await {
                Ok(failed) => {
                    if failed {
                        // resync from the engine tip next cycle
                        continue;
                    }
                }
                Err(err) => {
                    warn!("block processor panicked: {err}");
                    continue;
                }
            }
        }

        if !staged.is_empty() {
            let engine = Arc::clone(&engine);
            let shared = Arc::clone(&shared);
            processor = Some(tokio::task::spawn_blocking(move || {
                process_run(engine, shared, source, staged)
            }));
        }

        if best <= current_height || usable_peers == 0 {
            stoppable_sleep(shared.config.long_sleep, &mut stop).await;
        }
    }

    if let Some(handle) = processor.take() {
        let _ = handle.await;
    }
}

/// Downloads one run from `addr`. Priming establishes a range that attaches
/// to the local chain (rewinding past unknown parents); extension grows the
/// run until the cap, the peer's height, or a short reply. A transport error
/// terminates the download but keeps whatever was staged.
#[allow(clippy::too_many_arguments)]
async fn download_run(
    addr: &str,
    session: &PeerSession,
    engine: &dyn ChainEngine,
    shared: &Shared,
    current_height: &mut u64,
    best_height: u64,
    prime: bool,
    stop: &watch::Receiver<bool>,
) -> Vec<Block> {
    let mut staged: Vec<Block> = Vec::new();

    if prime {
        loop {
            if stop_requested(stop) {
                return staged;
            }
            let lo = *current_height + 1;
            let hi = *current_height + SYNC_RANGE;
            info!("downloading blocks {lo} to {hi} from {addr}");
            let batch = match session.get_blocks(lo, hi).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("error downloading blocks from {addr}: {err}");
                    return staged;
                }
            };
            if batch.is_empty() {
                return staged;
            }
            let mut ascending = batch;
            ascending.reverse();
            if !extends_run(None, *current_height, &ascending) {
                warn!("{addr} served a non-contiguous block range");
                return staged;
            }
            let received = ascending.len() as u64;
            let first = &ascending[0];
            if !engine.has_block(&first.parent) {
                if *current_height <= 1 {
                    // nothing below height 1 to rewind to: different genesis
                    warn!("{addr} disagrees on the genesis block");
                    shared.penalize(addr, GENESIS_MISMATCH_SCORE);
                    return staged;
                }
                *current_height = current_height.saturating_sub(received).max(1);
                continue;
            }
            *current_height += received;
            staged = ascending;
            break;
        }
    }

    while staged.len() < MAX_RUN_BLOCKS && *current_height < best_height && !stop_requested(stop) {
        let lo = *current_height + 1;
        let hi = *current_height + SYNC_RANGE;
        info!("downloading blocks {lo} to {hi} from {addr}");
        let batch = match session.get_blocks(lo, hi).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!("error downloading blocks from {addr}: {err}");
                break;
            }
        };
        if batch.is_empty() {
            break;
        }
        let mut ascending = batch;
        ascending.reverse();
        if !extends_run(staged.last(), *current_height, &ascending) {
            warn!("{addr} served a non-contiguous block range");
            break;
        }
        *current_height += ascending.len() as u64;
        staged.extend(ascending);
    }

    staged
}

/// Whether `batch` (ascending) continues the staged run at `current`.
fn extends_run(last: Option<&Block>, current: u64, batch: &[Block]) -> bool {
    let Some(first) = batch.first() else {
        return false;
    };
    if first.height != current + 1 {
        return false;
    }
    if let Some(last) = last {
        if first.parent != last.id {
            return false;
        }
    }
    batch
        .windows(2)
        .all(|pair| pair[1].height == pair[0].height + 1 && pair[1].parent == pair[0].id)
}

/// Submits a run in ascending order. Returns true when the run was aborted
/// by a rejected block.
fn process_run(
    engine: Arc<dyn ChainEngine>,
    shared: Arc<Shared>,
    source: String,
    blocks: Vec<Block>,
) -> bool {
    for block in blocks {
        let outcome = engine.submit_block(block);
        if outcome.misbehavior {
            shared.penalize(&source, BAD_BLOCK_SCORE);
        }
        if !outcome.accepted {
            return true;
        }
    }
    false
}
