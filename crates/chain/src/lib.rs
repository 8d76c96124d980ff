//! The blockchain-engine contract consumed by the networking core, plus an
//! in-memory reference engine.
//!
//! Validation, consensus, and UTXO rules live behind [`ChainEngine`]; the
//! networking core only needs tip/ancestry queries, in-order submission, and
//! range reads for serving peers.

use std::collections::HashMap;
use std::sync::Mutex;

use emberd_primitives::{Block, BlockId, Transaction};

/// Result of submitting one block to the engine.
///
/// `misbehavior` is set when the block was syntactically valid but rejected
/// in a way attributable to the peer that served it (for example a forged
/// id), as opposed to a block that merely does not attach yet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SubmitOutcome {
    pub accepted: bool,
    pub misbehavior: bool,
}

pub trait ChainEngine: Send + Sync {
    /// Height of the best locally accepted block.
    fn tip_height(&self) -> u64;

    /// Whether a block with this id is known locally.
    fn has_block(&self, id: &BlockId) -> bool;

    /// Submits one block. Callers submit strictly ascending runs.
    fn submit_block(&self, block: Block) -> SubmitOutcome;

    /// Blocks with heights in `lo..=hi`, ascending. May be shorter than the
    /// request if the range runs past the tip.
    fn blocks_range(&self, lo: u64, hi: u64) -> Vec<Block>;

    /// Hands relayed transactions to the engine's mempool.
    fn submit_transactions(&self, txs: Vec<Transaction>);
}

struct ChainInner {
    // blocks[0] is the genesis block at height 1
    blocks: Vec<Block>,
    by_id: HashMap<BlockId, u64>,
    mempool: Vec<Transaction>,
}

/// Reference engine keeping the whole chain in memory. Used by tests and the
/// demo binary; a production deployment plugs in a real engine instead.
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn with_genesis(genesis: Block) -> Self {
        let mut by_id = HashMap::new();
        by_id.insert(genesis.id, genesis.height);
        Self {
            inner: Mutex::new(ChainInner {
                blocks: vec![genesis],
                by_id,
                mempool: Vec::new(),
            }),
        }
    }

    pub fn tip(&self) -> Block {
        let inner = self.inner.lock().expect("chain lock");
        inner.blocks.last().expect("genesis always present").clone()
    }

    pub fn mempool_len(&self) -> usize {
        let inner = self.inner.lock().expect("chain lock");
        inner.mempool.len()
    }
}

impl ChainEngine for MemoryChain {
    fn tip_height(&self) -> u64 {
        let inner = self.inner.lock().expect("chain lock");
        inner.blocks.last().map(|block| block.height).unwrap_or(1)
    }

    fn has_block(&self, id: &BlockId) -> bool {
        let inner = self.inner.lock().expect("chain lock");
        inner.by_id.contains_key(id)
    }

    fn submit_block(&self, block: Block) -> SubmitOutcome {
        let mut inner = self.inner.lock().expect("chain lock");
        if inner.by_id.contains_key(&block.id) {
            // Already have it; resubmission is harmless.
            return SubmitOutcome {
                accepted: true,
                misbehavior: false,
            };
        }
        if block.id != block.compute_id() {
            return SubmitOutcome {
                accepted: false,
                misbehavior: true,
            };
        }
        let tip = inner.blocks.last().expect("genesis always present");
        if block.parent != tip.id || block.height != tip.height + 1 {
            return SubmitOutcome {
                accepted: false,
                misbehavior: false,
            };
        }
        inner.by_id.insert(block.id, block.height);
        inner.blocks.push(block);
        SubmitOutcome {
            accepted: true,
            misbehavior: false,
        }
    }

    fn blocks_range(&self, lo: u64, hi: u64) -> Vec<Block> {
        let inner = self.inner.lock().expect("chain lock");
        if lo == 0 || hi < lo {
            return Vec::new();
        }
        let mut out = Vec::new();
        for height in lo..=hi {
            // height 1 sits at index 0
            match inner.blocks.get((height - 1) as usize) {
                Some(block) => out.push(block.clone()),
                None => break,
            }
        }
        out
    }

    fn submit_transactions(&self, txs: Vec<Transaction>) {
        let mut inner = self.inner.lock().expect("chain lock");
        for tx in txs {
            if inner.mempool.iter().all(|known| known.id != tx.id) {
                inner.mempool.push(tx);
            }
        }
    }
}

/// Deterministic genesis used by tests and the demo binary.
pub fn genesis_block() -> Block {
    Block::new(BlockId::default(), 1, 1_717_200_000, Vec::new())
}

/// Extends `parent` with a sealed empty block.
pub fn next_block(parent: &Block) -> Block {
    Block::new(parent.id, parent.height + 1, parent.timestamp + 60, Vec::new())
}
