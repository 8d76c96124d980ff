use serde::{Deserialize, Serialize};

use crate::hash::{sha256d, Hash256};
use crate::transaction::Transaction;
use crate::{bytes_to_hex, hex_to_bytes};

/// Identifier of a block, the double-SHA256 of its sealed contents.
/// Serialized as a lowercase hex string on the wire and on disk.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct BlockId(pub Hash256);

impl BlockId {
    pub fn to_hex(&self) -> String {
        bytes_to_hex(&self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let bytes = hex_to_bytes(hex)?;
        let bytes: Hash256 = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for BlockId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        BlockId::from_hex(&hex).ok_or_else(|| serde::de::Error::custom("invalid block id"))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub parent: BlockId,
    pub height: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Builds a block and seals it with its computed id.
    pub fn new(parent: BlockId, height: u64, timestamp: u64, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            id: BlockId::default(),
            parent,
            height,
            timestamp,
            transactions,
        };
        block.id = block.compute_id();
        block
    }

    /// The id implied by the block contents. A sealed block has `id == compute_id()`.
    pub fn compute_id(&self) -> BlockId {
        let mut preimage = Vec::with_capacity(80 + self.transactions.len() * 32);
        preimage.extend_from_slice(&self.parent.0);
        preimage.extend_from_slice(&self.height.to_le_bytes());
        preimage.extend_from_slice(&self.timestamp.to_le_bytes());
        for tx in &self.transactions {
            preimage.extend_from_slice(&tx.id.0);
        }
        BlockId(sha256d(&preimage))
    }
}
