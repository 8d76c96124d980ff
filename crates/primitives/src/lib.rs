//! Core block/transaction types and their wire serialization.

pub mod block;
pub mod hash;
pub mod transaction;

pub use block::{Block, BlockId};
pub use hash::{bytes_to_hex, hex_to_bytes, sha256, sha256d, Hash256};
pub use transaction::{Transaction, Txid};
