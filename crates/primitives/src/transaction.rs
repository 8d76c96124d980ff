use serde::{Deserialize, Serialize};

use crate::hash::{sha256d, Hash256};
use crate::{bytes_to_hex, hex_to_bytes};

/// Identifier of a transaction, serialized as a lowercase hex string.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Txid(pub Hash256);

impl Txid {
    pub fn to_hex(&self) -> String {
        bytes_to_hex(&self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let bytes = hex_to_bytes(hex)?;
        let bytes: Hash256 = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Display for Txid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Txid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Txid::from_hex(&hex).ok_or_else(|| serde::de::Error::custom("invalid transaction id"))
    }
}

/// A transaction as relayed by the network core. The payload is opaque here;
/// interpreting it is the engine's business.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Txid,
    pub payload: String,
}

impl Transaction {
    pub fn new(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let id = Txid(sha256d(payload.as_bytes()));
        Self { id, payload }
    }
}
