//! Typed wire messages and framing.
//!
//! Frames are `MAGIC (4) | length (4, LE) | JSON payload`. The envelope is
//! parsed at the codec boundary; reply bodies stay dynamic until the caller
//! that issued the request validates them into a typed form, so a peer that
//! answers with garbage is caught at the call site and can be scored there.

use serde::{Deserialize, Serialize};

use emberd_primitives::{Block, Transaction};

use crate::NetworkError;

pub const MAGIC: [u8; 4] = *b"EMBR";
pub const FRAME_HEADER_BYTES: usize = 8;
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    Request { id: u64, body: Request },
    Response { id: u64, body: serde_json::Value },
    Push(Push),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    GetInfo,
    GetBlocks { lo: u64, hi: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Info(InfoReply),
    Blocks(Vec<Block>),
    Error(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Push {
    Block(Block),
    Transactions(Vec<Transaction>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoReply {
    pub tip_height: u64,
    pub version: String,
    pub peers: Vec<String>,
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, NetworkError> {
    let payload =
        serde_json::to_vec(envelope).map_err(|err| NetworkError::Malformed(err.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(NetworkError::Protocol("frame too large".to_string()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parses a frame header, returning the payload length.
pub fn decode_header(header: &[u8; FRAME_HEADER_BYTES]) -> Result<usize, NetworkError> {
    if header[..4] != MAGIC {
        return Err(NetworkError::Protocol("invalid magic".to_string()));
    }
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(NetworkError::Protocol("frame too large".to_string()));
    }
    Ok(length)
}

pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, NetworkError> {
    serde_json::from_slice(payload).map_err(|err| NetworkError::Malformed(err.to_string()))
}

/// Validates a reply body as an info reply.
pub fn expect_info(body: serde_json::Value) -> Result<InfoReply, NetworkError> {
    match serde_json::from_value::<Reply>(body) {
        Ok(Reply::Info(info)) => Ok(info),
        Ok(Reply::Error(message)) => Err(NetworkError::Protocol(message)),
        Ok(_) => Err(NetworkError::Malformed("expected an info reply".to_string())),
        Err(err) => Err(NetworkError::Malformed(err.to_string())),
    }
}

/// Validates a reply body as a block list.
pub fn expect_blocks(body: serde_json::Value) -> Result<Vec<Block>, NetworkError> {
    match serde_json::from_value::<Reply>(body) {
        Ok(Reply::Blocks(blocks)) => Ok(blocks),
        Ok(Reply::Error(message)) => Err(NetworkError::Protocol(message)),
        Ok(_) => Err(NetworkError::Malformed("expected a blocks reply".to_string())),
        Err(err) => Err(NetworkError::Malformed(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let envelope = Envelope::Request {
            id: 7,
            body: Request::GetBlocks { lo: 11, hi: 16 },
        };
        let frame = encode_frame(&envelope).expect("encode");
        assert_eq!(&frame[..4], &MAGIC);

        let mut header = [0u8; FRAME_HEADER_BYTES];
        header.copy_from_slice(&frame[..FRAME_HEADER_BYTES]);
        let length = decode_header(&header).expect("header");
        assert_eq!(length, frame.len() - FRAME_HEADER_BYTES);

        match decode_envelope(&frame[FRAME_HEADER_BYTES..]).expect("payload") {
            Envelope::Request {
                id,
                body: Request::GetBlocks { lo, hi },
            } => {
                assert_eq!(id, 7);
                assert_eq!((lo, hi), (11, 16));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_magic_and_oversize() {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        header[..4].copy_from_slice(b"NOPE");
        assert!(decode_header(&header).is_err());

        header[..4].copy_from_slice(&MAGIC);
        header[4..].copy_from_slice(&(MAX_FRAME_BYTES as u32 + 1).to_le_bytes());
        assert!(decode_header(&header).is_err());
    }

    #[test]
    fn info_reply_validation() {
        let body = serde_json::json!({
            "info": { "tip_height": 42, "version": "1.7.3", "peers": ["1.2.3.4"] }
        });
        let info = expect_info(body).expect("info");
        assert_eq!(info.tip_height, 42);
        assert_eq!(info.version, "1.7.3");
        assert_eq!(info.peers, vec!["1.2.3.4".to_string()]);

        // a structurally wrong reply is malformed, not a transport error
        let wrong = serde_json::json!({ "info": { "tip_height": "tall" } });
        assert!(matches!(
            expect_info(wrong),
            Err(NetworkError::Malformed(_))
        ));

        let blocks = serde_json::json!({ "blocks": [] });
        assert!(matches!(
            expect_info(blocks),
            Err(NetworkError::Malformed(_))
        ));
    }

    #[test]
    fn remote_error_reply_is_protocol_error() {
        let body = serde_json::json!({ "error": "bad block range" });
        assert!(matches!(
            expect_blocks(body),
            Err(NetworkError::Protocol(_))
        ));
    }
}
