//! Thin RLP helpers over alloy-rlp
//!
//! The trie and header code deal in heterogeneous lists (byte strings and
//! nested lists mixed), which the derive-based encoders do not cover. These
//! helpers encode items individually and splice them into list frames.

use alloy_rlp::Header;

use super::ProofError;

/// RLP-encode a byte string.
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    alloy_rlp::encode(data)
}

/// RLP-encode an unsigned integer (trimmed big-endian).
pub fn encode_uint(value: u64) -> Vec<u8> {
    alloy_rlp::encode(value)
}

/// Frame already-encoded items into an RLP list.
pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_length: usize = items.iter().map(|i| i.len()).sum();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

/// One item inside a decoded RLP list: the full encoding, the payload it
/// frames, and whether it is itself a list.
#[derive(Debug, Clone, Copy)]
pub struct RlpItem<'a> {
    pub raw: &'a [u8],
    pub payload: &'a [u8],
    pub is_list: bool,
}

/// Split an RLP list into its top-level items.
pub fn split_list(data: &[u8]) -> Result<Vec<RlpItem<'_>>, ProofError> {
    let mut buf = data;
    let outer = Header::decode(&mut buf)?;
    if !outer.list {
        return Err(ProofError::Malformed("expected an rlp list".into()));
    }
    if buf.len() < outer.payload_length {
        return Err(ProofError::Malformed("truncated rlp list".into()));
    }
    let mut payload = &buf[..outer.payload_length];

    let mut items = Vec::new();
    while !payload.is_empty() {
        let start = payload;
        let header = Header::decode(&mut payload)?;
        let header_len = start.len() - payload.len();
        if payload.len() < header.payload_length {
            return Err(ProofError::Malformed("truncated rlp item".into()));
        }
        items.push(RlpItem {
            raw: &start[..header_len + header.payload_length],
            payload: &payload[..header.payload_length],
            is_list: header.list,
        });
        payload = &payload[header.payload_length..];
    }
    Ok(items)
}

/// Decode a trimmed big-endian unsigned integer payload.
pub fn decode_uint(payload: &[u8]) -> Result<u64, ProofError> {
    if payload.len() > 8 {
        return Err(ProofError::Malformed("integer payload too wide".into()));
    }
    let mut value = 0u64;
    for byte in payload {
        value = (value << 8) | u64::from(*byte);
    }
    Ok(value)
}
