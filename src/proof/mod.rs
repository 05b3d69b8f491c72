//! Proof construction pipeline
//!
//! Turns a source-chain event into a `ProofBundle` a destination chain can
//! verify without trusting this service: the consensus receipt encoding, a
//! Merkle-Patricia inclusion witness against the block's receipts root, and
//! the seal-stripped header encodings that tie the root to the source
//! chain's consensus. Non-EVM sources skip this module entirely and get
//! their bundle from the decoder service.

use serde::{Deserialize, Serialize};

use crate::hash::{event_signature_hash, keccak256};
use crate::types::ProofBundle;

pub mod header;
pub mod rlp;
pub mod threshold;
pub mod trie;

pub use header::{ConsensusExtraData, SourceBlockHeader};
pub use threshold::{collect_signatures, HttpSignerClient, SignerClient, ThresholdAttestation};
pub use trie::{verify_inclusion, ReceiptsTrie};

use rlp::{encode_bytes, encode_list, encode_uint};

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("rlp decoding failed: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    #[error("malformed proof input: {0}")]
    Malformed(String),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("computed receipts root {computed} does not match header root {expected}")]
    RootMismatch { computed: String, expected: String },
    #[error("transaction index {index} out of range for {count} receipts")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("proof verification failed: {0}")]
    Verification(String),
    #[error("signature quorum not reached: {collected} of {signers} signers, need {threshold}")]
    QuorumNotReached {
        collected: usize,
        threshold: u32,
        signers: usize,
    },
}

/// One log entry inside a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogData {
    /// Emitting contract address, 0x-hex.
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

impl LogData {
    fn rlp_encoded(&self) -> Result<Vec<u8>, ProofError> {
        let topics: Vec<Vec<u8>> = self
            .topics
            .iter()
            .map(|t| Ok(encode_bytes(&decode_hex(t)?)))
            .collect::<Result<_, ProofError>>()?;
        Ok(encode_list(&[
            encode_bytes(&decode_hex(&self.address)?),
            encode_list(&topics),
            encode_bytes(&decode_hex(&self.data)?),
        ]))
    }
}

/// A transaction receipt as fetched from the source chain, carrying just
/// the fields the consensus encoding commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptData {
    /// EIP-2718 transaction type; 0 for legacy.
    #[serde(default)]
    pub tx_type: u8,
    pub status: bool,
    pub cumulative_gas_used: u64,
    /// 256-byte logs bloom, hex encoded.
    pub logs_bloom: String,
    pub logs: Vec<LogData>,
}

impl ReceiptData {
    /// The encoding the receipts trie commits to. Typed receipts are the
    /// legacy list prefixed with the type byte.
    pub fn rlp_encoded(&self) -> Result<Vec<u8>, ProofError> {
        let logs: Vec<Vec<u8>> = self
            .logs
            .iter()
            .map(LogData::rlp_encoded)
            .collect::<Result<_, ProofError>>()?;
        let inner = encode_list(&[
            encode_uint(u64::from(self.status)),
            encode_uint(self.cumulative_gas_used),
            encode_bytes(&decode_hex(&self.logs_bloom)?),
            encode_list(&logs),
        ]);
        if self.tx_type == 0 {
            Ok(inner)
        } else {
            let mut out = Vec::with_capacity(inner.len() + 1);
            out.push(self.tx_type);
            out.extend_from_slice(&inner);
            Ok(out)
        }
    }
}

/// Everything fetched from the source chain for one block: the header and
/// the full receipt list in transaction order.
#[derive(Debug, Clone)]
pub struct BlockEvidence {
    pub header: SourceBlockHeader,
    pub receipts: Vec<ReceiptData>,
}

/// Inputs for one event proof.
#[derive(Debug, Clone)]
pub struct EventProofRequest {
    pub source_system_id: u64,
    pub destination_system_id: u64,
    /// Emitting contract address on the source chain, 0x-hex.
    pub source_contract: String,
    /// Solidity event signature, e.g. `HoldExecuted(bytes32,uint256)`.
    pub event_signature: String,
    /// Index of the transaction that emitted the event.
    pub transaction_index: usize,
}

/// Build the proof bundle for one EVM source event.
///
/// The trie is rebuilt from the fetched receipts and its root compared to
/// the header's receipts root before the witness is extracted. A mismatch
/// means the fetched evidence is internally inconsistent; nothing built
/// from it can be trusted, so this fails rather than papering over it.
pub fn build_event_proof(
    request: &EventProofRequest,
    evidence: &BlockEvidence,
) -> Result<ProofBundle, ProofError> {
    let count = evidence.receipts.len();
    let index = request.transaction_index;
    if index >= count {
        return Err(ProofError::IndexOutOfRange { index, count });
    }

    let encoded_receipts: Vec<Vec<u8>> = evidence
        .receipts
        .iter()
        .map(ReceiptData::rlp_encoded)
        .collect::<Result<_, ProofError>>()?;
    let trie = ReceiptsTrie::from_encoded_receipts(&encoded_receipts);
    let computed_root = trie.root_hash();
    if computed_root != evidence.header.receipts_root {
        return Err(ProofError::RootMismatch {
            computed: format!("0x{}", hex::encode(computed_root)),
            expected: format!("0x{}", hex::encode(evidence.header.receipts_root)),
        });
    }

    let witness = trie.prove(index);
    let receipt_rlp = &encoded_receipts[index];
    // self-check before anything leaves this process
    verify_inclusion(&computed_root, index, receipt_rlp, &witness)?;

    let extra = ConsensusExtraData::parse(&evidence.header.extra_data)?;
    let contract = decode_hex(&request.source_contract)?;
    let event_hash = event_signature_hash(&request.event_signature);

    let encoded_info = encode_list(&[
        encode_uint(request.destination_system_id),
        encode_bytes(&contract),
        encode_bytes(&event_hash),
        encode_bytes(receipt_rlp),
    ]);

    let attestation = encode_list(&[
        encode_list(&witness),
        encode_bytes(&trie::receipt_key(index)),
        encode_bytes(&computed_root),
        encode_bytes(&evidence.header.hash()),
        encode_bytes(
            &keccak256(&evidence.header.rlp_with_extra(&extra.encode_excluding_seals())),
        ),
        evidence
            .header
            .rlp_with_extra(&extra.encode_excluding_seals()),
        evidence
            .header
            .rlp_with_extra(&extra.encode_excluding_round()),
        extra.seals_field(),
    ]);

    Ok(ProofBundle {
        source_system_id: request.source_system_id,
        destination_system_id: request.destination_system_id,
        encoded_info: format!("0x{}", hex::encode(encoded_info)),
        signature_or_proof: format!("0x{}", hex::encode(attestation)),
    })
}

fn decode_hex(value: &str) -> Result<Vec<u8>, ProofError> {
    Ok(hex::decode(value.trim_start_matches("0x"))?)
}
