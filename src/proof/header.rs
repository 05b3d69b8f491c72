//! Source block headers and their consensus encodings
//!
//! IBFT/QBFT networks commit to a block under a header encoding that strips
//! the commit seals (and, for the signed digest, the round number) out of
//! the extra-data field. A destination chain verifying a proof needs those
//! variants alongside the raw seal field, so the pipeline re-encodes the
//! header three ways from one fetched header.

use crate::hash::keccak256;

use super::rlp::{decode_uint, encode_bytes, encode_list, encode_uint, split_list, RlpItem};
use super::ProofError;

/// Header fields of the source block, as fetched from the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlockHeader {
    pub parent_hash: [u8; 32],
    pub ommers_hash: [u8; 32],
    pub beneficiary: [u8; 20],
    pub state_root: [u8; 32],
    pub transactions_root: [u8; 32],
    pub receipts_root: [u8; 32],
    pub logs_bloom: Vec<u8>,
    pub difficulty: u64,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: [u8; 32],
    pub nonce: [u8; 8],
    pub base_fee_per_gas: Option<u64>,
}

impl SourceBlockHeader {
    /// RLP encoding with the extra-data field substituted. Passing the
    /// fetched `extra_data` unchanged yields the canonical encoding.
    pub fn rlp_with_extra(&self, extra_data: &[u8]) -> Vec<u8> {
        let mut fields = vec![
            encode_bytes(&self.parent_hash),
            encode_bytes(&self.ommers_hash),
            encode_bytes(&self.beneficiary),
            encode_bytes(&self.state_root),
            encode_bytes(&self.transactions_root),
            encode_bytes(&self.receipts_root),
            encode_bytes(&self.logs_bloom),
            encode_uint(self.difficulty),
            encode_uint(self.number),
            encode_uint(self.gas_limit),
            encode_uint(self.gas_used),
            encode_uint(self.timestamp),
            encode_bytes(extra_data),
            encode_bytes(&self.mix_hash),
            encode_bytes(&self.nonce),
        ];
        if let Some(base_fee) = self.base_fee_per_gas {
            fields.push(encode_uint(base_fee));
        }
        encode_list(&fields)
    }

    pub fn rlp_encoded(&self) -> Vec<u8> {
        self.rlp_with_extra(&self.extra_data)
    }

    pub fn hash(&self) -> [u8; 32] {
        keccak256(&self.rlp_encoded())
    }
}

/// Parsed IBFT/QBFT extra-data: RLP([vanity, validators, vote, round,
/// seals]). The vote item is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusExtraData {
    pub vanity: Vec<u8>,
    pub validators: Vec<Vec<u8>>,
    pub vote_raw: Vec<u8>,
    pub round: u32,
    pub seals: Vec<Vec<u8>>,
}

impl ConsensusExtraData {
    pub fn parse(extra_data: &[u8]) -> Result<Self, ProofError> {
        let items = split_list(extra_data)?;
        if items.len() != 5 {
            return Err(ProofError::Malformed(format!(
                "consensus extra data has {} items, expected 5",
                items.len()
            )));
        }
        let vanity = items[0].payload.to_vec();
        let validators = byte_string_list(&items[1])?;
        let vote_raw = items[2].raw.to_vec();
        let round = decode_uint(items[3].payload)? as u32;
        let seals = byte_string_list(&items[4])?;
        Ok(Self {
            vanity,
            validators,
            vote_raw,
            round,
            seals,
        })
    }

    /// Encoding used for the committed block hash: everything except the
    /// commit seals.
    pub fn encode_excluding_seals(&self) -> Vec<u8> {
        encode_list(&[
            encode_bytes(&self.vanity),
            encode_validator_list(&self.validators),
            self.vote_raw.clone(),
            encode_uint(u64::from(self.round)),
            encode_list(&[]),
        ])
    }

    /// Encoding the validators actually sign: seals and round both dropped.
    pub fn encode_excluding_round(&self) -> Vec<u8> {
        encode_list(&[
            encode_bytes(&self.vanity),
            encode_validator_list(&self.validators),
            self.vote_raw.clone(),
            encode_uint(0),
            encode_list(&[]),
        ])
    }

    /// The raw seal field: the commit signatures as an RLP list.
    pub fn seals_field(&self) -> Vec<u8> {
        encode_validator_list(&self.seals)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_list(&[
            encode_bytes(&self.vanity),
            encode_validator_list(&self.validators),
            self.vote_raw.clone(),
            encode_uint(u64::from(self.round)),
            encode_validator_list(&self.seals),
        ])
    }
}

fn encode_validator_list(entries: &[Vec<u8>]) -> Vec<u8> {
    let items: Vec<Vec<u8>> = entries.iter().map(|e| encode_bytes(e)).collect();
    encode_list(&items)
}

fn byte_string_list(item: &RlpItem<'_>) -> Result<Vec<Vec<u8>>, ProofError> {
    if !item.is_list {
        return Err(ProofError::Malformed(
            "expected a list of byte strings".into(),
        ));
    }
    let inner = split_list(item.raw)?;
    inner
        .iter()
        .map(|i| {
            if i.is_list {
                Err(ProofError::Malformed("nested list in byte-string list".into()))
            } else {
                Ok(i.payload.to_vec())
            }
        })
        .collect()
}
