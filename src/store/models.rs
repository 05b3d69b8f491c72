//! Instruction records and kind-specific payloads
//!
//! One `Instruction` per logical cross-chain operation. The payload is a
//! typed enum rather than a loose optional-field bag: the record schema is
//! shared across kinds, the payload carries what only that kind needs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{InstructionKind, InstructionState, ProofBundle};

/// Composite identity of an instruction. `operation_id` is deterministically
/// derived (see `hash::derive_operation_id`) so both legs of a swap converge
/// on the same key without a shared sequence generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionKey {
    pub system_id: u64,
    pub operation_id: String,
}

impl InstructionKey {
    pub fn new(system_id: u64, operation_id: impl Into<String>) -> Self {
        Self {
            system_id,
            operation_id: operation_id.into(),
        }
    }
}

impl fmt::Display for InstructionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system_id, self.operation_id)
    }
}

/// Destination filter with an optional callback. A filter without a
/// callback URL means the caller blocks on the admin surface polling the
/// store until the record reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackFilter {
    pub remote_destination_network_id: u64,
    pub callback_url: Option<String>,
}

/// One leg of a trade: debit `from_account`, credit `to_account`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeLeg {
    pub from_account: String,
    pub to_account: String,
    pub amount: String,
}

/// Settlement (asset delivery) parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementPayload {
    pub trade_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: String,
    /// Caller already placed the earmark; skip hold creation.
    #[serde(default)]
    pub use_existing_earmark: bool,
    /// Closing leg of a paired repo obligation. Submitted fire-and-forget
    /// when the opening leg executes; see machine/settlement.rs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_leg: Option<TradeLeg>,
}

/// Full validator-set replacement pushed to each destination filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorSetPayload {
    pub validators: Vec<String>,
}

/// Incremental validator update: the current set is read from the source
/// ledger, merged, then pushed to each destination filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorUpdatePayload {
    #[serde(default)]
    pub additions: Vec<String>,
    #[serde(default)]
    pub removals: Vec<String>,
}

/// Atomic-swap commit/claim/revert parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapPayload {
    pub trade_id: String,
    pub sender_account: String,
    pub receiver_account: String,
    pub amount: String,
    /// Designated relayer/validator signer endpoints for the threshold
    /// attestation over the claim/revert message.
    pub signers: Vec<String>,
    pub signatures_threshold: u32,
}

/// Kind-specific payload. Tagged so JSONB rows are self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InstructionPayload {
    Settlement(SettlementPayload),
    ValidatorSet(ValidatorSetPayload),
    ValidatorUpdate(ValidatorUpdatePayload),
    Swap(SwapPayload),
}

impl InstructionPayload {
    pub fn kind(&self) -> InstructionKind {
        match self {
            InstructionPayload::Settlement(_) => InstructionKind::Settlement,
            InstructionPayload::ValidatorSet(_) => InstructionKind::ValidatorSet,
            InstructionPayload::ValidatorUpdate(_) => InstructionKind::ValidatorUpdate,
            InstructionPayload::Swap(_) => InstructionKind::Swap,
        }
    }

    pub fn as_settlement(&self) -> Option<&SettlementPayload> {
        match self {
            InstructionPayload::Settlement(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_swap(&self) -> Option<&SwapPayload> {
        match self {
            InstructionPayload::Swap(p) => Some(p),
            _ => None,
        }
    }
}

/// The central entity: one persisted record per logical cross-chain
/// operation, mutated only by its state machine and by validated external
/// patch/delete requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    #[serde(flatten)]
    pub key: InstructionKey,
    pub kind: InstructionKind,
    pub state: InstructionState,
    /// Set when the instruction originated cross-chain; gates the
    /// cancellation sub-protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_system_id: Option<u64>,
    #[serde(default)]
    pub filters: Vec<CallbackFilter>,
    pub payload: InstructionPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Last failure detail; only meaningful when state = failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Instruction {
    /// Create a fresh record in the `confirmed` state.
    pub fn new(
        key: InstructionKey,
        payload: InstructionPayload,
        foreign_system_id: Option<u64>,
        filters: Vec<CallbackFilter>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            kind: payload.kind(),
            state: InstructionState::Confirmed,
            foreign_system_id,
            filters,
            payload,
            result: None,
            error: None,
            created_at: now,
            last_update: now,
        }
    }

    /// Wall-clock time since the last persisted transition.
    pub fn since_last_update(&self) -> Duration {
        Utc::now() - self.last_update
    }

    /// Wall-clock age of the record.
    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    /// True once the per-state wall-clock budget is spent.
    pub fn budget_exceeded(&self, budget: std::time::Duration) -> bool {
        self.since_last_update()
            >= Duration::from_std(budget).unwrap_or_else(|_| Duration::seconds(300))
    }

    /// Filters that carry a callback URL.
    pub fn callback_filters(&self) -> impl Iterator<Item = (&CallbackFilter, &str)> {
        self.filters
            .iter()
            .filter_map(|f| f.callback_url.as_deref().map(|url| (f, url)))
    }

    /// Destination network ids from the filters, callback or not.
    pub fn destination_networks(&self) -> Vec<u64> {
        self.filters
            .iter()
            .map(|f| f.remote_destination_network_id)
            .collect()
    }
}

/// Build the settlement success result embedded in the record.
pub fn settlement_result(trade_id: &str, proof: &ProofBundle) -> serde_json::Value {
    serde_json::json!({
        "tradeId": trade_id,
        "systemId": proof.destination_system_id,
        "sourceSystemId": proof.source_system_id,
        "encodedInfo": proof.encoded_info,
        "signatureOrProof": proof.signature_or_proof,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstructionKind;

    fn settlement_payload() -> InstructionPayload {
        InstructionPayload::Settlement(SettlementPayload {
            trade_id: "O-101".into(),
            from_account: "Bob".into(),
            to_account: "Alice".into(),
            amount: "1".into(),
            use_existing_earmark: false,
            closing_leg: None,
        })
    }

    #[test]
    fn test_new_record_is_confirmed() {
        let record = Instruction::new(
            InstructionKey::new(1, "0xabc"),
            settlement_payload(),
            Some(2),
            vec![],
        );
        assert_eq!(record.state, InstructionState::Confirmed);
        assert_eq!(record.kind, InstructionKind::Settlement);
        assert_eq!(record.created_at, record.last_update);
        assert!(record.result.is_none());
    }

    #[test]
    fn test_payload_round_trips_through_json() {
        let payload = settlement_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "settlement");
        assert_eq!(json["tradeId"], "O-101");
        let back: InstructionPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_budget_exceeded_uses_last_update() {
        let mut record = Instruction::new(
            InstructionKey::new(1, "0xabc"),
            settlement_payload(),
            None,
            vec![],
        );
        assert!(!record.budget_exceeded(std::time::Duration::from_secs(300)));
        record.last_update = Utc::now() - Duration::minutes(10);
        assert!(record.budget_exceeded(std::time::Duration::from_secs(300)));
    }

    #[test]
    fn test_callback_filters_skips_blocking_entries() {
        let record = Instruction::new(
            InstructionKey::new(1, "0xabc"),
            settlement_payload(),
            None,
            vec![
                CallbackFilter {
                    remote_destination_network_id: 2,
                    callback_url: Some("https://caller/cb".into()),
                },
                CallbackFilter {
                    remote_destination_network_id: 3,
                    callback_url: None,
                },
            ],
        );
        let urls: Vec<&str> = record.callback_filters().map(|(_, url)| url).collect();
        assert_eq!(urls, vec!["https://caller/cb"]);
        assert_eq!(record.destination_networks(), vec![2, 3]);
    }

    #[test]
    fn test_settlement_result_shape() {
        let proof = ProofBundle {
            source_system_id: 1,
            destination_system_id: 2,
            encoded_info: "0x01".into(),
            signature_or_proof: "0x02".into(),
        };
        let result = settlement_result("O-101", &proof);
        assert_eq!(result["tradeId"], "O-101");
        assert_eq!(result["systemId"], 2);
        assert_eq!(result["sourceSystemId"], 1);
    }
}
