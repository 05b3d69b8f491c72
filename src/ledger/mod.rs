//! Ledger connectors
//!
//! One connector per configured network. The trait covers everything the
//! state machines need from a chain: hold management, remote-call
//! submission, validator sync, event scanning and block evidence. Which
//! implementation backs a network is fixed at startup from its configured
//! ledger kind; nothing downstream dispatches on strings.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::proof::BlockEvidence;
use crate::types::{LedgerKind, ProofBundle};

pub mod corda;
pub mod decoder;
pub mod evm;

pub use corda::CordaConnector;
pub use decoder::{DecoderClient, DecoderProof, DecoderRequest, ProofDecoder};
pub use evm::EvmConnector;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Misconfiguration or an operation the ledger kind cannot perform.
    /// Rejected synchronously, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The ledger or its transport hiccuped; the record stays in its
    /// current state and the next sweep tries again.
    #[error("transient ledger error: {0}")]
    Transient(String),
    /// The ledger definitively refused the operation.
    #[error("ledger operation failed: {0}")]
    Failed(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }

    /// Sort a raw transport/contract error into transient or failed by its
    /// message. Anything unrecognized is treated as transient so a flaky
    /// RPC node cannot fail records on its own.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let permanent = lower.contains("revert")
            || lower.contains("invalid")
            || lower.contains("insufficient funds")
            || lower.contains("execution failed")
            || lower.contains("out of gas");
        if permanent {
            LedgerError::Failed(message)
        } else {
            LedgerError::Transient(message)
        }
    }
}

/// Outcome of a submitted transaction after confirmation.
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub tx_hash: String,
    pub block_number: u64,
    pub success: bool,
}

/// Hold placement parameters shared by settlements and swap commits.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    /// Operation id as a 0x-hex 32-byte value.
    pub operation_id: String,
    pub from_account: String,
    pub to_account: String,
    /// Decimal amount string, parsed by the connector.
    pub amount: String,
}

/// An event scan: one named event on one contract, optionally constrained
/// by equality over decoded parameters.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Solidity-style event signature, e.g. `HoldCreated(bytes32,bytes32,bytes32,uint256)`.
    pub event_signature: String,
    /// Equality constraints over decoded parameter names.
    pub param_filters: BTreeMap<String, String>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl EventQuery {
    pub fn new(event_signature: impl Into<String>) -> Self {
        Self {
            event_signature: event_signature.into(),
            param_filters: BTreeMap::new(),
            from_block: None,
            to_block: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.param_filters.insert(name.into(), value.into());
        self
    }

    /// Whether a decoded event satisfies every equality constraint.
    pub fn matches(&self, event: &DecodedEvent) -> bool {
        self.param_filters.iter().all(|(name, expected)| {
            event
                .params
                .get(name)
                .map(|actual| actual.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        })
    }
}

/// One matched on-chain event with its decoded named parameters.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub tx_hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
}

/// The per-network seam between the state machines and a chain.
#[async_trait]
pub trait LedgerConnector: Send + Sync + 'static {
    fn kind(&self) -> LedgerKind;

    fn system_id(&self) -> u64;

    /// Interop contract identity on this network: a 0x address for EVM, a
    /// CorDapp locator for Corda.
    fn contract_address(&self) -> String;

    /// Place a hold (earmark) on the asset ledger.
    async fn create_hold(&self, request: &HoldRequest) -> Result<TxOutcome, LedgerError>;

    /// Execute a previously placed hold, moving the asset.
    async fn execute_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError>;

    /// Cancel a previously placed hold, releasing the asset.
    async fn cancel_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError>;

    /// Submit a remote-call proof bundle produced on another chain.
    async fn submit_remote_call(&self, proof: &ProofBundle) -> Result<TxOutcome, LedgerError>;

    /// Replace the interop validator set.
    async fn update_validators(&self, validators: &[String]) -> Result<TxOutcome, LedgerError>;

    /// Read the current interop validator set.
    async fn read_validators(&self) -> Result<Vec<String>, LedgerError>;

    /// Scan for events matching the query. Returns only matches.
    async fn scan_events(&self, query: &EventQuery) -> Result<Vec<DecodedEvent>, LedgerError>;

    /// Current chain head. Kinds without a block notion reject with
    /// `Configuration`.
    async fn latest_block(&self) -> Result<u64, LedgerError>;

    /// Fetch the header and full receipt list of one block for proof
    /// construction. EVM only; other kinds reject with `Configuration`.
    async fn block_evidence(&self, block_number: u64) -> Result<BlockEvidence, LedgerError>;
}

/// Connectors indexed by network id, built once at startup.
#[derive(Clone, Default)]
pub struct LedgerRegistry {
    connectors: HashMap<u64, Arc<dyn LedgerConnector>>,
}

impl LedgerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn LedgerConnector>) {
        self.connectors.insert(connector.system_id(), connector);
    }

    pub fn get(&self, system_id: u64) -> Result<Arc<dyn LedgerConnector>, LedgerError> {
        self.connectors.get(&system_id).cloned().ok_or_else(|| {
            LedgerError::Configuration(format!("no ledger configured for network {system_id}"))
        })
    }

    pub fn system_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connectors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(params: &[(&str, &str)]) -> DecodedEvent {
        DecodedEvent {
            name: "HoldCreated".into(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tx_hash: "0x01".into(),
            block_number: 1,
            transaction_index: 0,
        }
    }

    #[test]
    fn test_query_matches_on_all_filters() {
        let query = EventQuery::new("HoldCreated(bytes32,bytes32,bytes32,uint256)")
            .with_param("operationId", "0xAB")
            .with_param("amount", "5");
        assert!(query.matches(&event(&[("operationId", "0xab"), ("amount", "5")])));
        assert!(!query.matches(&event(&[("operationId", "0xab"), ("amount", "6")])));
        assert!(!query.matches(&event(&[("amount", "5")])));
    }

    #[test]
    fn test_query_without_filters_matches_everything() {
        let query = EventQuery::new("HoldExecuted(bytes32)");
        assert!(query.matches(&event(&[])));
    }

    #[test]
    fn test_error_classification() {
        assert!(LedgerError::from_message("connection timed out").is_transient());
        assert!(LedgerError::from_message("weird rpc response").is_transient());
        assert!(!LedgerError::from_message("execution reverted: no hold").is_transient());
        assert!(!LedgerError::from_message("invalid address").is_transient());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = LedgerRegistry::new();
        assert!(matches!(
            registry.get(7),
            Err(LedgerError::Configuration(_))
        ));
    }
}
