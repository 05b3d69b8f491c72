//! Test doubles for the machine and scheduler test suites
//!
//! In-memory stand-ins for every external seam: a scriptable ledger
//! connector, a canned decoder, a recording callback sink and static
//! signers. Kept in the crate proper so integration tests under tests/ can
//! use them too.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::callback::{CallbackError, CallbackSink};
use crate::hash::bytes32_to_hex;
use crate::ledger::{
    DecodedEvent, DecoderProof, DecoderRequest, EventQuery, HoldRequest, LedgerConnector,
    LedgerError, LedgerRegistry, ProofDecoder, TxOutcome,
};
use crate::machine::OrchestratorContext;
use crate::proof::{
    ConsensusExtraData, BlockEvidence, LogData, ReceiptData, ReceiptsTrie, SignerClient,
    SourceBlockHeader,
};
use crate::store::MemoryInstructionStore;
use crate::types::{LedgerKind, ProofBundle};

/// Block evidence that is internally consistent: one receipt, receipts root
/// recomputed from it. Proofs built against it pass the pipeline self-check
/// for events at transaction index 0.
pub fn sample_evidence() -> BlockEvidence {
    let receipt = ReceiptData {
        tx_type: 0,
        status: true,
        cumulative_gas_used: 21_000,
        logs_bloom: format!("0x{}", hex::encode([0u8; 256])),
        logs: vec![LogData {
            address: format!("0x{}", hex::encode([0x42; 20])),
            topics: vec![format!("0x{}", hex::encode([0x11; 32]))],
            data: "0x01".to_string(),
        }],
    };
    let encoded = vec![receipt.rlp_encoded().expect("fixture receipt encodes")];
    let receipts_root = ReceiptsTrie::from_encoded_receipts(&encoded).root_hash();

    let extra = ConsensusExtraData {
        vanity: vec![0u8; 32],
        validators: vec![vec![0x11; 20]],
        vote_raw: crate::proof::rlp::encode_bytes(&[]),
        round: 0,
        seals: vec![vec![0xaa; 65]],
    };
    BlockEvidence {
        header: SourceBlockHeader {
            parent_hash: [1; 32],
            ommers_hash: [2; 32],
            beneficiary: [3; 20],
            state_root: [4; 32],
            transactions_root: [5; 32],
            receipts_root,
            logs_bloom: vec![0; 256],
            difficulty: 1,
            number: 1,
            gas_limit: 30_000_000,
            gas_used: 21_000,
            timestamp: 1_700_000_000,
            extra_data: extra.encode(),
            mix_hash: [7; 32],
            nonce: [0; 8],
            base_fee_per_gas: None,
        },
        receipts: vec![receipt],
    }
}

/// Scriptable in-memory ledger. Hold operations append matching events so a
/// following sweep observes them, mirroring how a healthy chain behaves;
/// tests needing a stalled chain flip `auto_emit` off.
pub struct MockLedger {
    system_id: u64,
    kind: LedgerKind,
    pub auto_emit: AtomicBool,
    pub events: Mutex<Vec<DecodedEvent>>,
    /// (operation name, detail) log of every write call.
    pub calls: Mutex<Vec<(String, String)>>,
    pub fail_next: Mutex<Option<LedgerError>>,
    pub validators: Mutex<Vec<String>>,
}

impl MockLedger {
    pub fn new(system_id: u64, kind: LedgerKind) -> Arc<Self> {
        Arc::new(Self {
            system_id,
            kind,
            auto_emit: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            validators: Mutex::new(Vec::new()),
        })
    }

    pub fn push_event(&self, name: &str, params: &[(&str, &str)]) {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut events = self.events.lock().unwrap();
        let tx_hash = format!("0x{:064x}", events.len() + 1);
        events.push(DecodedEvent {
            name: name.to_string(),
            params,
            tx_hash,
            block_number: 1,
            transaction_index: 0,
        });
    }

    pub fn inject_failure(&self, error: LedgerError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    fn take_failure(&self) -> Option<LedgerError> {
        self.fail_next.lock().unwrap().take()
    }

    fn record_call(&self, name: &str, detail: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), detail.to_string()));
    }

    fn outcome(&self) -> TxOutcome {
        TxOutcome {
            tx_hash: format!("0x{:064x}", self.calls.lock().unwrap().len()),
            block_number: 1,
            success: true,
        }
    }
}

#[async_trait]
impl LedgerConnector for MockLedger {
    fn kind(&self) -> LedgerKind {
        self.kind
    }

    fn system_id(&self) -> u64 {
        self.system_id
    }

    fn contract_address(&self) -> String {
        format!("0x{}", hex::encode([0x42; 20]))
    }

    async fn create_hold(&self, request: &HoldRequest) -> Result<TxOutcome, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.record_call("createHold", &request.operation_id);
        if self.auto_emit.load(Ordering::SeqCst) {
            self.push_event(
                "HoldCreated",
                &[
                    ("operationId", &request.operation_id),
                    ("amount", &request.amount),
                ],
            );
        }
        Ok(self.outcome())
    }

    async fn execute_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.record_call("executeHold", operation_id);
        if self.auto_emit.load(Ordering::SeqCst) {
            self.push_event("HoldExecuted", &[("operationId", operation_id)]);
        }
        Ok(self.outcome())
    }

    async fn cancel_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.record_call("cancelHold", operation_id);
        if self.auto_emit.load(Ordering::SeqCst) {
            self.push_event("HoldCancelled", &[("operationId", operation_id)]);
        }
        Ok(self.outcome())
    }

    async fn submit_remote_call(&self, proof: &ProofBundle) -> Result<TxOutcome, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.record_call("performCallFromRemoteChain", &proof.encoded_info);
        Ok(self.outcome())
    }

    async fn update_validators(&self, validators: &[String]) -> Result<TxOutcome, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.record_call("setValidators", &validators.join(","));
        *self.validators.lock().unwrap() = validators.to_vec();
        if self.auto_emit.load(Ordering::SeqCst) {
            self.push_event(
                "ValidatorSetUpdated",
                &[("validatorCount", &validators.len().to_string())],
            );
        }
        Ok(self.outcome())
    }

    async fn read_validators(&self) -> Result<Vec<String>, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(self.validators.lock().unwrap().clone())
    }

    async fn scan_events(&self, query: &EventQuery) -> Result<Vec<DecodedEvent>, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let wanted = query
            .event_signature
            .split('(')
            .next()
            .unwrap_or(&query.event_signature);
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == wanted && query.matches(e))
            .cloned()
            .collect())
    }

    async fn latest_block(&self) -> Result<u64, LedgerError> {
        Ok(1)
    }

    async fn block_evidence(&self, _block_number: u64) -> Result<BlockEvidence, LedgerError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(sample_evidence())
    }
}

/// Decoder double: answers every request with the same proof and records
/// what was asked.
pub struct CannedProofDecoder {
    pub requests: Mutex<Vec<DecoderRequest>>,
    pub response: Mutex<Result<DecoderProof, String>>,
}

impl CannedProofDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            response: Mutex::new(Ok(DecoderProof {
                event_sig: "HoldCreated(bytes32,bytes32,bytes32,uint256)".into(),
                encoded_info: "0xdec0ded".into(),
                signature_or_proof: "0x5161".into(),
            })),
        })
    }
}

#[async_trait]
impl ProofDecoder for CannedProofDecoder {
    async fn request_proof(&self, request: &DecoderRequest) -> Result<DecoderProof, LedgerError> {
        self.requests.lock().unwrap().push(request.clone());
        self.response
            .lock()
            .unwrap()
            .clone()
            .map_err(LedgerError::Failed)
    }
}

/// Callback sink that records deliveries and can be told to fail.
pub struct RecordingCallbacks {
    pub delivered: Mutex<Vec<(String, serde_json::Value)>>,
    pub fail_all: AtomicBool,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            fail_all: AtomicBool::new(false),
        })
    }

    pub fn delivery_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl CallbackSink for RecordingCallbacks {
    async fn deliver(&self, url: &str, body: &serde_json::Value) -> Result<(), CallbackError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(CallbackError::Transport("connection refused".into()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        Ok(())
    }
}

/// Signer double: every endpoint returns a distinct deterministic signature.
pub struct StaticSigners;

#[async_trait]
impl SignerClient for StaticSigners {
    async fn request_signature(&self, endpoint: &str, message: &str) -> eyre::Result<String> {
        let mut input = endpoint.as_bytes().to_vec();
        input.extend_from_slice(message.as_bytes());
        Ok(bytes32_to_hex(&crate::hash::keccak256(&input)))
    }
}

/// A ready-to-use context over in-memory doubles: network 1 is the local
/// EVM chain, network 2 the counterparty.
pub struct TestHarness {
    pub ctx: OrchestratorContext,
    pub store: Arc<MemoryInstructionStore>,
    pub local: Arc<MockLedger>,
    pub foreign: Arc<MockLedger>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub decoder: Arc<CannedProofDecoder>,
}

pub const LOCAL_SYSTEM: u64 = 1;
pub const FOREIGN_SYSTEM: u64 = 2;

pub fn harness() -> TestHarness {
    harness_with_foreign_kind(LedgerKind::Evm)
}

pub fn harness_with_foreign_kind(foreign_kind: LedgerKind) -> TestHarness {
    let store = Arc::new(MemoryInstructionStore::new());
    let local = MockLedger::new(LOCAL_SYSTEM, LedgerKind::Evm);
    let foreign = MockLedger::new(FOREIGN_SYSTEM, foreign_kind);
    let callbacks = RecordingCallbacks::new();
    let decoder = CannedProofDecoder::new();

    let mut ledgers = LedgerRegistry::new();
    ledgers.register(local.clone());
    ledgers.register(foreign.clone());

    let ctx = OrchestratorContext {
        store: store.clone(),
        ledgers,
        decoder: decoder.clone(),
        callbacks: callbacks.clone(),
        signers: Arc::new(StaticSigners),
        state_budget: Duration::from_secs(300),
        communication_budget: Duration::from_secs(300),
    };

    TestHarness {
        ctx,
        store,
        local,
        foreign,
        callbacks,
        decoder,
    }
}
