//! Corda ledger connector
//!
//! Corda networks are reached exclusively through the decoder service, which
//! speaks the CorDapp's flow API and produces notarisation proofs. The
//! connector translates each trait operation into a decoder request and
//! passes the returned proof material through untouched. Hold placement and
//! block evidence are EVM concepts with no Corda equivalent here; those
//! operations are rejected synchronously.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::hash::{bytes32_to_hex, keccak256};
use crate::proof::BlockEvidence;
use crate::types::{LedgerKind, ProofBundle};

use super::decoder::{DecoderRequest, ProofDecoder};
use super::{DecodedEvent, EventQuery, HoldRequest, LedgerConnector, LedgerError, TxOutcome};

pub struct CordaConnector {
    system_id: u64,
    /// CorDapp contract identity, e.g. an X.500 party/contract locator.
    contract_address: String,
    decoder: Arc<dyn ProofDecoder>,
    /// Local network identity attached as hidden auth params so the
    /// CorDapp can verify who is calling.
    auth_system_id: u64,
    auth_contract_address: String,
}

impl CordaConnector {
    pub fn new(
        system_id: u64,
        contract_address: impl Into<String>,
        decoder: Arc<dyn ProofDecoder>,
        auth_system_id: u64,
        auth_contract_address: impl Into<String>,
    ) -> Self {
        Self {
            system_id,
            contract_address: contract_address.into(),
            decoder,
            auth_system_id,
            auth_contract_address: auth_contract_address.into(),
        }
    }

    fn request(&self, function_name: &str, parameters: serde_json::Value) -> DecoderRequest {
        DecoderRequest::new(
            self.system_id,
            self.contract_address.clone(),
            function_name,
            parameters,
        )
        .with_auth(self.auth_system_id, self.auth_contract_address.clone())
    }

    fn unsupported(&self, operation: &str) -> LedgerError {
        LedgerError::Configuration(format!(
            "operation {operation} is not supported on corda network {}",
            self.system_id
        ))
    }
}

/// The decoder has no transaction hash to report; derive a stable reference
/// from the proof material so logs and results stay correlatable.
fn synthetic_outcome(encoded_info: &str) -> TxOutcome {
    TxOutcome {
        tx_hash: bytes32_to_hex(&keccak256(encoded_info.as_bytes())),
        block_number: 0,
        success: true,
    }
}

#[async_trait]
impl LedgerConnector for CordaConnector {
    fn kind(&self) -> LedgerKind {
        LedgerKind::Corda
    }

    fn system_id(&self) -> u64 {
        self.system_id
    }

    fn contract_address(&self) -> String {
        self.contract_address.clone()
    }

    async fn create_hold(&self, _request: &HoldRequest) -> Result<TxOutcome, LedgerError> {
        Err(self.unsupported("createHold"))
    }

    async fn execute_hold(&self, _operation_id: &str) -> Result<TxOutcome, LedgerError> {
        Err(self.unsupported("executeHold"))
    }

    async fn cancel_hold(&self, operation_id: &str) -> Result<TxOutcome, LedgerError> {
        let proof = self
            .decoder
            .request_proof(&self.request(
                "cancelHold",
                serde_json::json!({ "operationId": operation_id }),
            ))
            .await?;
        debug!(
            system_id = self.system_id,
            operation_id, "corda hold cancellation relayed via decoder"
        );
        Ok(synthetic_outcome(&proof.encoded_info))
    }

    async fn submit_remote_call(&self, proof: &ProofBundle) -> Result<TxOutcome, LedgerError> {
        let relayed = self
            .decoder
            .request_proof(&self.request(
                "performCallFromRemoteChain",
                serde_json::json!({
                    "sourceSystemId": proof.source_system_id,
                    "encodedInfo": proof.encoded_info,
                    "signatureOrProof": proof.signature_or_proof,
                }),
            ))
            .await?;
        Ok(synthetic_outcome(&relayed.encoded_info))
    }

    async fn update_validators(&self, validators: &[String]) -> Result<TxOutcome, LedgerError> {
        let relayed = self
            .decoder
            .request_proof(
                &self.request("setValidators", serde_json::json!({ "validators": validators })),
            )
            .await?;
        Ok(synthetic_outcome(&relayed.encoded_info))
    }

    async fn read_validators(&self) -> Result<Vec<String>, LedgerError> {
        Err(self.unsupported("getValidators"))
    }

    /// Event observation on Corda is a decoder query: a proof for the event
    /// means it happened; a rejection means it has not happened yet.
    async fn scan_events(&self, query: &EventQuery) -> Result<Vec<DecodedEvent>, LedgerError> {
        let parameters = serde_json::to_value(&query.param_filters)
            .map_err(|e| LedgerError::Configuration(format!("bad filter params: {e}")))?;
        let result = self
            .decoder
            .request_proof(&self.request(&query.event_signature, parameters))
            .await;

        match result {
            Ok(proof) => Ok(vec![DecodedEvent {
                name: query.event_signature.clone(),
                params: query.param_filters.clone(),
                tx_hash: bytes32_to_hex(&keccak256(proof.encoded_info.as_bytes())),
                block_number: 0,
                transaction_index: 0,
            }]),
            Err(LedgerError::Failed(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn latest_block(&self) -> Result<u64, LedgerError> {
        Err(self.unsupported("latestBlock"))
    }

    async fn block_evidence(&self, _block_number: u64) -> Result<BlockEvidence, LedgerError> {
        Err(self.unsupported("blockEvidence"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::decoder::DecoderProof;
    use std::sync::Mutex;

    struct CannedDecoder {
        responses: Mutex<Vec<Result<DecoderProof, LedgerError>>>,
        seen: Mutex<Vec<DecoderRequest>>,
    }

    impl CannedDecoder {
        fn new(responses: Vec<Result<DecoderProof, LedgerError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProofDecoder for CannedDecoder {
        async fn request_proof(
            &self,
            request: &DecoderRequest,
        ) -> Result<DecoderProof, LedgerError> {
            self.seen.lock().unwrap().push(request.clone());
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn proof() -> DecoderProof {
        DecoderProof {
            event_sig: "HoldCancelled(bytes32)".into(),
            encoded_info: "0xaa".into(),
            signature_or_proof: "0xbb".into(),
        }
    }

    fn connector(decoder: Arc<CannedDecoder>) -> CordaConnector {
        CordaConnector::new(5, "O=Registry,L=London,C=GB", decoder, 1, "0x42")
    }

    #[tokio::test]
    async fn test_cancel_hold_carries_auth_params() {
        let decoder = Arc::new(CannedDecoder::new(vec![Ok(proof())]));
        let outcome = connector(decoder.clone()).cancel_hold("0xab").await.unwrap();
        assert!(outcome.success);

        let seen = decoder.seen.lock().unwrap();
        assert_eq!(seen[0].function_name, "cancelHold");
        assert!(seen[0].with_hidden_auth_params);
        assert_eq!(seen[0].auth_blockchain_id, Some(1));
        assert_eq!(seen[0].parameters["operationId"], "0xab");
    }

    #[tokio::test]
    async fn test_scan_maps_rejection_to_no_events() {
        let decoder = Arc::new(CannedDecoder::new(vec![
            Err(LedgerError::Failed("no such state".into())),
            Err(LedgerError::Transient("gateway down".into())),
        ]));
        let conn = connector(decoder);
        let query = EventQuery::new("HoldCreated(bytes32,bytes32,bytes32,uint256)")
            .with_param("operationId", "0xab");

        let events = conn.scan_events(&query).await.unwrap();
        assert!(events.is_empty());

        // transport trouble is not "not observed"
        assert!(conn.scan_events(&query).await.is_err());
    }

    #[tokio::test]
    async fn test_hold_placement_rejected_synchronously() {
        let decoder = Arc::new(CannedDecoder::new(vec![]));
        let conn = connector(decoder);
        let request = HoldRequest {
            operation_id: "0xab".into(),
            from_account: "Bob".into(),
            to_account: "Alice".into(),
            amount: "1".into(),
        };
        assert!(matches!(
            conn.create_hold(&request).await,
            Err(LedgerError::Configuration(_))
        ));
    }
}
