//! Decoder service client
//!
//! Corda (and any other non-EVM) proof material is produced by an external
//! decoder service that understands that ledger's transaction format. The
//! orchestrator treats its output as opaque: the proof fields are passed
//! through into the bundle unmodified.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::types::ProofBundle;

use super::LedgerError;

/// A proof-construction request to the decoder service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoderRequest {
    pub blockchain_id: u64,
    pub contract_address: String,
    pub function_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub with_hidden_auth_params: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_blockchain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_contract_address: Option<String>,
}

impl DecoderRequest {
    pub fn new(
        blockchain_id: u64,
        contract_address: impl Into<String>,
        function_name: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            blockchain_id,
            contract_address: contract_address.into(),
            function_name: function_name.into(),
            parameters,
            with_hidden_auth_params: false,
            auth_blockchain_id: None,
            auth_contract_address: None,
        }
    }

    /// Attach the hidden authentication parameters identifying the calling
    /// network and contract on the destination side.
    pub fn with_auth(mut self, blockchain_id: u64, contract_address: impl Into<String>) -> Self {
        self.with_hidden_auth_params = true;
        self.auth_blockchain_id = Some(blockchain_id);
        self.auth_contract_address = Some(contract_address.into());
        self
    }
}

/// The decoder's proof output, passed through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecoderProof {
    pub event_sig: String,
    pub encoded_info: String,
    pub signature_or_proof: String,
}

impl DecoderProof {
    pub fn into_bundle(self, source_system_id: u64, destination_system_id: u64) -> ProofBundle {
        ProofBundle {
            source_system_id,
            destination_system_id,
            encoded_info: self.encoded_info,
            signature_or_proof: self.signature_or_proof,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DecoderResponse {
    proof: DecoderProof,
}

/// Proof construction seam; tests swap in a canned implementation.
#[async_trait]
pub trait ProofDecoder: Send + Sync + 'static {
    async fn request_proof(&self, request: &DecoderRequest) -> Result<DecoderProof, LedgerError>;
}

pub struct DecoderClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl DecoderClient {
    pub fn new(client: reqwest::Client, base_url: &Url) -> Result<Self, LedgerError> {
        let endpoint = base_url
            .join("proofs")
            .map_err(|e| LedgerError::Configuration(format!("bad decoder url: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ProofDecoder for DecoderClient {
    async fn request_proof(&self, request: &DecoderRequest) -> Result<DecoderProof, LedgerError> {
        debug!(
            blockchain_id = request.blockchain_id,
            function = %request.function_name,
            "requesting proof from decoder service"
        );
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| LedgerError::Transient(format!("decoder unreachable: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Failed(format!(
                "decoder rejected request ({status}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(LedgerError::Transient(format!("decoder returned {status}")));
        }

        let body: DecoderResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Transient(format!("bad decoder response: {e}")))?;
        Ok(body.proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_camel_case() {
        let request = DecoderRequest::new(
            5,
            "O=PartyA,L=London,C=GB",
            "cancelHold",
            serde_json::json!({ "operationId": "0xab" }),
        )
        .with_auth(1, "0x42");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["blockchainId"], 5);
        assert_eq!(json["functionName"], "cancelHold");
        assert_eq!(json["withHiddenAuthParams"], true);
        assert_eq!(json["authBlockchainId"], 1);
        assert_eq!(json["parameters"]["operationId"], "0xab");
    }

    #[test]
    fn test_auth_params_omitted_by_default() {
        let request = DecoderRequest::new(5, "addr", "claim", serde_json::Value::Null);
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("authBlockchainId").is_none());
        assert_eq!(json["withHiddenAuthParams"], false);
    }

    #[test]
    fn test_proof_passes_through_into_bundle() {
        let proof = DecoderProof {
            event_sig: "HoldExecuted(bytes32)".into(),
            encoded_info: "0x01".into(),
            signature_or_proof: "0x02".into(),
        };
        let bundle = proof.into_bundle(5, 1);
        assert_eq!(bundle.source_system_id, 5);
        assert_eq!(bundle.destination_system_id, 1);
        assert_eq!(bundle.encoded_info, "0x01");
    }
}
