//! Threshold signature collection for swap claims and reverts
//!
//! Fans a message out to the designated signer endpoints and keeps whatever
//! well-formed signatures come back. The quorum check is k-of-n; individual
//! signer failures and malformed responses are discarded, not fatal.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ProofError;

/// One signing endpoint. The HTTP implementation posts the message and
/// expects a hex signature back; tests swap in a canned implementation.
#[async_trait]
pub trait SignerClient: Send + Sync + 'static {
    async fn request_signature(&self, endpoint: &str, message: &str) -> eyre::Result<String>;
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

pub struct HttpSignerClient {
    client: reqwest::Client,
}

impl HttpSignerClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SignerClient for HttpSignerClient {
    async fn request_signature(&self, endpoint: &str, message: &str) -> eyre::Result<String> {
        let response = self
            .client
            .post(endpoint)
            .json(&SignRequest { message })
            .send()
            .await?
            .error_for_status()?;
        let body: SignResponse = response.json().await?;
        Ok(body.signature)
    }
}

/// The collected quorum: the signed message and every accepted signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdAttestation {
    pub message: String,
    pub signatures: Vec<String>,
}

/// Request a signature over `message` from every signer and collect the
/// well-formed responses. Fails only when the quorum cannot be reached.
pub async fn collect_signatures(
    client: &dyn SignerClient,
    signers: &[String],
    threshold: u32,
    message: &str,
) -> Result<ThresholdAttestation, ProofError> {
    let requests = signers
        .iter()
        .map(|endpoint| client.request_signature(endpoint, message));
    let responses = join_all(requests).await;

    let mut signatures: Vec<String> = Vec::with_capacity(signers.len());
    for (endpoint, response) in signers.iter().zip(responses) {
        match response {
            Ok(signature) if is_well_formed_signature(&signature) => {
                if signatures.contains(&signature) {
                    debug!(endpoint, "duplicate signature discarded");
                } else {
                    signatures.push(signature);
                }
            }
            Ok(signature) => {
                warn!(endpoint, signature, "malformed signature discarded");
            }
            Err(e) => {
                warn!(endpoint, error = %e, "signer request failed");
            }
        }
    }

    if (signatures.len() as u32) < threshold {
        return Err(ProofError::QuorumNotReached {
            collected: signatures.len(),
            threshold,
            signers: signers.len(),
        });
    }
    Ok(ThresholdAttestation {
        message: message.to_string(),
        signatures,
    })
}

/// A signature is accepted when it is 0x-prefixed, non-empty hex.
pub fn is_well_formed_signature(signature: &str) -> bool {
    let Some(body) = signature.strip_prefix("0x") else {
        return false;
    };
    !body.is_empty() && body.len() % 2 == 0 && body.chars().all(|c| c.is_ascii_hexdigit())
}
