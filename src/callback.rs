//! Callback delivery
//!
//! Pushes terminal-state notifications to the callback URLs registered on an
//! instruction's filters. Exactly one POST per attempt; retry pressure comes
//! from the `waitingForCommunication` sweeps, not from this module. Delivery
//! failure never changes the outcome of the instruction itself.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::store::Instruction;
use crate::types::InstructionState;

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("callback endpoint rejected notification: {0}")]
    Rejected(String),
    #[error("callback transport error: {0}")]
    Transport(String),
}

/// Delivery seam; tests swap in a recording sink.
#[async_trait]
pub trait CallbackSink: Send + Sync + 'static {
    async fn deliver(&self, url: &str, body: &serde_json::Value) -> Result<(), CallbackError>;
}

/// Registered callback URLs are https because callers know the service by
/// its public name, but delivery goes over the internal network where TLS
/// terminates upstream. When rewriting is enabled the scheme is downgraded
/// before the POST.
pub fn rewrite_callback_url(url: &str, rewrite_https: bool) -> String {
    match url.strip_prefix("https://") {
        Some(rest) if rewrite_https => format!("http://{rest}"),
        _ => url.to_string(),
    }
}

/// The notification body: the stored result for a processed instruction,
/// otherwise the key, final state and error detail.
pub fn notification_body(record: &Instruction) -> serde_json::Value {
    if record.state == InstructionState::Processed {
        if let Some(result) = &record.result {
            return result.clone();
        }
    }
    serde_json::json!({
        "systemId": record.key.system_id,
        "operationId": record.key.operation_id,
        "state": record.state,
        "error": record.error,
    })
}

pub struct CallbackDispatcher {
    client: reqwest::Client,
    rewrite_https: bool,
    bearer_token: Option<String>,
}

impl CallbackDispatcher {
    pub fn new(client: reqwest::Client, rewrite_https: bool, bearer_token: Option<String>) -> Self {
        Self {
            client,
            rewrite_https,
            bearer_token,
        }
    }
}

#[async_trait]
impl CallbackSink for CallbackDispatcher {
    async fn deliver(&self, url: &str, body: &serde_json::Value) -> Result<(), CallbackError> {
        let target = rewrite_callback_url(url, self.rewrite_https);
        debug!(url = %target, "delivering callback");

        let mut request = self.client.post(&target).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %target, %status, "callback endpoint rejected notification");
            return Err(CallbackError::Rejected(status.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InstructionKey, InstructionPayload, SettlementPayload};

    #[test]
    fn test_rewrite_only_touches_https() {
        assert_eq!(
            rewrite_callback_url("https://caller.example/cb", true),
            "http://caller.example/cb"
        );
        assert_eq!(
            rewrite_callback_url("https://caller.example/cb", false),
            "https://caller.example/cb"
        );
        assert_eq!(
            rewrite_callback_url("http://caller.example/cb", true),
            "http://caller.example/cb"
        );
    }

    fn record() -> Instruction {
        Instruction::new(
            InstructionKey::new(1, "0xab"),
            InstructionPayload::Settlement(SettlementPayload {
                trade_id: "O-1".into(),
                from_account: "Bob".into(),
                to_account: "Alice".into(),
                amount: "1".into(),
                use_existing_earmark: false,
                closing_leg: None,
            }),
            None,
            vec![],
        )
    }

    #[test]
    fn test_processed_notification_uses_result() {
        let mut rec = record();
        rec.state = InstructionState::Processed;
        rec.result = Some(serde_json::json!({ "tradeId": "O-1" }));
        assert_eq!(notification_body(&rec)["tradeId"], "O-1");
    }

    #[test]
    fn test_failure_notification_carries_state_and_error() {
        let mut rec = record();
        rec.state = InstructionState::TimedOut;
        rec.error = Some("hold not observed within budget".into());
        let body = notification_body(&rec);
        assert_eq!(body["state"], "timedOut");
        assert_eq!(body["operationId"], "0xab");
        assert_eq!(body["error"], "hold not observed within budget");
    }
}
