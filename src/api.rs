//! Admin HTTP surface
//!
//! Instruction submission, inspection, external state patches and deletes,
//! plus the usual health/metrics/status endpoints. Submissions whose
//! filters all carry callback URLs are acknowledged immediately; a
//! submission with any callback-less filter blocks, polling the store until
//! the record reaches a terminal state or the synchronous wait runs out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::hash::{bytes32_to_hex, derive_operation_id, keccak256};
use crate::machine::OrchestratorContext;
use crate::metrics;
use crate::scheduler::UpdateRequest;
use crate::store::{CallbackFilter, Instruction, InstructionKey, InstructionPayload, StoreError};
use crate::types::{is_transition_allowed, InstructionKind, InstructionState};

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<OrchestratorContext>,
    /// Per-kind scheduler inboxes for externally requested transitions.
    pub inboxes: Arc<HashMap<InstructionKind, mpsc::Sender<UpdateRequest>>>,
    /// System id records are created under when the caller does not name one.
    pub local_system_id: u64,
    /// How long a blocking submission polls before giving up with 202.
    pub sync_wait: Duration,
    pub sync_poll: Duration,
    pub started_at: DateTime<Utc>,
}

/// Uniform error body; the status code carries the category.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::Duplicate(_) => StatusCode::CONFLICT,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::TransitionNotAllowed { .. } | StoreError::DeleteNotAllowed(_) => {
                StatusCode::CONFLICT
            }
            StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstructionRequest {
    /// Optional; derived from the payload when absent.
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub system_id: Option<u64>,
    #[serde(default)]
    pub foreign_system_id: Option<u64>,
    #[serde(default)]
    pub filters: Vec<CallbackFilter>,
    /// Kind-specific fields, without the kind tag (the path carries it).
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchInstructionRequest {
    pub state: InstructionState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: &'static str,
    uptime_seconds: i64,
    networks: Vec<u64>,
    /// Chain head per network; null where the kind has no block notion or
    /// the node is unreachable.
    heads: HashMap<u64, Option<u64>>,
    in_flight: HashMap<&'static str, usize>,
}

/// Deserialize the kind-specific payload by injecting the path kind as the
/// enum tag. A conflicting tag in the body is rejected rather than ignored.
fn payload_from_body(
    kind: InstructionKind,
    mut body: serde_json::Value,
) -> Result<InstructionPayload, ApiError> {
    let object = body
        .as_object_mut()
        .ok_or_else(|| ApiError::bad_request("payload must be an object"))?;
    if let Some(tag) = object.get("kind").and_then(|v| v.as_str()) {
        if tag != kind.as_str() {
            return Err(ApiError::bad_request(format!(
                "payload kind '{tag}' does not match path kind '{kind}'"
            )));
        }
    }
    object.insert("kind".into(), serde_json::Value::String(kind.as_str().into()));
    serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("invalid payload: {e}")))
}

/// Deterministic operation id for a payload that arrived without one.
/// Trade-bearing kinds hash the trade and its accounts so both parties
/// converge on the same id; validator kinds hash the whole payload.
pub fn derive_payload_operation_id(payload: &InstructionPayload) -> String {
    match payload {
        InstructionPayload::Settlement(p) => {
            derive_operation_id(&p.trade_id, &p.from_account, &p.to_account)
        }
        InstructionPayload::Swap(p) => {
            derive_operation_id(&p.trade_id, &p.sender_account, &p.receiver_account)
        }
        InstructionPayload::ValidatorSet(_) | InstructionPayload::ValidatorUpdate(_) => {
            let canonical = serde_json::to_string(payload).unwrap_or_default();
            bytes32_to_hex(&keccak256(canonical.as_bytes()))
        }
    }
}

fn parse_kind(kind: &str) -> Result<InstructionKind, ApiError> {
    kind.parse().map_err(|e: String| ApiError::bad_request(e))
}

/// Validate a submission and insert the record. Returns the stored record
/// and whether the caller asked for a synchronous (blocking) response.
pub async fn create_record(
    state: &ApiState,
    kind: InstructionKind,
    request: CreateInstructionRequest,
) -> Result<(Instruction, bool), ApiError> {
    let payload = payload_from_body(kind, request.payload)?;
    let system_id = request.system_id.unwrap_or(state.local_system_id);
    if state.ctx.ledgers.get(system_id).is_err() {
        return Err(ApiError::bad_request(format!(
            "no ledger configured for network {system_id}"
        )));
    }
    for filter in &request.filters {
        if state
            .ctx
            .ledgers
            .get(filter.remote_destination_network_id)
            .is_err()
        {
            return Err(ApiError::bad_request(format!(
                "no ledger configured for destination network {}",
                filter.remote_destination_network_id
            )));
        }
    }

    let operation_id = request
        .operation_id
        .unwrap_or_else(|| derive_payload_operation_id(&payload));
    let key = InstructionKey::new(system_id, operation_id);
    let record = Instruction::new(key, payload, request.foreign_system_id, request.filters);
    state.ctx.store.add(&record).await?;
    info!(key = %record.key, kind = %record.kind, "instruction accepted");

    let blocking = record.filters.is_empty()
        || record.filters.iter().any(|f| f.callback_url.is_none());
    Ok((record, blocking))
}

async fn create_instruction(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Json(request): Json<CreateInstructionRequest>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let (record, blocking) = create_record(&state, kind, request).await?;
    if !blocking {
        return Ok((StatusCode::ACCEPTED, Json(record)).into_response());
    }

    // poll until terminal or the synchronous window closes
    let deadline = tokio::time::Instant::now() + state.sync_wait;
    let key = record.key.clone();
    loop {
        tokio::time::sleep(state.sync_poll).await;
        let current = state
            .ctx
            .store
            .find_by_key(&key)
            .await?
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "record deleted while waiting"))?;
        if current.state.is_terminal() {
            return Ok((StatusCode::OK, Json(current)).into_response());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(key = %key, state = %current.state, "synchronous wait expired");
            return Ok((StatusCode::ACCEPTED, Json(current)).into_response());
        }
    }
}

async fn get_instruction(
    State(state): State<ApiState>,
    Path((kind, system_id, operation_id)): Path<(String, u64, String)>,
) -> Result<Json<Instruction>, ApiError> {
    let kind = parse_kind(&kind)?;
    let record = find_of_kind(&state, kind, system_id, &operation_id).await?;
    Ok(Json(record))
}

/// Validate a patch against the current record, then hand it to the kind's
/// scheduler inbox. The scheduler re-validates before applying; this check
/// exists to reject nonsense synchronously.
async fn patch_instruction(
    State(state): State<ApiState>,
    Path((kind, system_id, operation_id)): Path<(String, u64, String)>,
    Json(request): Json<PatchInstructionRequest>,
) -> Result<Response, ApiError> {
    let kind = parse_kind(&kind)?;
    let record = find_of_kind(&state, kind, system_id, &operation_id).await?;
    if !is_transition_allowed(record.state, request.state) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!(
                "transition {} -> {} is not allowed",
                record.state, request.state
            ),
        ));
    }
    if request.state == InstructionState::Cancel && record.foreign_system_id.is_none() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("instruction {} has no foreign system to cancel against", record.key),
        ));
    }

    let inbox = state
        .inboxes
        .get(&kind)
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "scheduler not running"))?;
    inbox
        .try_send(UpdateRequest {
            key: record.key.clone(),
            requested_state: request.state,
        })
        .map_err(|_| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "update inbox full"))?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn delete_instruction(
    State(state): State<ApiState>,
    Path((kind, system_id, operation_id)): Path<(String, u64, String)>,
) -> Result<StatusCode, ApiError> {
    let kind = parse_kind(&kind)?;
    let record = find_of_kind(&state, kind, system_id, &operation_id).await?;
    state.ctx.store.remove(&record.key).await?;
    info!(key = %record.key, "instruction deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn find_of_kind(
    state: &ApiState,
    kind: InstructionKind,
    system_id: u64,
    operation_id: &str,
) -> Result<Instruction, ApiError> {
    let key = InstructionKey::new(system_id, operation_id);
    let record = state
        .ctx
        .store
        .find_by_key(&key)
        .await?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("instruction {key} not found")))?;
    if record.kind != kind {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("instruction {key} is not a {kind}"),
        ));
    }
    Ok(record)
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics::gather(),
    )
        .into_response()
}

async fn status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let mut in_flight = HashMap::new();
    for kind in InstructionKind::ALL {
        let records = state.ctx.store.find_all_to_process(kind).await?;
        in_flight.insert(kind.as_str(), records.len());
    }
    let networks = state.ctx.ledgers.system_ids();
    let mut heads = HashMap::new();
    for system_id in &networks {
        let head = match state.ctx.ledgers.get(*system_id) {
            Ok(connector) => connector.latest_block().await.ok(),
            Err(_) => None,
        };
        heads.insert(*system_id, head);
    }
    Ok(Json(StatusResponse {
        status: "ok",
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        networks,
        heads,
        in_flight,
    }))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/instructions/{kind}", axum::routing::post(create_instruction))
        .route(
            "/instructions/{kind}/{system_id}/{operation_id}",
            get(get_instruction)
                .patch(patch_instruction)
                .delete(delete_instruction),
        )
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState) -> eyre::Result<()> {
    let app = router(state);
    info!(%addr, "admin API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, FOREIGN_SYSTEM, LOCAL_SYSTEM};

    fn api_state() -> ApiState {
        let h = harness();
        ApiState {
            ctx: Arc::new(h.ctx),
            inboxes: Arc::new(HashMap::new()),
            local_system_id: LOCAL_SYSTEM,
            sync_wait: Duration::from_millis(50),
            sync_poll: Duration::from_millis(5),
            started_at: Utc::now(),
        }
    }

    fn settlement_request(filters: Vec<CallbackFilter>) -> CreateInstructionRequest {
        CreateInstructionRequest {
            operation_id: None,
            system_id: None,
            foreign_system_id: Some(FOREIGN_SYSTEM),
            filters,
            payload: serde_json::json!({
                "tradeId": "O-101",
                "fromAccount": "Bob",
                "toAccount": "Alice",
                "amount": "1",
            }),
        }
    }

    #[tokio::test]
    async fn test_create_derives_operation_id() {
        let state = api_state();
        let (record, blocking) = create_record(
            &state,
            InstructionKind::Settlement,
            settlement_request(vec![CallbackFilter {
                remote_destination_network_id: FOREIGN_SYSTEM,
                callback_url: Some("https://caller/cb".into()),
            }]),
        )
        .await
        .unwrap();

        assert_eq!(record.key.system_id, LOCAL_SYSTEM);
        assert_eq!(
            record.key.operation_id,
            derive_operation_id("O-101", "Bob", "Alice")
        );
        // every filter has a callback: acknowledge, don't block
        assert!(!blocking);
    }

    #[tokio::test]
    async fn test_create_without_callbacks_blocks() {
        let state = api_state();
        let (_, blocking) = create_record(
            &state,
            InstructionKind::Settlement,
            settlement_request(vec![CallbackFilter {
                remote_destination_network_id: FOREIGN_SYSTEM,
                callback_url: None,
            }]),
        )
        .await
        .unwrap();
        assert!(blocking);
    }

    #[tokio::test]
    async fn test_duplicate_submission_conflicts() {
        let state = api_state();
        create_record(&state, InstructionKind::Settlement, settlement_request(vec![]))
            .await
            .unwrap();
        let err = create_record(&state, InstructionKind::Settlement, settlement_request(vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_destination_network_rejected() {
        let state = api_state();
        let err = create_record(
            &state,
            InstructionKind::Settlement,
            settlement_request(vec![CallbackFilter {
                remote_destination_network_id: 99,
                callback_url: None,
            }]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_payload_kind_mismatch_rejected() {
        let state = api_state();
        let mut request = settlement_request(vec![]);
        request.payload["kind"] = serde_json::Value::String("swap".into());
        let err = create_record(&state, InstructionKind::Settlement, request)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patch_cancel_requires_foreign_system() {
        let state = api_state();
        let mut request = settlement_request(vec![]);
        request.foreign_system_id = None;
        let (record, _) = create_record(&state, InstructionKind::Settlement, request)
            .await
            .unwrap();

        let err = patch_instruction(
            State(state),
            Path((
                InstructionKind::Settlement.as_str().to_string(),
                record.key.system_id,
                record.key.operation_id.clone(),
            )),
            Json(PatchInstructionRequest {
                state: InstructionState::Cancel,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.message.contains("no foreign system"));
    }

    #[tokio::test]
    async fn test_status_reports_network_heads() {
        let state = api_state();
        let Json(body) = status(State(state)).await.unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.networks, vec![LOCAL_SYSTEM, FOREIGN_SYSTEM]);
        assert_eq!(body.heads[&LOCAL_SYSTEM], Some(1));
        assert_eq!(body.heads[&FOREIGN_SYSTEM], Some(1));
    }

    #[test]
    fn test_validator_payload_operation_id_is_stable() {
        let payload = InstructionPayload::ValidatorSet(crate::store::ValidatorSetPayload {
            validators: vec!["0x01".into()],
        });
        let a = derive_payload_operation_id(&payload);
        let b = derive_payload_operation_id(&payload);
        assert_eq!(a, b);
        assert!(a.starts_with("0x"));
        assert_eq!(a.len(), 66);
    }
}
