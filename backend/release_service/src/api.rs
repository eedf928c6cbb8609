//! Axum REST API handlers.
//!
//! Every route except `/health` acts on behalf of a [`Principal`] that the
//! upstream identity provider places in two headers:
//!
//! * `x-principal-id`: the actor identifier
//! * `x-principal-roles`: comma separated roles (`donor`, `charity`, ...)
//!
//! Protocol errors map onto status codes in [`status_for`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use escrow_protocol::events::AuditEvent;
use escrow_protocol::projection::CampaignView;
use escrow_protocol::{
    Amount, Balances, CampaignId, Decision, DisbursementResult, DonationId, EscrowError,
    EscrowProtocol, LedgerEntry, Milestone, MilestoneId, MilestoneStatus, NewCampaign,
    PlatformStats, Principal, Priority, ProofSubmission, Role, SubmissionId,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::error;

use crate::db;
use crate::errors::ServiceError;

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLES_HEADER: &str = "x-principal-roles";

#[derive(Clone)]
pub struct ApiState {
    pub protocol: Arc<EscrowProtocol>,
    pub pool: SqlitePool,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/artifacts", post(upload_artifact))
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/events", get(get_campaign_events))
        .route("/campaigns/:id/ledger", get(get_campaign_ledger))
        .route("/campaigns/:id/milestones", post(add_milestone))
        .route("/campaigns/:id/activate", post(activate_campaign))
        .route("/campaigns/:id/cancel", post(cancel_campaign))
        .route("/campaigns/:id/pledges", post(record_pledge))
        .route("/campaigns/:id/donations", post(apply_hold))
        .route("/campaigns/:id/refunds", post(apply_refund))
        .route("/campaigns/:id/reconcile", post(reconcile_campaign))
        .route("/milestones/:id/proofs", post(submit_proof))
        .route("/milestones/:id/resubmission", post(reopen_milestone))
        .route("/milestones/:id/disburse", post(disburse))
        .route("/verifications/claim", post(claim_next))
        .route("/verifications/:id/claim", post(claim_submission))
        .route("/verifications/:id/release", post(release_claim))
        .route("/verifications/:id/priority", post(prioritize_submission))
        .route("/verifications/:id/decision", post(decide))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated(&'static str),
    Service(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        Self::Service(ServiceError::Protocol(e))
    }
}

pub fn status_for(err: &EscrowError) -> StatusCode {
    match err {
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::Authorization { .. } => StatusCode::FORBIDDEN,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::Conflict(_)
        | EscrowError::InvalidState(_)
        | EscrowError::CampaignFrozen { .. } => StatusCode::CONFLICT,
        EscrowError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EscrowError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        EscrowError::InvariantViolation { .. }
        | EscrowError::ChainBroken { .. }
        | EscrowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthenticated(why) => (StatusCode::UNAUTHORIZED, why.to_string()),
            ApiError::Service(ServiceError::Protocol(e)) => (status_for(&e), e.to_string()),
            ApiError::Service(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        if status.is_server_error() {
            error!("Request failed: {message}");
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ─────────────────────────────────────────────────────────
// Principal extraction
// ─────────────────────────────────────────────────────────

/// The caller, as asserted by the identity provider headers.
pub struct Caller(pub Principal);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let id = header(PRINCIPAL_ID_HEADER)
            .ok_or(ApiError::Unauthenticated("missing x-principal-id header"))?;
        let roles = header(PRINCIPAL_ROLES_HEADER)
            .ok_or(ApiError::Unauthenticated("missing x-principal-roles header"))?
            .split(',')
            .filter(|r| !r.trim().is_empty())
            .map(str::parse::<Role>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Caller(Principal::new(id, &roles)))
    }
}

// ─────────────────────────────────────────────────────────
// Request and response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub events_by_kind: BTreeMap<String, i64>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub campaign_id: CampaignId,
    pub count: usize,
    pub events: Vec<AuditEvent>,
}

#[derive(Serialize)]
pub struct LedgerResponse {
    pub campaign_id: CampaignId,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub artifact_ref: String,
}

#[derive(Serialize)]
pub struct ReopenResponse {
    pub milestone_id: MilestoneId,
    pub status: MilestoneStatus,
}

#[derive(Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: u64,
}

#[derive(Deserialize)]
pub struct ArtifactQuery {
    pub name: String,
}

#[derive(Deserialize)]
pub struct AddMilestoneRequest {
    pub target_amount: Amount,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct AmountRequest {
    pub amount: Amount,
}

#[derive(Deserialize)]
pub struct DonationRequest {
    pub donation_id: DonationId,
    pub amount: Amount,
}

#[derive(Deserialize)]
pub struct ReconcileRequest {
    pub note: String,
}

#[derive(Deserialize)]
pub struct ProofRequest {
    pub artifact_refs: Vec<String>,
}

#[derive(Deserialize)]
pub struct PriorityRequest {
    pub priority: Priority,
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub decision: Decision,
    #[serde(default)]
    pub comment: Option<String>,
}

fn view_json(view: Arc<CampaignView>) -> Json<CampaignView> {
    Json(view.as_ref().clone())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> ApiResult<Json<HealthResponse>> {
    let events_by_kind = db::count_by_kind(&state.pool).await?.into_iter().collect();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        events_by_kind,
    }))
}

/// `GET /stats`
pub async fn stats(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
) -> ApiResult<Json<PlatformStats>> {
    Ok(Json(state.protocol.stats(&principal)?))
}

/// `POST /artifacts?name=<file name>` with the raw file as body.
pub async fn upload_artifact(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Query(query): Query<ArtifactQuery>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ArtifactResponse>)> {
    let artifact_ref = state
        .protocol
        .store_artifact(&principal, &query.name, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(ArtifactResponse { artifact_ref })))
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Json(new): Json<NewCampaign>,
) -> ApiResult<(StatusCode, Json<CampaignView>)> {
    let view = state.protocol.create_campaign(&principal, new).await?;
    Ok((StatusCode::CREATED, view_json(view)))
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<CampaignView>> {
    Ok(view_json(state.protocol.campaign(CampaignId(id))?))
}

/// `GET /campaigns/:id/events?since=<sequence>`
///
/// Events with a sequence greater than `since`, in order.
pub async fn get_campaign_events(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let campaign_id = CampaignId(id);
    let events = state.protocol.stream_from(campaign_id, query.since)?;
    Ok(Json(EventsResponse {
        campaign_id,
        count: events.len(),
        events,
    }))
}

/// `GET /campaigns/:id/ledger`
pub async fn get_campaign_ledger(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<LedgerResponse>> {
    let campaign_id = CampaignId(id);
    let entries = state.protocol.ledger_entries(campaign_id)?;
    Ok(Json(LedgerResponse {
        campaign_id,
        entries,
    }))
}

/// `POST /campaigns/:id/milestones`
pub async fn add_milestone(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<AddMilestoneRequest>,
) -> ApiResult<(StatusCode, Json<Milestone>)> {
    let milestone = state
        .protocol
        .add_milestone(&principal, CampaignId(id), req.target_amount)
        .await?;
    Ok((StatusCode::CREATED, Json(milestone)))
}

/// `POST /campaigns/:id/activate`
pub async fn activate_campaign(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
) -> ApiResult<Json<CampaignView>> {
    let view = state
        .protocol
        .activate_campaign(&principal, CampaignId(id))
        .await?;
    Ok(view_json(view))
}

/// `POST /campaigns/:id/cancel`
pub async fn cancel_campaign(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<CampaignView>> {
    let view = state
        .protocol
        .cancel_campaign(&principal, CampaignId(id), &req.reason)
        .await?;
    Ok(view_json(view))
}

/// `POST /campaigns/:id/pledges`
pub async fn record_pledge(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<AmountRequest>,
) -> ApiResult<Json<Balances>> {
    let balances = state
        .protocol
        .record_pledge(&principal, CampaignId(id), req.amount)
        .await?;
    Ok(Json(balances))
}

/// `POST /campaigns/:id/donations`
///
/// Confirms a completed payment. Repeating a donation id is a no-op.
pub async fn apply_hold(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<DonationRequest>,
) -> ApiResult<Json<Balances>> {
    let balances = state
        .protocol
        .apply_hold(&principal, CampaignId(id), req.donation_id, req.amount)
        .await?;
    Ok(Json(balances))
}

/// `POST /campaigns/:id/refunds`
pub async fn apply_refund(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<AmountRequest>,
) -> ApiResult<Json<Balances>> {
    let balances = state
        .protocol
        .apply_refund(&principal, CampaignId(id), req.amount)
        .await?;
    Ok(Json(balances))
}

/// `POST /campaigns/:id/reconcile`
pub async fn reconcile_campaign(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<ReconcileRequest>,
) -> ApiResult<Json<CampaignView>> {
    let view = state
        .protocol
        .clear_reconciliation(&principal, CampaignId(id), &req.note)
        .await?;
    Ok(view_json(view))
}

/// `POST /milestones/:id/proofs`
pub async fn submit_proof(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<ProofRequest>,
) -> ApiResult<(StatusCode, Json<ProofSubmission>)> {
    let submission = state
        .protocol
        .submit_proof(&principal, MilestoneId(id), req.artifact_refs)
        .await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

/// `POST /milestones/:id/resubmission`
pub async fn reopen_milestone(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
) -> ApiResult<Json<ReopenResponse>> {
    let milestone_id = MilestoneId(id);
    let status = state
        .protocol
        .reopen_milestone(&principal, milestone_id)
        .await?;
    Ok(Json(ReopenResponse {
        milestone_id,
        status,
    }))
}

/// `POST /milestones/:id/disburse`
pub async fn disburse(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
) -> ApiResult<Json<DisbursementResult>> {
    let result = state.protocol.disburse(&principal, MilestoneId(id)).await?;
    Ok(Json(result))
}

/// `POST /verifications/claim`
///
/// `204 No Content` when nothing is waiting.
pub async fn claim_next(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
) -> ApiResult<Response> {
    Ok(match state.protocol.claim_next(&principal).await? {
        Some(submission) => Json(submission).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// `POST /verifications/:id/claim`
pub async fn claim_submission(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
) -> ApiResult<Json<ProofSubmission>> {
    let submission = state
        .protocol
        .claim_submission(&principal, SubmissionId(id))
        .await?;
    Ok(Json(submission))
}

/// `POST /verifications/:id/release`
pub async fn release_claim(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    state
        .protocol
        .release_claim(&principal, SubmissionId(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /verifications/:id/priority`
pub async fn prioritize_submission(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<PriorityRequest>,
) -> ApiResult<Json<ProofSubmission>> {
    let submission = state
        .protocol
        .prioritize_submission(&principal, SubmissionId(id), req.priority)
        .await?;
    Ok(Json(submission))
}

/// `POST /verifications/:id/decision`
pub async fn decide(
    State(state): State<Arc<ApiState>>,
    Caller(principal): Caller,
    Path(id): Path<u64>,
    Json(req): Json<DecisionRequest>,
) -> ApiResult<Json<Milestone>> {
    let milestone = state
        .protocol
        .decide(&principal, SubmissionId(id), req.decision, req.comment)
        .await?;
    Ok(Json(milestone))
}
