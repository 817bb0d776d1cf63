//! HTTP surface: webhook ingress plus the marketplace API.
//!
//! API callers authenticate with the bearer token issued at user
//! registration. The payout confirmation callback authenticates with
//! the shared callback token instead, since the watcher is not a
//! marketplace user.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{
    AccessKey, Bounty, BountyStatus, FundingCommitment, Payout, RepoSettings, SpendLimit,
    Submission, User,
};
use crate::submissions::ApprovalRole;
use crate::webhook::{self, DeliveryHeaders, IngressOutcome};

pub struct AppState {
    pub engine: Arc<Engine>,
    pub callback_token: Option<String>,
    pub started_at: std::time::Instant,
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error_body(status: StatusCode, message: String) -> ApiError {
    (status, Json(serde_json::json!({ "error": message })))
}

fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
        EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
        EngineError::DuplicateCommitment
        | EngineError::TokenMismatch
        | EngineError::TerminalBounty { .. }
        | EngineError::Transition(_) => StatusCode::CONFLICT,
        EngineError::Database(_) | EngineError::External(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, e.to_string())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/github", post(webhook_handler))
        .route("/api/users", post(register_user_handler))
        .route("/api/repos", post(register_repo_handler))
        .route(
            "/api/bounties",
            get(list_bounties_handler).post(fund_bounty_handler),
        )
        .route("/api/bounties/:id", get(get_bounty_handler))
        .route("/api/bounties/:id/withdraw", post(withdraw_handler))
        .route("/api/bounties/:id/cancel", post(cancel_handler))
        .route("/api/submissions/:id", get(get_submission_handler))
        .route("/api/submissions/:id/approve", post(approve_handler))
        .route("/api/submissions/:id/reject", post(reject_handler))
        .route("/api/payouts/:id/confirm", post(confirm_payout_handler))
        .route(
            "/api/access-keys",
            get(list_access_keys_handler).post(register_access_key_handler),
        )
        .route("/api/access-keys/:key_id", delete(revoke_access_key_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(auth::bearer_token)
        .ok_or_else(|| engine_error(EngineError::Unauthorized))?;
    state
        .engine
        .storage()
        .user_by_api_token(token)
        .await
        .map_err(engine_error)?
        .ok_or_else(|| engine_error(EngineError::Unauthorized))
}

// ============================================================================
// HEALTH AND WEBHOOKS
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    uptime_secs: u64,
    version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let delivery = DeliveryHeaders {
        event: header("x-github-event"),
        signature: header("x-hub-signature-256"),
        delivery_id: header("x-github-delivery"),
    };
    match webhook::handle_delivery(&state.engine, &delivery, &body).await {
        Ok(IngressOutcome::Processed { summary }) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "processed", "summary": summary })),
        ),
        Ok(IngressOutcome::Ignored { reason }) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ignored", "reason": reason })),
        ),
        Err(e) => (
            StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[derive(Deserialize)]
struct RegisterUserRequest {
    github_login: String,
    #[serde(default)]
    wallet_address: Option<String>,
}

/// The API token is only ever returned here.
#[derive(Serialize)]
struct RegisterUserResponse {
    #[serde(flatten)]
    user: User,
    api_token: String,
}

async fn register_user_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> ApiResult<RegisterUserResponse> {
    let user = state
        .engine
        .register_user(&req.github_login, req.wallet_address)
        .await
        .map_err(engine_error)?;
    let api_token = user.api_token.clone().unwrap_or_default();
    Ok(Json(RegisterUserResponse { user, api_token }))
}

#[derive(Deserialize)]
struct RegisterRepoRequest {
    github_repo_id: i64,
    owner: String,
    name: String,
    #[serde(default)]
    require_owner_approval: bool,
}

/// The secret to configure on the GitHub webhook.
#[derive(Serialize)]
struct RegisterRepoResponse {
    #[serde(flatten)]
    repo: RepoSettings,
    webhook_secret: String,
}

async fn register_repo_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRepoRequest>,
) -> ApiResult<RegisterRepoResponse> {
    let user = authenticate(&state, &headers).await?;
    let repo = state
        .engine
        .register_repo(
            &user,
            req.github_repo_id,
            &req.owner,
            &req.name,
            req.require_owner_approval,
        )
        .await
        .map_err(engine_error)?;
    let webhook_secret = repo.webhook_secret.clone();
    Ok(Json(RegisterRepoResponse {
        repo,
        webhook_secret,
    }))
}

// ============================================================================
// BOUNTIES
// ============================================================================

#[derive(Deserialize)]
struct ListBountiesQuery {
    status: Option<String>,
    github_repo_id: Option<i64>,
}

async fn list_bounties_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListBountiesQuery>,
) -> ApiResult<Vec<Bounty>> {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(BountyStatus::parse(s).ok_or_else(|| {
            error_body(StatusCode::BAD_REQUEST, format!("unknown bounty status {s}"))
        })?),
    };
    let bounties = state
        .engine
        .storage()
        .list_bounties(status, query.github_repo_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(bounties))
}

#[derive(Serialize)]
struct BountyDetail {
    #[serde(flatten)]
    bounty: Bounty,
    commitments: Vec<FundingCommitment>,
    submissions: Vec<Submission>,
}

async fn get_bounty_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<BountyDetail> {
    let storage = state.engine.storage();
    let bounty = storage
        .bounty_by_id(id)
        .await
        .map_err(engine_error)?
        .ok_or_else(|| engine_error(EngineError::NotFound("bounty")))?;
    let commitments = storage
        .commitments_for_bounty(id)
        .await
        .map_err(engine_error)?;
    let submissions = storage
        .submissions_for_bounty(id)
        .await
        .map_err(engine_error)?;
    Ok(Json(BountyDetail {
        bounty,
        commitments,
        submissions,
    }))
}

#[derive(Deserialize)]
struct FundBountyRequest {
    github_repo_id: i64,
    issue_number: i64,
    amount: i64,
    token_address: String,
}

#[derive(Serialize)]
struct LedgerResponse {
    bounty: Bounty,
    commitment: FundingCommitment,
    bounty_created: bool,
    bounty_cancelled: bool,
}

async fn fund_bounty_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<FundBountyRequest>,
) -> ApiResult<LedgerResponse> {
    let user = authenticate(&state, &headers).await?;
    let update = state
        .engine
        .fund_bounty(
            &user,
            req.github_repo_id,
            req.issue_number,
            req.amount,
            &req.token_address,
        )
        .await
        .map_err(engine_error)?;
    Ok(Json(LedgerResponse {
        bounty: update.bounty,
        commitment: update.commitment,
        bounty_created: update.bounty_created,
        bounty_cancelled: update.bounty_cancelled,
    }))
}

async fn withdraw_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<LedgerResponse> {
    let user = authenticate(&state, &headers).await?;
    let update = state
        .engine
        .withdraw_funding(&user, id)
        .await
        .map_err(engine_error)?;
    Ok(Json(LedgerResponse {
        bounty: update.bounty,
        commitment: update.commitment,
        bounty_created: update.bounty_created,
        bounty_cancelled: update.bounty_cancelled,
    }))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Bounty> {
    let user = authenticate(&state, &headers).await?;
    let outcome = state
        .engine
        .cancel_bounty(&user, id)
        .await
        .map_err(engine_error)?;
    Ok(Json(outcome.bounty))
}

// ============================================================================
// SUBMISSIONS
// ============================================================================

#[derive(Serialize)]
struct SubmissionDetail {
    #[serde(flatten)]
    submission: Submission,
    payouts: Vec<Payout>,
}

async fn get_submission_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<SubmissionDetail> {
    let storage = state.engine.storage();
    let submission = storage
        .submission_by_id(id)
        .await
        .map_err(engine_error)?
        .ok_or_else(|| engine_error(EngineError::NotFound("submission")))?;
    let payouts = storage
        .payouts_for_submission(id)
        .await
        .map_err(engine_error)?;
    Ok(Json(SubmissionDetail {
        submission,
        payouts,
    }))
}

#[derive(Deserialize)]
struct ApproveRequest {
    role: String,
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Submission> {
    let user = authenticate(&state, &headers).await?;
    let role = match req.role.as_str() {
        "funder" => ApprovalRole::Funder,
        "owner" => ApprovalRole::Owner,
        other => {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                format!("unknown approval role {other}"),
            ))
        }
    };
    let submission = state
        .engine
        .approve_submission(&user, id, role)
        .await
        .map_err(engine_error)?;
    Ok(Json(submission))
}

#[derive(Deserialize)]
struct RejectRequest {
    #[serde(default)]
    reason: String,
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<Submission> {
    let user = authenticate(&state, &headers).await?;
    let submission = state
        .engine
        .reject_submission(&user, id, &req.reason)
        .await
        .map_err(engine_error)?;
    Ok(Json(submission))
}

// ============================================================================
// PAYOUTS
// ============================================================================

#[derive(Deserialize)]
struct ConfirmPayoutRequest {
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Serialize)]
struct ConfirmPayoutResponse {
    payout: Payout,
    all_confirmed: bool,
    submission: Option<Submission>,
    bounty: Option<Bounty>,
}

async fn confirm_payout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ConfirmPayoutRequest>,
) -> ApiResult<ConfirmPayoutResponse> {
    // The watcher authenticates with the shared callback token when one
    // is configured.
    if let Some(expected) = &state.callback_token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(auth::bearer_token);
        if presented != Some(expected.as_str()) {
            return Err(engine_error(EngineError::Unauthorized));
        }
    }
    let outcome = state
        .engine
        .confirm_payout(&id, req.tx_hash.as_deref())
        .await
        .map_err(engine_error)?;
    Ok(Json(ConfirmPayoutResponse {
        payout: outcome.payout,
        all_confirmed: outcome.all_confirmed,
        submission: outcome.submission,
        bounty: outcome.bounty,
    }))
}

// ============================================================================
// ACCESS KEYS
// ============================================================================

#[derive(Deserialize)]
struct SpendLimitRequest {
    token_address: String,
    amount: i64,
}

#[derive(Deserialize)]
struct RegisterAccessKeyRequest {
    key_id: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    limits: Vec<SpendLimitRequest>,
}

async fn register_access_key_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterAccessKeyRequest>,
) -> ApiResult<AccessKey> {
    let user = authenticate(&state, &headers).await?;
    let limits = req
        .limits
        .into_iter()
        .map(|l| SpendLimit {
            token_address: l.token_address,
            initial: l.amount,
            remaining: l.amount,
        })
        .collect();
    let key = state
        .engine
        .register_access_key(&user, &req.key_id, req.expires_at, limits)
        .await
        .map_err(engine_error)?;
    Ok(Json(key))
}

async fn list_access_keys_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<AccessKey>> {
    let user = authenticate(&state, &headers).await?;
    let keys = state
        .engine
        .list_access_keys(&user)
        .await
        .map_err(engine_error)?;
    Ok(Json(keys))
}

async fn revoke_access_key_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let user = authenticate(&state, &headers).await?;
    state
        .engine
        .revoke_access_key(&user, &key_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(serde_json::json!({ "revoked": key_id })))
}

/// Run the server
pub async fn run_server(
    host: &str,
    port: u16,
    engine: Arc<Engine>,
    callback_token: Option<String>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        engine,
        callback_token,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Bounty Board server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
