use crate::config::Config;
use crate::errors::AppError;
use crate::models::{IdUpload, Upload, UserResponse};
use crate::reconciler::WebhookReconciler;
use crate::service::{DocumentSubmission, WhitelistService};
use crate::tokens::TokenSigner;
use crate::validation::InfoSubmission;
use crate::webhook_handler;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// User-facing whitelist operations.
    pub service: Arc<WhitelistService>,
    /// Document provider webhook processing.
    pub reconciler: Arc<WebhookReconciler>,
    /// Issues and checks user tokens.
    pub tokens: TokenSigner,
}

/// Every route except `/health`.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/status", get(whitelist_status))
        .route("/api/v1/user", post(submit_info).get(get_user))
        .route("/api/v1/user/eth/:addr", get(eth_address_status))
        .route("/api/v1/upload", post(create_upload))
        .route("/api/v1/ids", post(submit_documents))
        .route("/api/v1/ids/:upload_id/verify", post(start_id_verification))
        .route("/verification/callback", post(webhook_handler::idm_callback))
        .route(
            "/identity/callback/:token",
            post(webhook_handler::onfido_callback),
        )
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-whitelist-api",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// User id taken from a valid `Authorization: Token <token>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Token "))
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing user token".to_string()))?;

        state.tokens.verify(token).map(AuthUser)
    }
}

/// Public user view plus a fresh token.
fn user_view(state: &AppState, user: &crate::models::User) -> Result<UserResponse, AppError> {
    Ok(UserResponse::from(user).with_token(state.tokens.issue(user.id)?))
}

/// Forwarded address when behind a proxy, socket address otherwise.
fn client_ip(headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

/// GET /api/v1/status
pub async fn whitelist_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.service.whitelist_open()?;
    Ok(Json(json!({ "status": "open" })))
}

/// POST /api/v1/user
///
/// Creates the user (201) and runs info verification, or returns the user
/// already registered for the same eth address (200). The body carries the
/// token for the authenticated routes.
pub async fn submit_info(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(submission): Json<InfoSubmission>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let ip = client_ip(&headers, peer);
    let ip_country = headers
        .get("CF-IPCountry")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    tracing::info!("POST /user from {:?} ({:?})", ip, ip_country);

    let (user, created) = state.service.submit_info(submission, ip, ip_country).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(user_view(&state, &user)?)))
}

/// GET /api/v1/user
///
/// Served even while the whitelist is closed.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = state.service.get_user(user_id).await?;
    Ok(Json(user_view(&state, &user)?))
}

/// GET /api/v1/user/eth/:addr
///
/// Status only: `approved`, `declined` or `not-found`.
pub async fn eth_address_status(
    State(state): State<Arc<AppState>>,
    Path(addr): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.service.whitelist_status_for_address(&addr).await?;
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: String,
}

/// POST /api/v1/upload?filename=..
///
/// Raw file bytes in the body, type taken from `Content-Type`.
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Upload>), AppError> {
    state.service.whitelist_open()?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    let upload = state
        .service
        .create_upload(user_id, content_type, &params.filename, &body)
        .await?;
    Ok((StatusCode::CREATED, Json(upload)))
}

/// Body of `POST /api/v1/ids`; the owner comes from the token.
#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub upload1: Uuid,
    pub upload2: Uuid,
    pub doc_type: String,
    pub doc_country: String,
    #[serde(default)]
    pub doc_state: Option<String>,
}

/// POST /api/v1/ids
pub async fn submit_documents(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(request): Json<IdsRequest>,
) -> Result<(StatusCode, Json<IdUpload>), AppError> {
    state.service.whitelist_open()?;
    let upload = state
        .service
        .submit_documents(DocumentSubmission {
            user_id,
            upload1: request.upload1,
            upload2: request.upload2,
            doc_type: request.doc_type,
            doc_country: request.doc_country,
            doc_state: request.doc_state,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(upload)))
}

/// POST /api/v1/ids/:upload_id/verify
pub async fn start_id_verification(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(upload_id): Path<Uuid>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>, AppError> {
    state.service.whitelist_open()?;
    let ip = client_ip(&headers, peer);
    let user = state
        .service
        .start_id_verification(upload_id, user_id, ip.as_deref())
        .await?;
    Ok(Json(user_view(&state, &user)?))
}
