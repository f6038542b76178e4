use crate::errors::AppError;
use crate::handlers::AppState;
use crate::webhook_models::{BasicCredentials, WebhookAck};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::Value;
use std::sync::Arc;

/// Identity provider callback
///
/// Records the response, correlates it to a user and applies it. Answers
/// `{"status":"ok"}` whenever the body parsed, matched or not.
///
/// Authentication: `Authorization: Basic` with the configured webhook credentials
pub async fn idm_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    validate_basic_auth(&state, &headers)?;
    tracing::info!("Received identity provider callback");
    tracing::debug!("Callback payload: {}", payload);

    match state.service.orchestrator().handle_callback(payload).await? {
        Some(settled) => tracing::info!("Callback applied, user now {}", settled),
        None => tracing::info!("Callback stored without a user"),
    }

    Ok((StatusCode::OK, Json(WebhookAck::ok())))
}

/// Document provider callback
///
/// The path carries the shared secret. Unknown resource types are rejected
/// with 400 after the envelope is stored.
pub async fn onfido_callback(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<WebhookAck>), AppError> {
    if !constant_time_compare(&token, &state.config.onfido_webhook_token) {
        tracing::warn!("Invalid document provider webhook token received");
        return Err(AppError::Unauthorized("Invalid webhook token".to_string()));
    }

    let resource = state.reconciler.apply_webhook(&body).await?;
    tracing::info!("Document provider resource {} reconciled", resource.id());

    Ok((StatusCode::OK, Json(WebhookAck::ok())))
}

fn validate_basic_auth(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let credentials = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(BasicCredentials::from_header)
        .ok_or_else(|| AppError::Unauthorized("Missing basic credentials".to_string()))?;

    // Evaluate both so the response time does not reveal which one failed.
    let user_ok = constant_time_compare(&credentials.username, &state.config.idm_webhook_username);
    let pass_ok = constant_time_compare(&credentials.password, &state.config.idm_webhook_password);
    if !(user_ok && pass_ok) {
        tracing::warn!("Invalid identity provider webhook credentials received");
        return Err(AppError::Unauthorized("Invalid credentials".to_string()));
    }

    Ok(())
}

/// Constant-time string comparison (basic implementation)
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret", "secret"));
        assert!(!constant_time_compare("secret", "secreT"));
        assert!(!constant_time_compare("secret", "secret2"));
    }
}
