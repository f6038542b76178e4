//! Request/response ledger for the identity provider.
//!
//! Every outbound request and every inbound response is recorded here, keyed
//! by transaction id. Responses are stored even when no user can be found so
//! that unmatched callbacks remain auditable.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::Event;
use crate::models::{LookupKey, User, VerificationRequest, VerificationResponse, VerificationStage};
use crate::state_machine::StateMachine;

/// Transaction ids with this prefix embed the user id directly.
pub const USER_ID_TID_PREFIX: &str = "csv";

/// Fields extracted from a raw identity provider payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub transaction_id: String,
    pub result: Option<String>,
    pub kyc_state: Option<String>,
    pub user_reputation: Option<String>,
    pub fraud_result: Option<String>,
    pub previous_reputation: Option<String>,
}

/// Reads the provider's short field names. `mtid` is the only required one.
pub fn parse_response(raw: &Value) -> Result<ParsedResponse, AppError> {
    let transaction_id = match raw.get("mtid") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(AppError::BadRequest(
                "Response payload is missing 'mtid'".to_string(),
            ))
        }
    };

    Ok(ParsedResponse {
        transaction_id,
        result: text(raw, "res"),
        kyc_state: text(raw, "state"),
        user_reputation: text(raw, "user"),
        fraud_result: text(raw, "frp"),
        previous_reputation: text(raw, "upr"),
    })
}

fn text(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Fresh transaction id in the provider's 24 hex character format.
pub fn new_transaction_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(24);
    id
}

pub struct VerificationLedger {
    machine: Arc<StateMachine>,
}

impl VerificationLedger {
    pub fn new(machine: Arc<StateMachine>) -> Self {
        Self { machine }
    }

    /// Persists a request for `stage`. The user's shared transaction id is
    /// claimed (or reused) and written into the payload's `tid` field.
    pub async fn create_request(
        &self,
        user: &User,
        stage: VerificationStage,
        mut payload: Value,
    ) -> Result<VerificationRequest, AppError> {
        let store = self.machine.store();
        let candidate = user.idm_tid.clone().unwrap_or_else(new_transaction_id);
        let transaction_id = store.claim_transaction_id(user.id, &candidate).await?;

        if let Value::Object(ref mut body) = payload {
            body.insert("tid".to_string(), Value::String(transaction_id.clone()));
            body.insert("stage".to_string(), Value::from(stage.number()));
        }

        let request = VerificationRequest {
            id: Uuid::new_v4(),
            user_id: user.id,
            stage,
            created_at: Utc::now(),
            requested_at: None,
            transaction_id,
            request_data: payload,
            response_status: None,
        };

        store.insert_request(&request).await?;
        tracing::info!(
            "Created stage {} request {} for user {}",
            stage.number(),
            request.transaction_id,
            user.id
        );
        Ok(request)
    }

    /// Records that the provider call for `request` finished.
    pub async fn mark_sent(
        &self,
        request: &VerificationRequest,
        response_status: Option<i32>,
    ) -> Result<(), AppError> {
        self.machine
            .store()
            .mark_request_completed(request.id, Utc::now(), response_status)
            .await
    }

    pub async fn find_request_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<VerificationRequest>, AppError> {
        self.machine
            .store()
            .find_request_by_transaction(transaction_id)
            .await
    }

    /// Parses, correlates, persists and publishes one provider response.
    ///
    /// Correlation misses are logged and the response is stored with no user.
    pub async fn record_response(&self, raw: Value) -> Result<VerificationResponse, AppError> {
        let parsed = parse_response(&raw)?;
        let user_id = self.correlate(&parsed.transaction_id).await?;

        let response = VerificationResponse {
            id: Uuid::new_v4(),
            user_id,
            received_at: Utc::now(),
            transaction_id: parsed.transaction_id,
            result: parsed.result,
            kyc_state: parsed.kyc_state,
            user_reputation: parsed.user_reputation,
            fraud_result: parsed.fraud_result,
            previous_reputation: parsed.previous_reputation,
            response_data: raw,
        };

        self.machine.store().insert_response(&response).await?;

        match response.user_id {
            Some(user_id) => tracing::info!(
                "Recorded response for transaction {} (user {}, status {:?})",
                response.transaction_id,
                user_id,
                response.raw_status()
            ),
            None => tracing::warn!(
                "No user found for response transaction {}; stored for audit",
                response.transaction_id
            ),
        }

        self.machine
            .publish(Event::ResponseReceived(response.clone()))
            .await;
        Ok(response)
    }

    async fn correlate(&self, transaction_id: &str) -> Result<Option<Uuid>, AppError> {
        if let Some(raw_id) = transaction_id.strip_prefix(USER_ID_TID_PREFIX) {
            let Ok(user_id) = Uuid::parse_str(raw_id) else {
                tracing::debug!("Transaction {} has a malformed user id", transaction_id);
                return Ok(None);
            };
            return Ok(self
                .machine
                .store()
                .find_user(&LookupKey::Id(user_id))
                .await?
                .map(|u| u.id));
        }

        Ok(self
            .find_request_by_transaction(transaction_id)
            .await?
            .map(|request| request.user_id))
    }
}
