//! Mirrors document provider checks and reports from webhooks.
//!
//! Webhooks repeat themselves: the same resource is reported several times at
//! increasing completeness, sometimes concurrently. Each delivery upserts in
//! one statement and is published; the user's status is only copied the first
//! time a check is seen complete.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::{Event, Resource};
use crate::mapper::{normalize_check, CHECK_COMPLETE};
use crate::models::{CheckResource, ReportResource, WebhookEnvelope};
use crate::onfido_client::OnfidoApi;
use crate::state_machine::StateMachine;

pub const RESOURCE_CHECK: &str = "check";
pub const RESOURCE_REPORT: &str = "report";

/// Hex SHA-256 of the serialized payload.
pub fn payload_digest(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl WebhookEnvelope {
    /// Reads `{resource_type, action, object}` out of a webhook's `payload`.
    pub fn from_payload(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_type: payload
                .get("resource_type")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            action: payload.get("action").and_then(|v| v.as_str()).map(str::to_string),
            object: payload.get("object").cloned().unwrap_or(Value::Null),
            digest: payload_digest(&payload),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn href(&self) -> Option<&str> {
        self.object.get("href").and_then(|v| v.as_str())
    }
}

pub struct WebhookReconciler {
    machine: Arc<StateMachine>,
    api: Arc<dyn OnfidoApi>,
}

impl WebhookReconciler {
    pub fn new(machine: Arc<StateMachine>, api: Arc<dyn OnfidoApi>) -> Self {
        Self { machine, api }
    }

    /// Handles one `{payload: {...}}` webhook body.
    pub async fn apply_webhook(&self, body: &Value) -> Result<Resource, AppError> {
        let payload = body
            .get("payload")
            .filter(|p| p.is_object())
            .cloned()
            .ok_or_else(|| AppError::BadRequest("Webhook body has no payload".to_string()))?;

        let envelope = WebhookEnvelope::from_payload(payload);
        self.machine.store().insert_webhook(&envelope).await?;
        tracing::info!(
            "Document provider webhook {:?}/{:?} ({})",
            envelope.resource_type,
            envelope.action,
            envelope.digest
        );

        let resource_type = envelope.resource_type.as_deref().unwrap_or_default();
        if resource_type != RESOURCE_CHECK && resource_type != RESOURCE_REPORT {
            tracing::error!("Invalid webhook type: {:?}", envelope.resource_type);
            return Err(AppError::BadRequest(format!(
                "Invalid webhook resource type: {:?}",
                envelope.resource_type
            )));
        }

        let href = envelope
            .href()
            .ok_or_else(|| AppError::BadRequest("Webhook object has no href".to_string()))?;
        let raw = self
            .api
            .fetch(href)
            .await
            .map_err(|e| AppError::ExternalApiError(e.to_string()))?;

        if resource_type == RESOURCE_CHECK {
            self.apply_check(raw, None).await.map(Resource::Check)
        } else {
            self.apply_report(raw).await.map(Resource::Report)
        }
    }

    /// Upserts a check, publishes it, and on the first completion seen with an
    /// owning user copies its result onto that user.
    pub async fn apply_check(
        &self,
        raw: Value,
        user_id: Option<Uuid>,
    ) -> Result<CheckResource, AppError> {
        let check = CheckResource::from_value(raw, user_id)
            .ok_or_else(|| AppError::BadRequest("Check resource has no id".to_string()))?;
        let store = self.machine.store();
        let stored = store.upsert_check(&check).await?;

        self.machine
            .publish(Event::ResourceUpdated(Resource::Check(stored.clone())))
            .await;

        if stored.status.as_deref() != Some(CHECK_COMPLETE) {
            return Ok(stored);
        }
        // Completion stays unclaimed until a user is attached.
        let Some(user_id) = stored.user_id else {
            tracing::warn!("Completed check {} has no user", stored.id);
            return Ok(stored);
        };
        if !store.mark_check_completed(&stored.id).await? {
            tracing::debug!("Check {} completion already handled", stored.id);
            return Ok(stored);
        }

        tracing::info!(
            "Check {} complete for user {}: {:?} ({})",
            stored.id,
            user_id,
            stored.result,
            normalize_check(stored.status.as_deref(), stored.result.as_deref())
        );
        store
            .set_onfido_status(user_id, stored.result.as_deref())
            .await?;
        self.machine
            .publish(Event::UserStatusUpdated {
                user_id,
                status: stored.result.clone(),
            })
            .await;

        Ok(stored)
    }

    pub async fn apply_report(&self, raw: Value) -> Result<ReportResource, AppError> {
        let report = ReportResource::from_value(raw)
            .ok_or_else(|| AppError::BadRequest("Report resource has no id".to_string()))?;
        let stored = self.machine.store().upsert_report(&report).await?;
        self.machine
            .publish(Event::ResourceUpdated(Resource::Report(stored.clone())))
            .await;
        Ok(stored)
    }

    /// Registers the user with the provider if needed and starts a check.
    pub async fn start_check(&self, user_id: Uuid) -> Result<CheckResource, AppError> {
        let store = self.machine.store();
        let user = store.get_user(user_id).await?;

        let applicant_id = match user.onfido_id.clone() {
            Some(id) => id,
            None => {
                let created = self
                    .api
                    .create_applicant(&user)
                    .await
                    .map_err(|e| AppError::ExternalApiError(e.to_string()))?;
                let id = created
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AppError::ExternalApiError("Applicant response missing 'id'".to_string())
                    })?
                    .to_string();
                store.set_onfido_id(user.id, &id).await?;
                id
            }
        };

        let raw = self
            .api
            .create_check(&applicant_id)
            .await
            .map_err(|e| AppError::ExternalApiError(e.to_string()))?;
        self.apply_check(raw, Some(user.id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_from_payload() {
        let payload = json!({
            "resource_type": "check",
            "action": "check.completed",
            "object": {"id": "chk", "href": "/v2/checks/chk"}
        });
        let envelope = WebhookEnvelope::from_payload(payload.clone());
        assert_eq!(envelope.resource_type.as_deref(), Some("check"));
        assert_eq!(envelope.href(), Some("/v2/checks/chk"));
        assert_eq!(envelope.digest, payload_digest(&payload));
        assert_eq!(envelope.digest.len(), 64);
    }

    #[test]
    fn test_digest_differs_per_payload() {
        assert_ne!(
            payload_digest(&json!({"a": 1})),
            payload_digest(&json!({"a": 2}))
        );
    }
}
