//! Drives users through the two identity provider stages.
//!
//! Each entry point first moves the user from the stage's "not verified"
//! state into its pending state and only talks to the provider when that
//! transition both won and settled where it was asked to. Provider failures never leave this module: they end the
//! stage in the corresponding `*_failed` state.

use serde_json::Value;
use std::sync::Arc;

use crate::config::VerificationPolicy;
use crate::documents::{encode_upload, DocumentStore};
use crate::errors::AppError;
use crate::idm_client::{build_request_body, IdDocuments, IdmTransport, ProviderError};
use crate::ledger::VerificationLedger;
use crate::mapper::{normalize_idm, stage_result_value, CanonicalStatus, IDM_MANUAL_REVIEW};
use crate::models::{
    DeclineReason, IdUpload, User, UserState, VerificationResponse, VerificationStage,
};
use crate::state_machine::StateMachine;

/// Why a provider round trip did not produce a response.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    App(#[from] AppError),
}

pub struct VerificationOrchestrator {
    machine: Arc<StateMachine>,
    ledger: Arc<VerificationLedger>,
    transport: Arc<dyn IdmTransport>,
    documents: Arc<dyn DocumentStore>,
    policy: VerificationPolicy,
}

impl VerificationOrchestrator {
    pub fn new(
        machine: Arc<StateMachine>,
        ledger: Arc<VerificationLedger>,
        transport: Arc<dyn IdmTransport>,
        documents: Arc<dyn DocumentStore>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            machine,
            ledger,
            transport,
            documents,
            policy,
        }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &VerificationLedger {
        &self.ledger
    }

    /// Stage 1: submits the user's basic info. Returns the settled state.
    pub async fn verify_info(&self, user: &User) -> Result<UserState, AppError> {
        let outcome = self
            .machine
            .try_transition_from(
                user.id,
                UserState::InfoNotVerified,
                UserState::InfoPendingVerification,
                None,
                None,
            )
            .await?;
        if !outcome.reached_target() {
            tracing::info!(
                "Skipping info verification for user {}: now {}",
                user.id,
                outcome.settled
            );
            return Ok(outcome.settled);
        }

        let user = self.machine.store().get_user(user.id).await?;
        let body = build_request_body(&user, None, None);

        let response = match self.request(&user, VerificationStage::Info, body).await {
            Ok(response) => response,
            Err(VerifyError::Provider(e)) => {
                tracing::error!("Info verification failed for user {}: {}", user.id, e);
                return self
                    .machine
                    .transition(user.id, UserState::InfoFailed, None, Some(e.detail()))
                    .await;
            }
            Err(VerifyError::App(e)) => return Err(e),
        };

        self.apply_response(&user, &response, VerificationStage::Info)
            .await
    }

    /// Stage 2: submits both document images of `upload`. Returns the settled state.
    pub async fn verify_ids(
        &self,
        upload: &IdUpload,
        ip: Option<&str>,
    ) -> Result<UserState, AppError> {
        let outcome = self
            .machine
            .try_transition_from(
                upload.user_id,
                UserState::IdNotVerified,
                UserState::IdPendingVerification,
                None,
                None,
            )
            .await?;
        if !outcome.reached_target() {
            tracing::info!(
                "Skipping ID verification for user {}: now {}",
                upload.user_id,
                outcome.settled
            );
            return Ok(outcome.settled);
        }

        let user = self.machine.store().get_user(upload.user_id).await?;

        let documents = match self.load_documents(upload).await {
            Ok(documents) => documents,
            Err(e) => {
                tracing::error!("Could not load documents for user {}: {}", user.id, e);
                return self
                    .machine
                    .transition(user.id, UserState::IdFailed, None, Some(e.to_string()))
                    .await;
            }
        };
        let body = build_request_body(&user, Some(&documents), ip);

        let response = match self.request(&user, VerificationStage::Id, body).await {
            Ok(response) => response,
            Err(VerifyError::Provider(e)) => {
                tracing::error!("ID verification failed for user {}: {}", user.id, e);
                return self
                    .machine
                    .transition(user.id, UserState::IdFailed, None, Some(e.detail()))
                    .await;
            }
            Err(VerifyError::App(e)) => return Err(e),
        };

        if response.user_id.is_none() {
            tracing::info!(
                "ID response {} has no user; waiting for callback",
                response.transaction_id
            );
            return Ok(self.machine.store().get_user(user.id).await?.state);
        }

        self.apply_response(&user, &response, VerificationStage::Id)
            .await
    }

    /// Records a provider callback and applies it to the correlated user.
    /// Returns `None` when nobody could be correlated.
    pub async fn handle_callback(&self, raw: Value) -> Result<Option<UserState>, AppError> {
        let response = self.ledger.record_response(raw).await?;
        self.apply_webhook_response(&response).await
    }

    /// Applies a stored callback, choosing the stage from the user's current state.
    pub async fn apply_webhook_response(
        &self,
        response: &VerificationResponse,
    ) -> Result<Option<UserState>, AppError> {
        let Some(user_id) = response.user_id else {
            return Ok(None);
        };
        let user = self.machine.store().get_user(user_id).await?;
        let stage = if user.state.is_info_stage() {
            VerificationStage::Info
        } else {
            VerificationStage::Id
        };
        self.apply_response(&user, response, stage).await.map(Some)
    }

    /// Writes the stage result and performs the transition the status calls for.
    pub async fn apply_response(
        &self,
        user: &User,
        response: &VerificationResponse,
        stage: VerificationStage,
    ) -> Result<UserState, AppError> {
        let raw = response.raw_status();
        let canonical = normalize_idm(raw);
        self.machine
            .store()
            .set_stage_result(user.id, stage, stage_result_value(raw, canonical))
            .await?;

        match (canonical, stage) {
            (CanonicalStatus::Declined, VerificationStage::Info) => {
                self.machine
                    .transition(
                        user.id,
                        UserState::InfoDeclined,
                        Some(DeclineReason::DeclineProviderInfo),
                        response.user_reputation.clone(),
                    )
                    .await
            }
            (CanonicalStatus::Declined, VerificationStage::Id) => {
                tracing::info!("ID declined for user {}; left for manual review", user.id);
                self.current_state(user).await
            }
            (CanonicalStatus::Accepted | CanonicalStatus::Pending, VerificationStage::Info) => {
                self.machine
                    .transition(user.id, UserState::InfoVerified, None, None)
                    .await
            }
            (CanonicalStatus::Accepted | CanonicalStatus::Pending, VerificationStage::Id) => {
                self.machine
                    .transition(user.id, UserState::IdVerified, None, None)
                    .await
            }
            (CanonicalStatus::Unknown, _) => {
                tracing::warn!(
                    "Unknown status {:?} for user {} (transaction {}); no transition",
                    raw,
                    user.id,
                    response.transaction_id
                );
                self.current_state(user).await
            }
        }
    }

    async fn current_state(&self, user: &User) -> Result<UserState, AppError> {
        Ok(self.machine.store().get_user(user.id).await?.state)
    }

    /// Reason a request for `stage` must not be sent, if any.
    async fn skip_reason(
        &self,
        user: &User,
        stage: VerificationStage,
    ) -> Result<Option<String>, AppError> {
        match user.country_code.as_deref() {
            None => return Ok(Some("no country code".to_string())),
            Some(code) if self.policy.is_banned(code) => {
                return Ok(Some(format!("banned country {}", code)))
            }
            _ => {}
        }

        if stage == VerificationStage::Id
            && user.kyc_result.as_deref() != Some(CanonicalStatus::Accepted.as_str())
        {
            return Ok(Some(format!("info result is {:?}", user.kyc_result)));
        }

        let verified = self
            .machine
            .store()
            .count_users_in_state(UserState::IdVerified)
            .await?;
        if verified >= self.policy.verified_ids_cap {
            return Ok(Some(format!(
                "verified IDs cap reached ({}/{})",
                verified, self.policy.verified_ids_cap
            )));
        }

        if !self.transport.is_enabled() {
            return Ok(Some("identity provider disabled".to_string()));
        }

        Ok(None)
    }

    /// Runs the guards, records the request, calls the provider and records the reply.
    /// A skipped request yields an unsaved pending response with no user.
    async fn request(
        &self,
        user: &User,
        stage: VerificationStage,
        body: Value,
    ) -> Result<VerificationResponse, VerifyError> {
        if let Some(reason) = self.skip_reason(user, stage).await? {
            tracing::warn!(
                "Not sending stage {} request for user {}: {}",
                stage.number(),
                user.id,
                reason
            );
            return Ok(VerificationResponse::empty(IDM_MANUAL_REVIEW));
        }

        let request = self.ledger.create_request(user, stage, body).await?;

        match self.transport.submit(&request.request_data).await {
            Ok(reply) => {
                self.ledger.mark_sent(&request, Some(200)).await?;
                self.ledger
                    .record_response(reply)
                    .await
                    .map_err(|e| match e {
                        AppError::BadRequest(msg) => {
                            VerifyError::Provider(ProviderError::InvalidBody(msg))
                        }
                        other => VerifyError::App(other),
                    })
            }
            Err(e) => {
                self.ledger
                    .mark_sent(&request, e.status_code().map(i32::from))
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn load_documents(&self, upload: &IdUpload) -> Result<IdDocuments, AppError> {
        let store = self.machine.store();
        let mut images = Vec::with_capacity(2);
        for upload_id in [upload.upload1, upload.upload2] {
            let file = store
                .get_upload(upload_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))?;
            images.push(encode_upload(self.documents.as_ref(), &file).await?);
        }
        let image2 = images.pop();
        let image1 = images.pop();

        Ok(IdDocuments {
            image1,
            image2,
            doc_country: Some(upload.doc_country.clone()),
            doc_state: upload.doc_state.clone(),
            doc_type: Some(upload.doc_type.as_str().to_string()),
        })
    }
}
