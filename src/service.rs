//! Operations exposed to the HTTP layer.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::VerificationPolicy;
use crate::documents::{DocumentStore, MAX_DOCUMENT_SIZE};
use crate::errors::AppError;
use crate::models::{DocType, IdUpload, LookupKey, Upload, User, UserState};
use crate::state_machine::StateMachine;
use crate::validation::{to_eth, InfoSubmission};
use crate::verification::VerificationOrchestrator;

/// Provider status meaning every report came back clear.
const STATUS_CLEAR: &str = "clear";

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentSubmission {
    pub user_id: Uuid,
    pub upload1: Uuid,
    pub upload2: Uuid,
    pub doc_type: String,
    pub doc_country: String,
    #[serde(default)]
    pub doc_state: Option<String>,
}

pub struct WhitelistService {
    machine: Arc<StateMachine>,
    orchestrator: Arc<VerificationOrchestrator>,
    documents: Arc<dyn DocumentStore>,
    policy: VerificationPolicy,
}

impl WhitelistService {
    pub fn new(
        machine: Arc<StateMachine>,
        orchestrator: Arc<VerificationOrchestrator>,
        documents: Arc<dyn DocumentStore>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            machine,
            orchestrator,
            documents,
            policy,
        }
    }

    pub fn orchestrator(&self) -> &VerificationOrchestrator {
        &self.orchestrator
    }

    pub fn whitelist_open(&self) -> Result<(), AppError> {
        self.policy.check_open(Utc::now())
    }

    /// Returns the user and whether it was created by this call.
    pub async fn submit_info(
        &self,
        submission: InfoSubmission,
        ip: Option<String>,
        ip_country: Option<String>,
    ) -> Result<(User, bool), AppError> {
        self.whitelist_open()?;
        let new_user = submission.validate(ip, ip_country)?;
        let store = self.machine.store();

        if let Some(ref addr) = new_user.eth_address {
            if let Some(existing) = store.find_user(&LookupKey::EthAddress(addr.clone())).await? {
                tracing::info!("Returning existing user {} for {}", existing.id, addr);
                return Ok((existing, false));
            }
        }

        if self.policy.new_users_closed {
            return Err(AppError::WhitelistClosed(None));
        }

        let user = store.insert_user(new_user).await?;
        tracing::info!("Created user {}", user.id);

        let settled = self
            .machine
            .transition(user.id, UserState::InfoNotVerified, None, None)
            .await?;
        if settled == UserState::InfoNotVerified {
            let user = store.get_user(user.id).await?;
            let state = self.orchestrator.verify_info(&user).await?;
            tracing::info!("Info verification for user {} ended in {}", user.id, state);
        }

        Ok((store.get_user(user.id).await?, true))
    }

    /// Stores an uploaded file for later ID verification.
    pub async fn create_upload(
        &self,
        user_id: Uuid,
        content_type: &str,
        original_filename: &str,
        bytes: &[u8],
    ) -> Result<Upload, AppError> {
        let user = self.machine.store().get_user(user_id).await?;
        if bytes.is_empty() {
            return Err(AppError::BadRequest("Empty upload".to_string()));
        }

        let upload = Upload {
            id: Uuid::new_v4(),
            user_id: user.id,
            content_type: content_type.to_string(),
            original_filename: original_filename.to_string(),
            size: bytes.len() as i64,
            created_at: Utc::now(),
        };
        self.documents.save(&upload.storage_key(), bytes).await?;
        self.machine.store().insert_upload(&upload).await?;
        Ok(upload)
    }

    pub async fn submit_documents(&self, submission: DocumentSubmission) -> Result<IdUpload, AppError> {
        let store = self.machine.store();
        let user = store.get_user(submission.user_id).await?;
        if user.state != UserState::InfoVerified {
            return Err(AppError::InvalidState(user.state.to_string()));
        }

        let doc_type: DocType = submission.doc_type.parse().map_err(AppError::BadRequest)?;
        if submission.doc_country.chars().count() != 2 {
            return Err(AppError::BadRequest("doc_country must be 2 characters".to_string()));
        }
        if let Some(ref state) = submission.doc_state {
            let len = state.chars().count();
            if !(2..=20).contains(&len) {
                return Err(AppError::BadRequest(
                    "doc_state length must be between 2 and 20".to_string(),
                ));
            }
        }

        for upload_id in [submission.upload1, submission.upload2] {
            let upload = store
                .get_upload(upload_id)
                .await?
                .filter(|u| u.user_id == user.id)
                .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))?;
            if upload.size > MAX_DOCUMENT_SIZE {
                return Err(AppError::BadRequest(format!(
                    "Upload {} is larger than {} bytes",
                    upload_id, MAX_DOCUMENT_SIZE
                )));
            }
        }

        let id_upload = IdUpload {
            id: Uuid::new_v4(),
            user_id: user.id,
            upload1: submission.upload1,
            upload2: submission.upload2,
            doc_type,
            doc_country: submission.doc_country.to_ascii_uppercase(),
            doc_state: submission.doc_state,
            created_at: Utc::now(),
        };
        store.insert_id_upload(&id_upload).await?;
        store.set_doc_type(user.id, doc_type.as_str()).await?;
        self.machine
            .transition(user.id, UserState::IdNotVerified, None, None)
            .await?;

        Ok(id_upload)
    }

    pub async fn start_id_verification(
        &self,
        upload_id: Uuid,
        user_id: Uuid,
        ip: Option<&str>,
    ) -> Result<User, AppError> {
        let store = self.machine.store();
        let user = store.get_user(user_id).await?;
        if user.state != UserState::IdNotVerified {
            return Err(AppError::InvalidState(user.state.to_string()));
        }

        let upload = store
            .get_id_upload(upload_id)
            .await?
            .filter(|u| u.user_id == user.id)
            .ok_or_else(|| AppError::NotFound(format!("ID upload {} not found", upload_id)))?;

        let state = self.orchestrator.verify_ids(&upload, ip).await?;
        tracing::info!("ID verification for user {} ended in {}", user.id, state);
        store.get_user(user.id).await
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, AppError> {
        self.machine.store().get_user(user_id).await
    }

    pub async fn get_user_by_eth_address(&self, addr: &str) -> Result<User, AppError> {
        let addr = to_eth(addr).map_err(|_| AppError::NotFound(format!("User {} not found", addr)))?;
        self.machine
            .store()
            .find_user(&LookupKey::EthAddress(addr.clone()))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", addr)))
    }

    /// `approved`, `declined` or `not-found` for a contribution address.
    pub async fn whitelist_status_for_address(&self, addr: &str) -> Result<&'static str, AppError> {
        match self.get_user_by_eth_address(addr).await {
            Ok(user) if user.onfido_status.as_deref() == Some(STATUS_CLEAR) => Ok("approved"),
            Ok(_) => Ok("declined"),
            Err(AppError::NotFound(_)) => Ok("not-found"),
            Err(e) => Err(e),
        }
    }
}
