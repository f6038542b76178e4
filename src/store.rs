//! Persistence seam used by the verification core.
//!
//! Every method is a single atomic operation. Nothing here spans several
//! records, so callers must tolerate a crash between two calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CheckResource, DeclineReason, IdUpload, LookupKey, NewUser, ReportResource, Upload, User,
    UserState, VerificationRequest, VerificationResponse, VerificationStage, WebhookEnvelope,
};

/// State change applied by [`Store::compare_and_set_state`].
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub expected: UserState,
    pub target: UserState,
    pub decline_reason: Option<DeclineReason>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---- users ----

    /// Inserts a new user; `Conflict` on duplicate email, eth address or telegram.
    async fn insert_user(&self, user: NewUser) -> Result<User, AppError>;

    async fn find_user(&self, key: &LookupKey) -> Result<Option<User>, AppError>;

    /// `NotFound` instead of `None`.
    async fn get_user(&self, user_id: Uuid) -> Result<User, AppError> {
        self.find_user(&LookupKey::Id(user_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    /// Writes `target` only if the stored state still equals `expected`.
    /// Returns whether the write happened. Decline reasons survive only on final states.
    async fn compare_and_set_state(&self, user_id: Uuid, update: StateUpdate)
        -> Result<bool, AppError>;

    async fn set_stage_result(
        &self,
        user_id: Uuid,
        stage: VerificationStage,
        value: Option<String>,
    ) -> Result<(), AppError>;

    /// Sets the shared transaction id unless one is already present; returns the stored id.
    async fn claim_transaction_id(&self, user_id: Uuid, candidate: &str)
        -> Result<String, AppError>;

    async fn set_doc_type(&self, user_id: Uuid, doc_type: &str) -> Result<(), AppError>;

    async fn set_onfido_id(&self, user_id: Uuid, applicant_id: &str) -> Result<(), AppError>;

    async fn set_onfido_status(&self, user_id: Uuid, status: Option<&str>)
        -> Result<(), AppError>;

    async fn count_users_in_state(&self, state: UserState) -> Result<i64, AppError>;

    // ---- verification ledger ----

    /// `Conflict` when the (transaction id, stage) pair already exists.
    async fn insert_request(&self, request: &VerificationRequest) -> Result<(), AppError>;

    async fn mark_request_completed(
        &self,
        request_id: Uuid,
        requested_at: DateTime<Utc>,
        response_status: Option<i32>,
    ) -> Result<(), AppError>;

    /// Latest request carrying this transaction id, if any.
    async fn find_request_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<VerificationRequest>, AppError>;

    async fn insert_response(&self, response: &VerificationResponse) -> Result<(), AppError>;

    // ---- uploads ----

    async fn insert_upload(&self, upload: &Upload) -> Result<(), AppError>;

    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, AppError>;

    async fn insert_id_upload(&self, upload: &IdUpload) -> Result<(), AppError>;

    async fn get_id_upload(&self, upload_id: Uuid) -> Result<Option<IdUpload>, AppError>;

    // ---- document provider mirrors ----

    async fn insert_webhook(&self, envelope: &WebhookEnvelope) -> Result<(), AppError>;

    /// Single-statement upsert by provider id. A missing user never clears a stored one.
    async fn upsert_check(&self, check: &CheckResource) -> Result<CheckResource, AppError>;

    async fn upsert_report(&self, report: &ReportResource) -> Result<ReportResource, AppError>;

    /// Mirrored check by provider id. Only read for inspection; reconciliation
    /// goes through `upsert_check`.
    async fn get_check(&self, check_id: &str) -> Result<Option<CheckResource>, AppError>;

    /// Flags a complete check as handled. True only for the first caller.
    /// Callers claim completion only once the check has a user.
    async fn mark_check_completed(&self, check_id: &str) -> Result<bool, AppError>;
}

/// Applies a decline reason / detail update the same way in every store.
pub(crate) fn apply_state_update(user: &mut User, update: &StateUpdate) {
    user.state = update.target;
    if update.target.is_final() {
        if update.decline_reason.is_some() {
            user.decline_reason = update.decline_reason;
        }
    } else {
        user.decline_reason = None;
    }
    if let Some(ref detail) = update.detail {
        user.info = Some(detail.clone());
    }
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    requests: Vec<VerificationRequest>,
    responses: Vec<VerificationResponse>,
    uploads: HashMap<Uuid, Upload>,
    id_uploads: HashMap<Uuid, IdUpload>,
    webhooks: Vec<WebhookEnvelope>,
    checks: HashMap<String, (CheckResource, bool)>,
    reports: HashMap<String, ReportResource>,
}

/// Process-local store. One mutex guards everything, which makes each
/// method trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<VerificationRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn responses(&self) -> Vec<VerificationResponse> {
        self.inner.lock().responses.clone()
    }

    pub fn webhooks(&self) -> Vec<WebhookEnvelope> {
        self.inner.lock().webhooks.clone()
    }

    pub fn check_count(&self) -> usize {
        self.inner.lock().checks.len()
    }

    pub fn report_count(&self) -> usize {
        self.inner.lock().reports.len()
    }

    /// Test helper: place a user directly into a state without dispatch.
    pub fn force_state(&self, user_id: Uuid, state: UserState) {
        if let Some(user) = self.inner.lock().users.get_mut(&user_id) {
            user.state = state;
        }
    }
}

fn user_mut<'a>(state: &'a mut MemoryState, user_id: Uuid) -> Result<&'a mut User, AppError> {
    state
        .users
        .get_mut(&user_id)
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, new_user: NewUser) -> Result<User, AppError> {
        let mut state = self.inner.lock();
        for existing in state.users.values() {
            if existing.email == new_user.email {
                return Err(AppError::Conflict("email already registered".to_string()));
            }
            if new_user.eth_address.is_some() && existing.eth_address == new_user.eth_address {
                return Err(AppError::Conflict("eth address already registered".to_string()));
            }
            if new_user.telegram.is_some() && existing.telegram == new_user.telegram {
                return Err(AppError::Conflict("telegram already registered".to_string()));
            }
        }
        let user = new_user.into_user(Uuid::new_v4(), Utc::now());
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, key: &LookupKey) -> Result<Option<User>, AppError> {
        let state = self.inner.lock();
        let found = match key {
            LookupKey::Id(id) => state.users.get(id).cloned(),
            LookupKey::Email(email) => state.users.values().find(|u| &u.email == email).cloned(),
            LookupKey::EthAddress(addr) => state
                .users
                .values()
                .find(|u| u.eth_address.as_deref() == Some(addr.as_str()))
                .cloned(),
            LookupKey::Telegram(handle) => state
                .users
                .values()
                .find(|u| u.telegram.as_deref() == Some(handle.as_str()))
                .cloned(),
        };
        Ok(found)
    }

    async fn compare_and_set_state(
        &self,
        user_id: Uuid,
        update: StateUpdate,
    ) -> Result<bool, AppError> {
        let mut state = self.inner.lock();
        let user = user_mut(&mut state, user_id)?;
        if user.state != update.expected {
            return Ok(false);
        }
        apply_state_update(user, &update);
        Ok(true)
    }

    async fn set_stage_result(
        &self,
        user_id: Uuid,
        stage: VerificationStage,
        value: Option<String>,
    ) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        let user = user_mut(&mut state, user_id)?;
        match stage {
            VerificationStage::Info => user.kyc_result = value,
            VerificationStage::Id => user.idm_result = value,
        }
        Ok(())
    }

    async fn claim_transaction_id(
        &self,
        user_id: Uuid,
        candidate: &str,
    ) -> Result<String, AppError> {
        let mut state = self.inner.lock();
        let user = user_mut(&mut state, user_id)?;
        Ok(user
            .idm_tid
            .get_or_insert_with(|| candidate.to_string())
            .clone())
    }

    async fn set_doc_type(&self, user_id: Uuid, doc_type: &str) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        user_mut(&mut state, user_id)?.doc_type = Some(doc_type.to_string());
        Ok(())
    }

    async fn set_onfido_id(&self, user_id: Uuid, applicant_id: &str) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        user_mut(&mut state, user_id)?.onfido_id = Some(applicant_id.to_string());
        Ok(())
    }

    async fn set_onfido_status(
        &self,
        user_id: Uuid,
        status: Option<&str>,
    ) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        user_mut(&mut state, user_id)?.onfido_status = status.map(str::to_string);
        Ok(())
    }

    async fn count_users_in_state(&self, target: UserState) -> Result<i64, AppError> {
        let state = self.inner.lock();
        Ok(state.users.values().filter(|u| u.state == target).count() as i64)
    }

    async fn insert_request(&self, request: &VerificationRequest) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        if state
            .requests
            .iter()
            .any(|r| r.transaction_id == request.transaction_id && r.stage == request.stage)
        {
            return Err(AppError::Conflict(format!(
                "transaction {} already exists for stage {}",
                request.transaction_id,
                request.stage.number()
            )));
        }
        state.requests.push(request.clone());
        Ok(())
    }

    async fn mark_request_completed(
        &self,
        request_id: Uuid,
        requested_at: DateTime<Utc>,
        response_status: Option<i32>,
    ) -> Result<(), AppError> {
        let mut state = self.inner.lock();
        let request = state
            .requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or_else(|| AppError::NotFound(format!("Request {} not found", request_id)))?;
        request.requested_at = Some(requested_at);
        request.response_status = response_status;
        Ok(())
    }

    async fn find_request_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<VerificationRequest>, AppError> {
        let state = self.inner.lock();
        Ok(state
            .requests
            .iter()
            .filter(|r| r.transaction_id == transaction_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn insert_response(&self, response: &VerificationResponse) -> Result<(), AppError> {
        self.inner.lock().responses.push(response.clone());
        Ok(())
    }

    async fn insert_upload(&self, upload: &Upload) -> Result<(), AppError> {
        self.inner.lock().uploads.insert(upload.id, upload.clone());
        Ok(())
    }

    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        Ok(self.inner.lock().uploads.get(&upload_id).cloned())
    }

    async fn insert_id_upload(&self, upload: &IdUpload) -> Result<(), AppError> {
        self.inner.lock().id_uploads.insert(upload.id, upload.clone());
        Ok(())
    }

    async fn get_id_upload(&self, upload_id: Uuid) -> Result<Option<IdUpload>, AppError> {
        Ok(self.inner.lock().id_uploads.get(&upload_id).cloned())
    }

    async fn insert_webhook(&self, envelope: &WebhookEnvelope) -> Result<(), AppError> {
        self.inner.lock().webhooks.push(envelope.clone());
        Ok(())
    }

    async fn upsert_check(&self, check: &CheckResource) -> Result<CheckResource, AppError> {
        let mut state = self.inner.lock();
        let entry = state
            .checks
            .entry(check.id.clone())
            .or_insert_with(|| (check.clone(), false));
        let user_id = check.user_id.or(entry.0.user_id);
        entry.0 = CheckResource {
            user_id,
            ..check.clone()
        };
        Ok(entry.0.clone())
    }

    async fn upsert_report(&self, report: &ReportResource) -> Result<ReportResource, AppError> {
        let mut state = self.inner.lock();
        let user_id = report
            .user_id
            .or_else(|| state.reports.get(&report.id).and_then(|r| r.user_id));
        let stored = ReportResource {
            user_id,
            ..report.clone()
        };
        state.reports.insert(report.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_check(&self, check_id: &str) -> Result<Option<CheckResource>, AppError> {
        Ok(self
            .inner
            .lock()
            .checks
            .get(check_id)
            .map(|(check, _)| check.clone()))
    }

    async fn mark_check_completed(&self, check_id: &str) -> Result<bool, AppError> {
        let mut state = self.inner.lock();
        match state.checks.get_mut(check_id) {
            Some((_, completed)) if !*completed => {
                *completed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
