use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============ User lifecycle ============

/// Canonical lifecycle state of a whitelist applicant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    /// No action performed yet.
    NewUser,
    /// Basic info provided, not yet submitted to the identity provider.
    InfoNotVerified,
    /// Basic info submitted, waiting for a response.
    InfoPendingVerification,
    /// Basic info verified.
    InfoVerified,
    /// Basic info declined by the identity provider.
    InfoDeclined,
    /// Request to the identity provider failed.
    InfoFailed,
    /// ID documents uploaded, not yet submitted.
    IdNotVerified,
    /// ID documents submitted, waiting for verification.
    IdPendingVerification,
    /// ID documents verified.
    IdVerified,
    /// ID documents declined.
    IdDeclined,
    /// ID verification request failed.
    IdFailed,
    /// Admin approved the user, no cap set yet.
    ApprovedNoCap,
    /// Admin approved the user and set a personal cap.
    ApprovedCap,
    /// Contribution landed on chain.
    Contributed,
    /// Admin declined the user.
    Declined,
}

impl UserState {
    /// Happy path, in order.
    pub const FLOW: [UserState; 10] = [
        UserState::NewUser,
        UserState::InfoNotVerified,
        UserState::InfoPendingVerification,
        UserState::InfoVerified,
        UserState::IdNotVerified,
        UserState::IdPendingVerification,
        UserState::IdVerified,
        UserState::ApprovedNoCap,
        UserState::ApprovedCap,
        UserState::Contributed,
    ];

    /// Terminal decline/failure branches.
    pub const FINAL: [UserState; 5] = [
        UserState::Declined,
        UserState::IdDeclined,
        UserState::IdFailed,
        UserState::InfoDeclined,
        UserState::InfoFailed,
    ];

    /// States in which a provider response is applied as the info stage.
    pub const INFO_STAGE: [UserState; 4] = [
        UserState::InfoNotVerified,
        UserState::InfoPendingVerification,
        UserState::InfoVerified,
        UserState::InfoDeclined,
    ];

    pub fn all() -> impl Iterator<Item = UserState> {
        Self::FLOW.into_iter().chain(Self::FINAL)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::NewUser => "new_user",
            UserState::InfoNotVerified => "info_not_verified",
            UserState::InfoPendingVerification => "info_pending_verification",
            UserState::InfoVerified => "info_verified",
            UserState::InfoDeclined => "info_declined",
            UserState::InfoFailed => "info_failed",
            UserState::IdNotVerified => "id_not_verified",
            UserState::IdPendingVerification => "id_pending_verification",
            UserState::IdVerified => "id_verified",
            UserState::IdDeclined => "id_declined",
            UserState::IdFailed => "id_failed",
            UserState::ApprovedNoCap => "approved_no_cap",
            UserState::ApprovedCap => "approved_cap",
            UserState::Contributed => "contributed",
            UserState::Declined => "declined",
        }
    }

    /// Terminal states are the only ones that may carry a decline reason.
    pub fn is_final(&self) -> bool {
        Self::FINAL.contains(self)
    }

    pub fn is_info_stage(&self) -> bool {
        Self::INFO_STAGE.contains(self)
    }
}

impl fmt::Display for UserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserState::all()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown user state '{}'", s))
    }
}

/// Why a user ended in a decline-type state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// Country code missing or banned.
    DeclineCountry,
    /// Identity provider declined the basic info.
    DeclineProviderInfo,
    /// Identity provider declined the ID documents.
    DeclineProviderId,
    /// Admin declined.
    DeclineAdmin,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::DeclineCountry => "decline_country",
            DeclineReason::DeclineProviderInfo => "decline_provider_info",
            DeclineReason::DeclineProviderId => "decline_provider_id",
            DeclineReason::DeclineAdmin => "decline_admin",
        }
    }
}

impl FromStr for DeclineReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decline_country" => Ok(DeclineReason::DeclineCountry),
            "decline_provider_info" => Ok(DeclineReason::DeclineProviderInfo),
            "decline_provider_id" => Ok(DeclineReason::DeclineProviderId),
            "decline_admin" => Ok(DeclineReason::DeclineAdmin),
            other => Err(format!("unknown decline reason '{}'", other)),
        }
    }
}

/// A `(previous, new)` pair handed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: UserState,
    pub to: UserState,
}

/// Optional social profile links collected at signup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialHandles {
    pub medium: Option<String>,
    pub reddit: Option<String>,
    pub twitter: Option<String>,
    pub linkedin: Option<String>,
    pub facebook: Option<String>,
}

/// Whitelist applicant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub email: String,
    pub eth_address: Option<String>,
    pub eth_amount: Option<BigDecimal>,
    pub eth_cap: Option<BigDecimal>,
    pub telegram: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub dob: Option<DateTime<Utc>>,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state_code: Option<String>,
    pub zip_code: String,
    pub country_code: Option<String>,
    pub ip: Option<String>,
    pub ip_country: Option<String>,
    /// Device fingerprint forwarded to the identity provider.
    pub dfp: Option<String>,
    pub confirmed_location: bool,
    pub socials: SocialHandles,

    pub state: UserState,
    pub decline_reason: Option<DeclineReason>,
    /// Free-text diagnostic (provider error body, reputation marker).
    pub info: Option<String>,

    /// Identity provider transaction id shared by both verification stages.
    pub idm_tid: Option<String>,
    /// Canonical result of the info stage.
    pub kyc_result: Option<String>,
    /// Canonical result of the ID stage.
    pub idm_result: Option<String>,
    pub doc_type: Option<String>,

    /// Applicant id assigned by the document provider.
    pub onfido_id: Option<String>,
    /// Result of the latest completed document check.
    pub onfido_status: Option<String>,

    pub contribution_amount: BigDecimal,
    pub contribution_tx: Vec<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<User:{}:{}>", self.id, self.state)
    }
}

/// Validated fields for a user about to be created.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub eth_address: Option<String>,
    pub eth_amount: Option<BigDecimal>,
    pub telegram: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub dob: Option<DateTime<Utc>>,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state_code: Option<String>,
    pub zip_code: String,
    pub country_code: Option<String>,
    pub ip: Option<String>,
    pub ip_country: Option<String>,
    pub dfp: Option<String>,
    pub confirmed_location: bool,
    pub socials: SocialHandles,
}

impl NewUser {
    /// Materializes the record in the `NewUser` state.
    pub fn into_user(self, id: Uuid, created_at: DateTime<Utc>) -> User {
        User {
            id,
            created_at,
            email: self.email,
            eth_address: self.eth_address,
            eth_amount: self.eth_amount,
            eth_cap: None,
            telegram: self.telegram,
            first_name: self.first_name,
            last_name: self.last_name,
            dob: self.dob,
            phone: self.phone,
            address: self.address,
            city: self.city,
            state_code: self.state_code,
            zip_code: self.zip_code,
            country_code: self.country_code,
            ip: self.ip,
            ip_country: self.ip_country,
            dfp: self.dfp,
            confirmed_location: self.confirmed_location,
            socials: self.socials,
            state: UserState::NewUser,
            decline_reason: None,
            info: None,
            idm_tid: None,
            kyc_result: None,
            idm_result: None,
            doc_type: None,
            onfido_id: None,
            onfido_status: None,
            contribution_amount: BigDecimal::from(0),
            contribution_tx: Vec::new(),
        }
    }
}

/// One way of addressing a user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKey {
    Id(Uuid),
    Email(String),
    EthAddress(String),
    Telegram(String),
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupKey::Id(id) => write!(f, "id={}", id),
            LookupKey::Email(email) => write!(f, "email={}", email),
            LookupKey::EthAddress(addr) => write!(f, "eth_address={}", addr),
            LookupKey::Telegram(handle) => write!(f, "telegram={}", handle),
        }
    }
}

/// Public view returned by the user endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: Option<i64>,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state_code: Option<String>,
    pub zip_code: String,
    pub country_code: Option<String>,
    pub confirmed_location: bool,
    pub eth_address: Option<String>,
    pub eth_amount: Option<BigDecimal>,
    pub eth_cap: Option<BigDecimal>,
    pub state: UserState,
    pub decline_reason: Option<DeclineReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl UserResponse {
    pub fn with_token(self, token: String) -> Self {
        Self {
            token: Some(token),
            ..self
        }
    }
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            dob: user.dob.map(|d| d.timestamp()),
            phone: user.phone.clone(),
            address: user.address.clone(),
            city: user.city.clone(),
            state_code: user.state_code.clone(),
            zip_code: user.zip_code.clone(),
            country_code: user.country_code.clone(),
            confirmed_location: user.confirmed_location,
            eth_address: user.eth_address.clone(),
            eth_amount: user.eth_amount.clone(),
            eth_cap: user.eth_cap.clone(),
            state: user.state,
            decline_reason: user.decline_reason,
            token: None,
        }
    }
}

// ============ Verification ledger ============

/// Identity provider verification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    Info,
    Id,
}

impl VerificationStage {
    /// Stage number sent on the wire.
    pub fn number(&self) -> i16 {
        match self {
            VerificationStage::Info => 1,
            VerificationStage::Id => 2,
        }
    }

    pub fn from_number(n: i16) -> Option<Self> {
        match n {
            1 => Some(VerificationStage::Info),
            2 => Some(VerificationStage::Id),
            _ => None,
        }
    }
}

/// One outbound call to the identity provider.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stage: VerificationStage,
    pub created_at: DateTime<Utc>,
    pub requested_at: Option<DateTime<Utc>>,
    pub transaction_id: String,
    pub request_data: Value,
    pub response_status: Option<i32>,
}

/// One inbound identity provider result, synchronous or via webhook.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResponse {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
    pub transaction_id: String,
    pub result: Option<String>,
    pub kyc_state: Option<String>,
    pub user_reputation: Option<String>,
    pub fraud_result: Option<String>,
    pub previous_reputation: Option<String>,
    pub response_data: Value,
}

impl VerificationResponse {
    /// Placeholder produced when a request is skipped by a guard.
    /// Never persisted and never correlated to a user.
    pub fn empty(pending_code: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            received_at: Utc::now(),
            transaction_id: Uuid::new_v4().simple().to_string(),
            result: Some(pending_code.to_string()),
            kyc_state: None,
            user_reputation: None,
            fraud_result: None,
            previous_reputation: None,
            response_data: Value::Null,
        }
    }

    /// First present of result, kyc state and fraud result.
    pub fn raw_status(&self) -> Option<&str> {
        self.result
            .as_deref()
            .or(self.kyc_state.as_deref())
            .or(self.fraud_result.as_deref())
    }
}

// ============ Documents ============

/// Accepted identity document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Passport,
    DrivingLicence,
    IdCard,
    ResidencePermit,
    UtilityBill,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Passport => "passport",
            DocType::DrivingLicence => "driving_licence",
            DocType::IdCard => "id_card",
            DocType::ResidencePermit => "residence_permit",
            DocType::UtilityBill => "utility_bill",
        }
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passport" => Ok(DocType::Passport),
            "driving_licence" => Ok(DocType::DrivingLicence),
            "id_card" => Ok(DocType::IdCard),
            "residence_permit" => Ok(DocType::ResidencePermit),
            "utility_bill" => Ok(DocType::UtilityBill),
            other => Err(format!("unknown document type '{}'", other)),
        }
    }
}

/// Metadata of a file uploaded by a user; bytes live in the document store.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content_type: String,
    pub original_filename: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

impl Upload {
    pub fn extension(&self) -> Option<&str> {
        self.original_filename
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
    }

    /// Key under which the bytes are stored.
    pub fn storage_key(&self) -> String {
        match self.extension() {
            Some(ext) => format!("{}/{}.{}", self.user_id, self.id, ext),
            None => format!("{}/{}", self.user_id, self.id),
        }
    }
}

/// Pair of document images submitted for ID verification.
#[derive(Debug, Clone, Serialize)]
pub struct IdUpload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub upload1: Uuid,
    pub upload2: Uuid,
    pub doc_type: DocType,
    pub doc_country: String,
    pub doc_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============ Document provider resources ============

/// Document provider check mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResource {
    pub id: String,
    pub user_id: Option<Uuid>,
    pub status: Option<String>,
    pub name: Option<String>,
    pub result: Option<String>,
    pub sub_result: Option<String>,
    pub reports: Vec<String>,
    pub raw: Value,
}

impl CheckResource {
    /// Builds the mirror from a provider payload. Report entries may be ids or objects.
    pub fn from_value(raw: Value, user_id: Option<Uuid>) -> Option<Self> {
        let id = raw.get("id")?.as_str()?.to_string();
        let reports = raw
            .get("reports")
            .and_then(|r| r.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => {
                            obj.get("id").and_then(|v| v.as_str()).map(str::to_string)
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            id,
            user_id,
            status: string_field(&raw, "status"),
            name: string_field(&raw, "name"),
            result: string_field(&raw, "result"),
            sub_result: string_field(&raw, "sub_result"),
            reports,
            raw,
        })
    }
}

/// Document provider report mirrored locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportResource {
    pub id: String,
    pub user_id: Option<Uuid>,
    pub status: Option<String>,
    pub name: Option<String>,
    pub result: Option<String>,
    pub sub_result: Option<String>,
    pub raw: Value,
}

impl ReportResource {
    pub fn from_value(raw: Value) -> Option<Self> {
        let id = raw.get("id")?.as_str()?.to_string();
        Some(Self {
            id,
            user_id: None,
            status: string_field(&raw, "status"),
            name: string_field(&raw, "name"),
            result: string_field(&raw, "result"),
            sub_result: string_field(&raw, "sub_result"),
            raw,
        })
    }
}

/// Raw document provider callback kept for audit and replay debugging.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEnvelope {
    pub id: Uuid,
    pub resource_type: Option<String>,
    pub action: Option<String>,
    pub object: Value,
    pub payload: Value,
    /// Hex SHA-256 of the serialized payload.
    pub digest: String,
    pub received_at: DateTime<Utc>,
}

fn string_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_strings_round_trip() {
        for state in UserState::all() {
            assert_eq!(state.as_str().parse::<UserState>().unwrap(), state);
        }
        assert_eq!(UserState::all().count(), 15);
        assert!("bogus".parse::<UserState>().is_err());
    }

    #[test]
    fn test_state_serde_matches_as_str() {
        let json = serde_json::to_value(UserState::InfoPendingVerification).unwrap();
        assert_eq!(json, json!("info_pending_verification"));
    }

    #[test]
    fn test_final_states() {
        assert!(UserState::InfoDeclined.is_final());
        assert!(UserState::IdFailed.is_final());
        assert!(!UserState::IdVerified.is_final());
        assert!(UserState::InfoVerified.is_info_stage());
        assert!(!UserState::IdPendingVerification.is_info_stage());
    }

    #[test]
    fn test_check_from_value_accepts_report_objects_and_ids() {
        let raw = json!({
            "id": "chk_1",
            "status": "complete",
            "result": "clear",
            "reports": [{"id": "rep_1"}, "rep_2", 42]
        });
        let check = CheckResource::from_value(raw, None).unwrap();
        assert_eq!(check.reports, vec!["rep_1".to_string(), "rep_2".to_string()]);
        assert_eq!(check.status.as_deref(), Some("complete"));
        assert!(CheckResource::from_value(json!({"status": "complete"}), None).is_none());
    }

    #[test]
    fn test_raw_status_precedence() {
        let mut response = VerificationResponse::empty("MANUAL_REVIEW");
        response.result = None;
        response.kyc_state = Some("A".into());
        response.fraud_result = Some("DENY".into());
        assert_eq!(response.raw_status(), Some("A"));
    }

    #[test]
    fn test_upload_storage_key() {
        let upload = Upload {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            content_type: "image/png".into(),
            original_filename: "scan.PNG".into(),
            size: 10,
            created_at: Utc::now(),
        };
        assert_eq!(upload.extension(), Some("PNG"));
        assert!(upload.storage_key().ends_with(".PNG"));
    }
}
