use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::User;

/// Device fingerprint type sent with every request.
pub const DEFAULT_FINGERPRINT_TYPE: &str = "AU";

/// Failure talking to a verification provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network failure or timeout before any response.
    #[error("provider unreachable: {0}")]
    Transport(String),

    /// Provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Provider answered 200 with a body we cannot read.
    #[error("invalid provider response: {0}")]
    InvalidBody(String),
}

impl ProviderError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Text recorded on the user when the failure ends a stage.
    pub fn detail(&self) -> String {
        match self {
            ProviderError::Status { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Document fields only present on stage 2 requests.
#[derive(Debug, Clone, Default)]
pub struct IdDocuments {
    /// `<content-type>;base64,<data>` of the front image.
    pub image1: Option<String>,
    pub image2: Option<String>,
    pub doc_country: Option<String>,
    pub doc_state: Option<String>,
    pub doc_type: Option<String>,
}

/// Builds the provider body. `tid` and `stage` are filled in by the ledger.
pub fn build_request_body(user: &User, documents: Option<&IdDocuments>, ip: Option<&str>) -> Value {
    let empty = IdDocuments::default();
    let docs = documents.unwrap_or(&empty);

    json!({
        "dob": user.dob.map(|d| d.date_naive().to_string()),
        "scanData": docs.image1,
        "backsideImageData": docs.image2,
        "stage": 1,
        "bfn": user.first_name,
        "bln": user.last_name,
        "tid": user.idm_tid,
        "man": user.id.to_string(),
        "tea": user.email,
        "ip": ip.map(str::to_string).or_else(|| user.ip.clone()),
        "dfp": user.dfp,
        "dft": DEFAULT_FINGERPRINT_TYPE,
        "bsn": user.address,
        "bco": user.country_code,
        "bz": user.zip_code,
        "bc": user.city,
        "bs": user.state_code,
        "tti": Utc::now().timestamp(),
        "accountCreationTime": user.created_at.timestamp(),
        "phn": user.phone,
        "memo1": user.eth_address,
        "memo2": user.eth_amount.as_ref().map(|a| a.to_string()),
        "docCountry": docs.doc_country,
        "docState": docs.doc_state,
        "docType": docs.doc_type,
    })
}

/// Outbound channel to the identity provider.
#[async_trait]
pub trait IdmTransport: Send + Sync {
    /// False when no credentials are configured; requests are then skipped.
    fn is_enabled(&self) -> bool;

    /// Posts one request body and returns the provider's JSON reply.
    async fn submit(&self, body: &Value) -> Result<Value, ProviderError>;
}

/// Identity provider client over HTTPS with basic auth.
#[derive(Clone)]
pub struct IdmHttpClient {
    client: reqwest::Client,
    url: String,
    credentials: Option<(String, String)>,
}

impl IdmHttpClient {
    pub fn new(
        url: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, crate::errors::AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                crate::errors::AppError::ExternalApiError(format!(
                    "Failed to create identity provider client: {}",
                    e
                ))
            })?;

        let credentials = username.map(|u| (u, password.unwrap_or_default()));
        Ok(Self {
            client,
            url,
            credentials,
        })
    }
}

#[async_trait]
impl IdmTransport for IdmHttpClient {
    fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    async fn submit(&self, body: &Value) -> Result<Value, ProviderError> {
        let Some((username, password)) = &self.credentials else {
            return Err(ProviderError::Transport(
                "identity provider credentials not configured".to_string(),
            ));
        };

        tracing::debug!("POST {} (tid {:?})", self.url, body.get("tid"));
        let response = self
            .client
            .post(&self.url)
            .basic_auth(username, Some(password))
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Identity provider returned {}: {}", status, text);
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::InvalidBody(e.to_string()))
    }
}
