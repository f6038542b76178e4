use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use crate::errors::AppError;
use crate::idm_client::ProviderError;
use crate::models::User;

/// Longest street line the provider accepts.
const MAX_STREET_LEN: usize = 32;

/// Document/watchlist provider operations used by the reconciler.
#[async_trait]
pub trait OnfidoApi: Send + Sync {
    /// Dereferences a resource link from a webhook.
    async fn fetch(&self, href: &str) -> Result<Value, ProviderError>;

    async fn create_applicant(&self, user: &User) -> Result<Value, ProviderError>;

    /// Starts an express check (full watchlist + document report).
    async fn create_check(&self, applicant_id: &str) -> Result<Value, ProviderError>;
}

pub fn applicant_body(user: &User) -> Value {
    let street: String = user.address.chars().take(MAX_STREET_LEN).collect();
    json!({
        "first_name": user.first_name,
        "last_name": user.last_name,
        "email": user.email,
        "dob": user.dob.map(|d| d.date_naive().to_string()),
        "telephone": user.phone,
        "country": user.country_code,
        "addresses": [{
            "street": street,
            "town": user.city,
            "state": user.state_code,
            "postcode": user.zip_code,
            "country": user.country_code,
        }],
    })
}

pub fn express_check_body() -> Value {
    json!({
        "type": "express",
        "reports": [
            {"name": "watchlist", "variant": "full"},
            {"name": "document"},
        ],
        "async": true,
    })
}

#[derive(Clone)]
pub struct OnfidoClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl OnfidoClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create document provider client: {}", e))
            })?;
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::BadRequest(format!("Invalid document provider URL: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Absolute links are used as is, paths are joined onto the base URL.
    pub fn resolve(&self, href: &str) -> Result<Url, ProviderError> {
        match Url::parse(href) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
            _ => self
                .base_url
                .join(href)
                .map_err(|e| ProviderError::InvalidBody(format!("bad href {}: {}", href, e))),
        }
    }

    fn authorization(&self) -> Result<String, ProviderError> {
        self.token
            .as_ref()
            .map(|token| format!("Token token={}", token))
            .ok_or_else(|| {
                ProviderError::Transport("document provider token not configured".to_string())
            })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = request
            .header("Authorization", self.authorization()?)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Document provider returned {}: {}", status, body);
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::InvalidBody(e.to_string()))
    }
}

#[async_trait]
impl OnfidoApi for OnfidoClient {
    async fn fetch(&self, href: &str) -> Result<Value, ProviderError> {
        let url = self.resolve(href)?;
        tracing::debug!("GET {}", url);
        self.send(self.client.get(url)).await
    }

    async fn create_applicant(&self, user: &User) -> Result<Value, ProviderError> {
        let url = self.resolve("/v2/applicants")?;
        let created = self.send(self.client.post(url).json(&applicant_body(user))).await?;
        tracing::info!(
            "Document provider applicant for user {} is {:?}",
            user.id,
            created.get("id")
        );
        Ok(created)
    }

    async fn create_check(&self, applicant_id: &str) -> Result<Value, ProviderError> {
        let url = self.resolve(&format!("/v2/applicants/{}/checks", applicant_id))?;
        let check = self
            .send(self.client.post(url).json(&express_check_body()))
            .await?;
        tracing::info!("Created check {:?} for applicant {}", check.get("id"), applicant_id);
        Ok(check)
    }
}
