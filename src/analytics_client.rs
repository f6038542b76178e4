//! Customer profile and event tracking (customer.io).
//!
//! Observers only enqueue; a single background task owns the HTTP client and
//! drains the queue, so a slow analytics API never stalls a transition.

use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::User;

pub const EVENT_TRANSITION: &str = "transition";
pub const EVENT_CHECK_UPDATE: &str = "onfido_check_update";
pub const EVENT_IDM_RESPONSE: &str = "idm-response";

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsCommand {
    /// Creates or updates the customer profile.
    Identify { customer_id: String, attributes: Value },
    Event {
        customer_id: String,
        name: String,
        data: Value,
    },
}

impl AnalyticsCommand {
    pub fn customer_id(&self) -> &str {
        match self {
            AnalyticsCommand::Identify { customer_id, .. } => customer_id,
            AnalyticsCommand::Event { customer_id, .. } => customer_id,
        }
    }
}

/// Profile attributes sent on every identify.
pub fn profile_attributes(user: &User) -> Value {
    json!({
        "email": user.email,
        "telegram": user.telegram,
        "first_name": user.first_name,
        "last_name": user.last_name,
        "created_at": user.created_at.timestamp(),
        "dob": user.dob.map(|d| d.timestamp()),
        "country_code": user.country_code,
        "eth_address": user.eth_address,
        "state": user.state.as_str(),
        "decline_reason": user.decline_reason.map(|r| r.as_str()),
        "ip": user.ip,
        "idm_tid": user.idm_tid,
        "onfido_status": user.onfido_status,
    })
}

/// Sending half handed to observers.
#[derive(Clone)]
pub struct AnalyticsQueue {
    tx: mpsc::UnboundedSender<AnalyticsCommand>,
}

impl AnalyticsQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AnalyticsCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, command: AnalyticsCommand) -> anyhow::Result<()> {
        self.tx
            .send(command)
            .map_err(|e| anyhow::anyhow!("analytics queue closed, dropped {:?}", e.0))
    }

    pub fn identify(&self, user: &User) -> anyhow::Result<()> {
        self.enqueue(AnalyticsCommand::Identify {
            customer_id: user.id.to_string(),
            attributes: profile_attributes(user),
        })
    }

    pub fn event(&self, user_id: Uuid, name: &str, data: Value) -> anyhow::Result<()> {
        self.enqueue(AnalyticsCommand::Event {
            customer_id: user_id.to_string(),
            name: name.to_string(),
            data,
        })
    }
}

#[derive(Clone)]
pub struct CustomerIoClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl CustomerIoClient {
    pub fn new(
        base_url: String,
        site_id: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::ExternalApiError(format!("Failed to create analytics client: {}", e)))?;

        let credentials = match (site_id, api_key) {
            (Some(site), Some(key)) => Some((site, key)),
            _ => None,
        };
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn send(&self, command: &AnalyticsCommand) -> Result<(), AppError> {
        let Some((site_id, api_key)) = &self.credentials else {
            return Ok(());
        };

        let request = match command {
            AnalyticsCommand::Identify {
                customer_id,
                attributes,
            } => self
                .client
                .put(format!("{}/{}", self.base_url, customer_id))
                .json(attributes),
            AnalyticsCommand::Event {
                customer_id,
                name,
                data,
            } => self
                .client
                .post(format!("{}/{}/events", self.base_url, customer_id))
                .json(&json!({ "name": name, "data": data })),
        };

        let response = request.basic_auth(site_id, Some(api_key)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Analytics returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Drains the queue until every sender is dropped.
pub fn spawn_worker(
    client: CustomerIoClient,
    mut rx: mpsc::UnboundedReceiver<AnalyticsCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !client.is_enabled() {
            tracing::info!("Analytics credentials not set; events will be discarded");
        }
        while let Some(command) = rx.recv().await {
            if !client.is_enabled() {
                continue;
            }
            if let Err(e) = client.send(&command).await {
                tracing::error!(
                    "Analytics delivery failed for customer {}: {}",
                    command.customer_id(),
                    e
                );
            }
        }
        tracing::debug!("Analytics queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_delivers_in_order() {
        let (queue, mut rx) = AnalyticsQueue::channel();
        let id = Uuid::new_v4();
        queue.event(id, EVENT_TRANSITION, json!({"state_now": "info_verified"})).unwrap();
        queue.event(id, EVENT_CHECK_UPDATE, json!({})).unwrap();

        match rx.recv().await.unwrap() {
            AnalyticsCommand::Event { name, data, .. } => {
                assert_eq!(name, EVENT_TRANSITION);
                assert_eq!(data["state_now"], "info_verified");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap().customer_id(), id.to_string());
    }

    #[tokio::test]
    async fn test_enqueue_after_close_errors() {
        let (queue, rx) = AnalyticsQueue::channel();
        drop(rx);
        assert!(queue.event(Uuid::new_v4(), EVENT_TRANSITION, json!({})).is_err());
    }

    #[test]
    fn test_disabled_without_both_credentials() {
        let client =
            CustomerIoClient::new("http://localhost".into(), Some("site".into()), None).unwrap();
        assert!(!client.is_enabled());
    }
}
