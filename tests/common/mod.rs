//! Shared fixtures for integration tests: stub providers and a fully wired
//! service on top of the in-memory store.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

use rust_whitelist_api::analytics_client::{AnalyticsCommand, AnalyticsQueue};
use rust_whitelist_api::config::VerificationPolicy;
use rust_whitelist_api::documents::MemoryDocumentStore;
use rust_whitelist_api::events::EventDispatcher;
use rust_whitelist_api::idm_client::{IdmTransport, ProviderError};
use rust_whitelist_api::ledger::VerificationLedger;
use rust_whitelist_api::models::User;
use rust_whitelist_api::observers::register_default_observers;
use rust_whitelist_api::onfido_client::OnfidoApi;
use rust_whitelist_api::reconciler::WebhookReconciler;
use rust_whitelist_api::service::WhitelistService;
use rust_whitelist_api::state_machine::StateMachine;
use rust_whitelist_api::store::MemoryStore;
use rust_whitelist_api::validation::InfoSubmission;
use rust_whitelist_api::verification::VerificationOrchestrator;

/// Planned provider reply. `Fields` is echoed back with the request's `tid`
/// as `mtid`.
#[derive(Clone)]
pub enum Reply {
    Fields(Value),
    Fail(ProviderError),
}

/// Identity provider stand-in recording every submitted body.
pub struct StubTransport {
    enabled: bool,
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Value>>,
}

impl StubTransport {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            enabled: true,
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl IdmTransport for StubTransport {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn submit(&self, body: &Value) -> Result<Value, ProviderError> {
        self.calls.lock().push(body.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Reply::Fields(json!({"res": "ACCEPT"})));
        match reply {
            Reply::Fields(mut fields) => {
                fields["mtid"] = body["tid"].clone();
                Ok(fields)
            }
            Reply::Fail(e) => Err(e),
        }
    }
}

/// Document provider stand-in serving resources by href.
#[derive(Default)]
pub struct StubOnfido {
    resources: Mutex<HashMap<String, Value>>,
    fetches: Mutex<usize>,
}

impl StubOnfido {
    pub fn serve(&self, href: &str, resource: Value) {
        self.resources.lock().insert(href.to_string(), resource);
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock()
    }
}

#[async_trait]
impl OnfidoApi for StubOnfido {
    async fn fetch(&self, href: &str) -> Result<Value, ProviderError> {
        *self.fetches.lock() += 1;
        self.resources
            .lock()
            .get(href)
            .cloned()
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                body: format!("no resource at {}", href),
            })
    }

    async fn create_applicant(&self, _user: &User) -> Result<Value, ProviderError> {
        Ok(json!({"id": "applicant-1"}))
    }

    async fn create_check(&self, applicant_id: &str) -> Result<Value, ProviderError> {
        Ok(json!({
            "id": format!("check-{}", applicant_id),
            "status": "in_progress",
            "reports": []
        }))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub machine: Arc<StateMachine>,
    pub transport: Arc<StubTransport>,
    pub documents: Arc<MemoryDocumentStore>,
    pub onfido: Arc<StubOnfido>,
    pub service: Arc<WhitelistService>,
    pub reconciler: Arc<WebhookReconciler>,
    pub analytics: mpsc::UnboundedReceiver<AnalyticsCommand>,
}

impl Harness {
    pub fn new(transport: StubTransport) -> Self {
        Self::with_policy(transport, VerificationPolicy::default())
    }

    pub fn with_policy(transport: StubTransport, policy: VerificationPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (queue, analytics) = AnalyticsQueue::channel();
        let mut events = EventDispatcher::new();
        register_default_observers(&mut events, policy.banned_countries.clone(), queue);
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            events,
            policy.max_transition_depth,
        ));

        let transport = Arc::new(transport);
        let documents = Arc::new(MemoryDocumentStore::new());
        let ledger = Arc::new(VerificationLedger::new(machine.clone()));
        let orchestrator = Arc::new(VerificationOrchestrator::new(
            machine.clone(),
            ledger,
            transport.clone(),
            documents.clone(),
            policy.clone(),
        ));
        let service = Arc::new(WhitelistService::new(
            machine.clone(),
            orchestrator,
            documents.clone(),
            policy,
        ));
        let onfido = Arc::new(StubOnfido::default());
        let reconciler = Arc::new(WebhookReconciler::new(machine.clone(), onfido.clone()));

        Self {
            store,
            machine,
            transport,
            documents,
            onfido,
            service,
            reconciler,
            analytics,
        }
    }

    /// Every analytics command enqueued so far.
    pub fn drain_analytics(&mut self) -> Vec<AnalyticsCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.analytics.try_recv() {
            commands.push(command);
        }
        commands
    }
}

/// A valid signup body; `country` lands in `country_code`.
pub fn submission(country: &str) -> InfoSubmission {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    serde_json::from_value(json!({
        "first_name": "Marge",
        "last_name": "Simpson",
        "email": format!("marge.{}@example.com", &unique[..8]),
        "dob": 631152000,
        "address": "742 Evergreen Terrace",
        "city": "Sydney",
        "zip_code": "2000",
        "country_code": country,
        "phone": "0412 345 678",
        "eth_address": format!("0x{}", &(unique.clone() + &unique)[..40]),
        "confirmed_location": true,
        "dfp": "fingerprint-0123456789"
    }))
    .expect("valid submission fixture")
}
