use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_whitelist_api::analytics_client::{spawn_worker, AnalyticsQueue, CustomerIoClient};
use rust_whitelist_api::config::Config;
use rust_whitelist_api::db::Database;
use rust_whitelist_api::db_storage::PgStore;
use rust_whitelist_api::documents::{LocalDocumentStore, MAX_DOCUMENT_SIZE};
use rust_whitelist_api::events::EventDispatcher;
use rust_whitelist_api::handlers::{self, AppState};
use rust_whitelist_api::idm_client::IdmHttpClient;
use rust_whitelist_api::ledger::VerificationLedger;
use rust_whitelist_api::observers::register_default_observers;
use rust_whitelist_api::onfido_client::OnfidoClient;
use rust_whitelist_api::reconciler::WebhookReconciler;
use rust_whitelist_api::service::WhitelistService;
use rust_whitelist_api::state_machine::StateMachine;
use rust_whitelist_api::store::{MemoryStore, Store};
use rust_whitelist_api::tokens::TokenSigner;
use rust_whitelist_api::verification::VerificationOrchestrator;

/// Main entry point for the application.
///
/// Wires the store, event observers, provider clients and the analytics
/// worker, then serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_whitelist_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let store: Arc<dyn Store> = match config.database_url {
        Some(ref url) => {
            let db = Database::new(url).await?;
            tracing::info!("Database connection pool established");
            Arc::new(PgStore::new(db.pool))
        }
        None => {
            tracing::warn!("No database configured, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    // Analytics delivery runs off the request path
    let (analytics, analytics_rx) = AnalyticsQueue::channel();
    let customer_io = CustomerIoClient::new(
        config.customer_io_url.clone(),
        config.customer_io_site_id.clone(),
        config.customer_io_api_key.clone(),
    )?;
    let _analytics_worker = spawn_worker(customer_io, analytics_rx);

    let mut events = EventDispatcher::new();
    register_default_observers(&mut events, config.policy.banned_countries.clone(), analytics);
    let machine = Arc::new(StateMachine::new(
        store,
        events,
        config.policy.max_transition_depth,
    ));

    let idm = IdmHttpClient::new(
        config.idm_url.clone(),
        config.idm_username.clone(),
        config.idm_password.clone(),
    )?;
    let documents = Arc::new(LocalDocumentStore::new(config.documents_dir.clone()));
    let ledger = Arc::new(VerificationLedger::new(machine.clone()));
    let orchestrator = Arc::new(VerificationOrchestrator::new(
        machine.clone(),
        ledger,
        Arc::new(idm),
        documents.clone(),
        config.policy.clone(),
    ));
    let service = Arc::new(WhitelistService::new(
        machine.clone(),
        orchestrator,
        documents,
        config.policy.clone(),
    ));

    let onfido = OnfidoClient::new(&config.onfido_base_url, config.onfido_token.clone())?;
    let reconciler = Arc::new(WebhookReconciler::new(machine, Arc::new(onfido)));
    tracing::info!("Verification pipeline initialized");

    let app_state = Arc::new(AppState {
        tokens: TokenSigner::new(config.token_secret.clone()),
        config: config.clone(),
        service,
        reconciler,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    // Two document images plus JSON overhead
    let body_limit = 2 * MAX_DOCUMENT_SIZE as usize + 1024 * 1024;
    let protected_routes = handlers::api_routes().layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(body_limit))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
