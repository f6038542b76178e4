//! Starts a document-provider check for each user id given on the command line.
//!
//! Usage: `start_check <user-uuid> [<user-uuid> ...]`

use dotenvy::dotenv;
use std::sync::Arc;
use uuid::Uuid;

use rust_whitelist_api::analytics_client::{spawn_worker, AnalyticsQueue, CustomerIoClient};
use rust_whitelist_api::config::Config;
use rust_whitelist_api::db::Database;
use rust_whitelist_api::db_storage::PgStore;
use rust_whitelist_api::events::EventDispatcher;
use rust_whitelist_api::observers::register_default_observers;
use rust_whitelist_api::onfido_client::OnfidoClient;
use rust_whitelist_api::reconciler::WebhookReconciler;
use rust_whitelist_api::state_machine::StateMachine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_whitelist_api=info".into()),
        )
        .init();

    let user_ids = std::env::args()
        .skip(1)
        .map(|arg| Uuid::parse_str(&arg).map_err(|e| anyhow::anyhow!("{}: {}", arg, e)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if user_ids.is_empty() {
        anyhow::bail!("usage: start_check <user-uuid> [<user-uuid> ...]");
    }

    let config = Config::from_env()?;
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let db = Database::new(&database_url).await?;

    let (analytics, analytics_rx) = AnalyticsQueue::channel();
    let worker = spawn_worker(
        CustomerIoClient::new(
            config.customer_io_url.clone(),
            config.customer_io_site_id.clone(),
            config.customer_io_api_key.clone(),
        )?,
        analytics_rx,
    );

    let mut events = EventDispatcher::new();
    register_default_observers(&mut events, config.policy.banned_countries.clone(), analytics);
    let machine = Arc::new(StateMachine::new(
        Arc::new(PgStore::new(db.pool)),
        events,
        config.policy.max_transition_depth,
    ));
    let onfido = OnfidoClient::new(&config.onfido_base_url, config.onfido_token.clone())?;
    let reconciler = WebhookReconciler::new(machine, Arc::new(onfido));

    let mut failures = 0;
    for user_id in user_ids {
        match reconciler.start_check(user_id).await {
            Ok(check) => println!(
                "{}: check {} ({})",
                user_id,
                check.id,
                check.status.as_deref().unwrap_or("unknown")
            ),
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", user_id, e);
            }
        }
    }

    // Closing the queue lets the worker flush and exit.
    drop(reconciler);
    worker.await?;

    if failures > 0 {
        anyhow::bail!("{} check(s) failed to start", failures);
    }
    Ok(())
}
