//! Concord Relay - store-and-forward server for encrypted sync envelopes.

use concord_relay::store::{create_pool, run_migrations};
use concord_relay::{AppState, Config, EnvelopeStore, MemoryEnvelopeStore, PgEnvelopeStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concord_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Concord Relay on {}:{}", config.host, config.port);
    if config.auth_secret.is_none() {
        tracing::warn!("AUTH_SECRET not set, accepting unauthenticated replicas");
    }

    let store: Arc<dyn EnvelopeStore> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            tracing::info!("Running database migrations...");
            run_migrations(&pool).await?;
            Arc::new(PgEnvelopeStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, envelopes are kept in memory only");
            Arc::new(MemoryEnvelopeStore::new())
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, store);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Relay listening on {}", addr);

    concord_relay::serve(listener, state).await?;

    Ok(())
}
