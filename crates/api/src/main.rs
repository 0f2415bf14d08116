//! Lexfam API server

use std::sync::Arc;

use anyhow::Context;
use lexfam_api::{create_router, AppState, Config, HttpAnswerEngine};
use lexfam_billing::BillingService;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(config.log_json);

    let pool = lexfam_shared::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;

    if config.run_migrations {
        lexfam_shared::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        tracing::info!("Database migrations applied");
    }

    let billing = BillingService::from_env(pool).context("failed to configure billing")?;
    let answer_engine = HttpAnswerEngine::new(&config.answer_engine_url, config.answer_engine_timeout)
        .context("failed to build answer engine client")?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, billing, Arc::new(answer_engine));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %bind_address, "Lexfam API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lexfam_api=debug,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
