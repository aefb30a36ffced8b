use loan_voice_bot::config::Settings;
use loan_voice_bot::db;
use loan_voice_bot::error::AppError;
use loan_voice_bot::handlers;
use loan_voice_bot::nlp::NlpProcessor;
use loan_voice_bot::tasks::Scheduler;
use loan_voice_bot::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("no .env file loaded: {e}");
    }
    let settings = Settings::from_env()?;

    let app_level = if settings.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("sqlx", LevelFilter::WARN),
            ("loan_voice_bot", app_level),
        ]));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Config(format!("failed to install tracing subscriber: {e}")))?;

    settings.validate()?;
    info!(offset=%settings.timezone_offset, "starting loan voice bot");

    let db_pool = db::connect(&settings.database_url, settings.db_pool_size).await?;
    db::migrate(&db_pool).await?;
    if settings.seed_demo_data {
        db::seed_demo_data(&db_pool).await?;
    }

    let system_prompt = NlpProcessor::load_system_prompt(&settings.system_prompt_path);
    let nlp = NlpProcessor::new(
        &settings.anthropic_api_key,
        &settings.anthropic_model,
        system_prompt,
    )?;
    if settings.agent_transfer_number.is_none() {
        warn!("AGENT_TRANSFER_NUMBER not set; transfer requests will end the call");
    }

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .map_err(|e| AppError::Config(format!("bad BIND_ADDR {}: {e}", settings.bind_addr)))?;
    let app_state = Arc::new(AppState {
        settings,
        http_client: reqwest::Client::new(),
        db_pool,
        nlp,
    });

    let scheduler = Scheduler::start(app_state.clone())?;

    let app = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/voice/incoming", post(handlers::voice_incoming))
        .route("/voice/continue", post(handlers::voice_continue))
        .route("/voice/status", post(handlers::voice_status))
        .route("/voice/outbound", post(handlers::voice_outbound))
        .route(
            "/voice/outbound/greeting",
            post(handlers::voice_outbound_greeting),
        )
        .with_state(app_state);

    info!(%addr, "listening");
    let served = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("shutting down");
    scheduler.shutdown();
    served.map_err(|e| AppError::Config(format!("server error: {e}")))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error=%e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
