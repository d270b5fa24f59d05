use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use turnstile_core::{ConfigResolver, FrontendAdapter, InProcessDistributedCache, StaticConfig};
use turnstile_orchestrator::ChatOrchestrator;
use turnstile_pipeline::ChannelRegistry;
use turnstile_sessions::{CharacterLoader, SessionService};
use turnstile_store::SqliteStore;
use turnstile_telegram::TelegramAdapter;
use turnstile_upstream::UpstreamClient;

mod app;
mod error;
mod http;

use error::GatewayError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile_gateway=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("TURNSTILE_CONFIG").ok();
    let config = StaticConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        StaticConfig::default()
    });

    let (state, telegram) = build(config.clone())?;
    let router = app::build_router(state);

    if let Some(telegram) = telegram {
        tokio::spawn(async move {
            if let Err(e) = telegram.run().await {
                warn!(error = %e, "Telegram adapter exited");
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("Turnstile gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Wire every port to its SQLite-backed implementation, build the pipeline
/// and orchestrator, and optionally build the Telegram frontend.
fn build(config: StaticConfig) -> Result<(Arc<app::AppState>, Option<TelegramAdapter>), GatewayError> {
    std::fs::create_dir_all(
        std::path::Path::new(&config.database.path)
            .parent()
            .unwrap_or_else(|| std::path::Path::new(".")),
    )
    .ok();
    let conn = rusqlite::Connection::open(&config.database.path)?;
    turnstile_store::init_db(&conn)?;
    let store = Arc::new(SqliteStore::new(conn));

    let distributed = Arc::new(InProcessDistributedCache::new());
    let config_resolver = Arc::new(ConfigResolver::new(distributed, store.clone()));

    let characters_dir = std::env::var("TURNSTILE_CHARACTERS_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("characters"));
    let characters = CharacterLoader::new(store.clone(), characters_dir, config.default_role_id.clone());

    let sessions = Arc::new(SessionService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        config_resolver.clone(),
        characters,
        config.default_role_id.clone(),
    ));

    let upstream_client = Arc::new(UpstreamClient::new());
    let registry = Arc::new(ChannelRegistry::new(
        config_resolver.clone(),
        upstream_client,
        config.ai_config_source.clone(),
    ));

    let orchestrator = Arc::new(ChatOrchestrator::new(sessions.clone(), registry, config_resolver));
    let state = Arc::new(app::AppState::new(orchestrator.clone()));

    let telegram = config.telegram.clone().map(|telegram_config| {
        info!("Telegram frontend configured, will start long-polling on launch");
        TelegramAdapter::new(telegram_config, orchestrator, sessions)
    });

    Ok((state, telegram))
}
