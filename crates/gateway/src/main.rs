use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tempo_domain::config::{Config, ConfigSeverity};
use tempo_gateway::{api, bootstrap};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tempo_gateway=info,tempo_kernel=info,tower_http=info")),
        )
        .json()
        .init();

    tracing::info!("TempoOS gateway starting");

    // ── Config ─────────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = Arc::new(Config::load_or_default(&config_path));

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── State + background services ────────────────────────────────
    let state = bootstrap::build_app_state(config.clone()).await?;
    let _clock = bootstrap::start_background(&state);

    // ── HTTP ───────────────────────────────────────────────────────
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
