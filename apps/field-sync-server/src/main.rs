use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use field_sync_server::cli::{self, Cli, Commands};
use field_sync_server::config::{log_filter_from_env, AppConfig};
use field_sync_server::metrics;
use field_sync_server::routes;
use field_sync_server::state::AppState;
use field_sync_server::store;
use field_sync_server::telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Debug {
            url,
            session,
            user,
            command,
        }) => {
            init_tracing(&log_filter_from_env());
            cli::run_debug_client(url, session, user, command).await
        }
        Some(Commands::Serve) | None => {
            let cfg = AppConfig::from_env()?;
            init_tracing(&cfg.log_filter);
            serve(cfg).await
        }
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    let store = store::build_store(&cfg).await?;
    let app_state = AppState::new(store, cfg.lock_ttl_ms);
    let app: Router = routes::router(app_state);

    info!(
        addr = %cfg.bind_addr,
        store_backend = ?cfg.store_backend,
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        database = %cfg.database_url.as_deref().unwrap_or("unset"),
        lock_ttl_ms = cfg.lock_ttl_ms,
        "starting field-sync-server"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    info!("field-sync-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
    }
}
