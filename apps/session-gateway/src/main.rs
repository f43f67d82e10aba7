use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use session_gateway::bridge::BridgeClientFactory;
use session_gateway::config::AppConfig;
use session_gateway::manager::{ManagerOptions, SessionManager};
use session_gateway::metrics;
use session_gateway::routes;
use session_gateway::state::AppState;
use session_gateway::store;
use session_gateway::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env()?;
    init_tracing(&cfg.log_filter);

    let session_store = store::build_store(&cfg).await;
    let factory = Arc::new(BridgeClientFactory::new(
        cfg.bridge_command.clone(),
        cfg.bridge_args.clone(),
    ));
    let manager = SessionManager::new(
        session_store,
        factory,
        ManagerOptions {
            policy: cfg.policy.clone(),
            auth_dir: cfg.auth_dir.clone(),
            engine: cfg.engine.clone(),
            max_media_bytes: cfg.max_media_bytes,
        },
    );
    match manager.start().await {
        Ok(reconciled) => info!(reconciled, "boot reconciliation finished"),
        Err(err) => warn!(error = %err, "boot reconciliation failed"),
    }

    let app: Router = routes::router(AppState::new(manager.clone()));
    let database = if cfg.database_url.is_some() { "set" } else { "unset" };

    info!(
        addr = %cfg.bind_addr,
        store_backend = ?cfg.store_backend,
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        database,
        bridge = %cfg.bridge_command,
        auth_dir = %cfg.auth_dir.display(),
        maintenance_secs = cfg.policy.maintenance_interval.as_secs(),
        restart_on_maintenance = cfg.policy.restart_on_maintenance,
        "starting session-gateway"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("http server stopped; closing sessions");
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
