use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apostol_gateway::config::Config;
use apostol_gateway::dispatch::{build_router, ServerContext};
use apostol_gateway::{auth, db, observability, ws};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apostol_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting gateway");

    let metrics_handle = observability::metrics::init_recorder().map_err(|e| {
        error!("failed to initialize metrics recorder: {e}");
        e
    })?;
    info!("prometheus recorder initialized");

    let config = Config::from_env().map_err(|e| {
        error!("failed to load configuration: {e}");
        e
    })?;

    if !config.enabled {
        warn!("GATEWAY_ENABLED=false, exiting without binding a listener");
        return Ok(());
    }

    info!("connecting to database");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .idle_timeout(config.db_idle_timeout)
        .max_lifetime(config.db_max_lifetime)
        .connect(&config.database_url_with_timeout())
        .await
        .map_err(|e| {
            error!("failed to connect to database: {e}");
            e
        })?;
    info!("database connection established");

    let providers = auth::ProviderKeyStore::new(&config.certs_prefix);
    match providers.reload_all().await {
        Ok(loaded) => {
            observability::metrics::record_provider_reload(loaded);
            info!(loaded, "provider key store loaded");
        }
        Err(e) => warn!("initial provider reload failed: {e}"),
    }

    let bind_address = config.bind_address.clone();
    let drain_seconds = config.drain_seconds;

    let context = Arc::new(ServerContext {
        query_engine: db::QueryEngine::new(pool),
        providers,
        jobs: db::JobRegistry::default(),
        sessions: ws::SessionManager::new(),
        config,
    });

    spawn_provider_reload_heartbeat(Arc::clone(&context));

    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);
    let app = build_router(Arc::clone(&context)).merge(metrics_router);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("invalid bind address: {e}");
        e
    })?;

    info!("gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(drain_seconds))
        .await?;

    info!("gateway shutdown complete");
    Ok(())
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

/// Periodically reload the provider key store on its own cadence,
/// independent of request traffic (§4.3).
fn spawn_provider_reload_heartbeat(context: Arc<ServerContext>) {
    let interval = Duration::from_secs(context.config.provider_reload_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match context.providers.reload_with_lock().await {
                Ok(loaded) => observability::metrics::record_provider_reload(loaded),
                Err(e) => warn!("provider reload failed: {e}"),
            }
        }
    });
}

async fn shutdown_signal(drain_seconds: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT, starting graceful shutdown"),
            Err(e) => error!("failed to listen for SIGINT: {e}"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received SIGTERM, starting graceful shutdown");
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    if drain_seconds > 0 {
        warn!("draining connections for {drain_seconds} seconds");
        tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
        info!("drain period complete");
    } else {
        info!("skipping drain period (DRAIN_SECONDS=0)");
    }
}
