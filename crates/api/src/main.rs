//! API server entry point.

use std::error::Error;

use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaRepository};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Products stocked in the in-memory inventory at startup.
const DEMO_STOCK: &[(&str, u32)] = &[("1", 100), ("2", 50), ("7", 10)];

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<R: SagaRepository + 'static>(
    config: Config,
    repo: R,
    metrics_handle: PrometheusHandle,
) -> Result<(), Box<dyn Error>> {
    let (state, services) = api::create_default_state(repo, config.saga.clone());
    for (product_id, quantity) in DEMO_STOCK {
        services.inventory.set_stock(*product_id, *quantity);
    }

    let sweeper = state.engine.sweeper().clone().spawn();
    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.stop().await;
    served?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    api::routes::metrics::describe();

    // 3. Pick the saga store and run the server
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
            let store = PostgresSagaStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL saga store");
            serve(config, store, metrics_handle).await?;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory saga store");
            serve(config, InMemorySagaStore::new(), metrics_handle).await?;
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
