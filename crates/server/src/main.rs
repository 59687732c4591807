//! Saga server entry point.

use std::sync::Arc;

use messaging::{CommandPublisher, InMemoryBroker};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::Orchestrator;
use saga_server::{AppState, Config, HealthInfo, Participants, StoreBackend, Workers};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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

#[tokio::main]
async fn main() {
    // 1. Load and validate configuration before anything starts
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // 2. Initialize tracing at the configured level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_filter()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!(
        region = %config.region,
        group = %config.orchestrator_group,
        log_level = %config.log_level,
        brokers = ?config.brokers,
        max_request_retries = config.max_request_retries,
        "configuration loaded"
    );

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    saga_server::routes::metrics::describe();

    // 4. Open the saga store and run
    match config.store.clone() {
        StoreBackend::Postgres { url } => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresSagaStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga store");
            run(config, Arc::new(store), metrics_handle).await;
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory saga store, state is lost on exit");
            run(config, Arc::new(InMemorySagaStore::new()), metrics_handle).await;
        }
    }
}

async fn run<S: SagaStore + 'static>(
    config: Config,
    store: Arc<S>,
    metrics_handle: PrometheusHandle,
) {
    // 5. Broker, publisher and orchestrator
    let broker = Arc::new(InMemoryBroker::new(config.broker_partitions));
    let publisher = CommandPublisher::new(broker, config.publish_policy());
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        publisher.clone(),
        config.topics.clone(),
    ));
    if let Err(reason) = orchestrator.workflow().validate() {
        tracing::error!(%reason, "invalid workflow table");
        std::process::exit(1);
    }

    // 6. Background workers
    let workers = Workers::spawn(
        orchestrator.clone(),
        publisher,
        Participants::default(),
        &config,
    );

    // 7. Serve HTTP until a shutdown signal arrives
    let app = saga_server::create_app(
        Arc::new(AppState { orchestrator }),
        HealthInfo::new(config.region.clone()),
        metrics_handle,
    );

    let addr = config.addr();
    tracing::info!(%addr, "starting saga server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 8. Let consumers commit what they processed, then exit
    workers.shutdown().await;
    tracing::info!("server shut down gracefully");
}
