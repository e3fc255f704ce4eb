//! Cadence Server
//!
//! Run with: `cargo run` or `cadence`
//!
//! Configuration via environment variables:
//! - CADENCE_DATABASE__TYPE: postgres or sqlite
//! - CADENCE_DATABASE__URL: connection string (postgres)
//! - CADENCE_DATABASE__PATH: file path (sqlite)
//! - CADENCE_SERVER__PORT: port to listen on (default: 8080)
//! - CADENCE_SCHEDULER__POLL_INTERVAL_SECS: self-poll interval (default: 60)
//! - CADENCE_SCHEDULER__MACHINE_NAME: node identity (default: hostname)

use std::sync::Arc;

use cadence::{
    api::{self, AppState},
    clock::{Clock, SystemClock},
    config::{Config, DatabaseConfig},
    scheduler::{SelfPoller, TaskScheduler},
    tasks::{HistoryCleanupTask, HISTORY_CLEANUP_TYPE},
    TaskRegistry, TaskStore, TaskStoreExt,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cadence server...");

    // Load config from environment or use defaults
    let config = Config::from_env().unwrap_or_else(|_| {
        tracing::warn!("No config found, using SQLite in-memory database");
        Config {
            server: Default::default(),
            database: DatabaseConfig::in_memory(),
            scheduler: Default::default(),
        }
    });

    match &config.database {
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres {
            url,
            max_connections,
        } => {
            use cadence::PostgresStore;

            tracing::info!("Connecting to PostgreSQL...");
            let store = PostgresStore::connect_with_options(url, *max_connections).await?;
            store.migrate().await?;
            tracing::info!("Database migrated");

            run_server(config, store).await
        }

        #[cfg(feature = "sqlite")]
        DatabaseConfig::Sqlite { path } => {
            use cadence::SqliteStore;

            tracing::info!("Connecting to SQLite at {}...", path);
            let url = if path == ":memory:" {
                "sqlite::memory:".to_string()
            } else {
                format!("sqlite://{}?mode=rwc", path)
            };
            let store = SqliteStore::connect(&url).await?;
            store.migrate().await?;
            tracing::info!("Database migrated");

            run_server(config, store).await
        }

        #[allow(unreachable_patterns)]
        _ => {
            anyhow::bail!("No database backend enabled. Compile with --features postgres or --features sqlite");
        }
    }
}

async fn run_server<S: TaskStore + Clone>(config: Config, store: S) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = Arc::new(TaskRegistry::new());
    registry.register(
        HISTORY_CLEANUP_TYPE,
        HistoryCleanupTask::from_config(store.clone(), clock.clone(), &config.scheduler),
    );

    let cleanup = HistoryCleanupTask::<S>::descriptor(config.scheduler.history_cleanup_cron.clone());
    if let Err(e) = store.get_or_add_task(cleanup, clock.now()).await {
        tracing::warn!(error = %e, "Failed to install history cleanup task");
    }

    let scheduler = TaskScheduler::with_clock(
        store,
        registry,
        config.scheduler.clone(),
        clock,
    );
    let shutdown = CancellationToken::new();

    // Initialization may retry for minutes; serve meanwhile so the trigger
    // endpoint answers 503 instead of refusing connections.
    let base_url = config.scheduler.base_url_for(&config.server);
    let init = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        let self_poll = config.scheduler.self_poll;
        let interval = config.scheduler.poll_interval();
        tokio::spawn(async move {
            if scheduler.initialize().await.is_err() {
                tracing::error!("Running without background tasks");
                return;
            }
            if self_poll {
                SelfPoller::new(&base_url, interval).run(shutdown).await;
            }
        })
    };

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
    });
    let app = api::router(state);

    let addr = config.server.address();
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    init.abort();
    scheduler.shutdown().await;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
