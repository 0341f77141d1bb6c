use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cartpilot_core::{
    create_event_pipeline, load_config, validate_config, AccountApi, AccountStore,
    BatchController, DriverBackends, EventBroadcaster, HttpAccountApi, HttpOrderSite, OrderSite,
    ResultRecorder, RunStore, SqliteAccountStore, SqliteRunStore,
};

use cartpilot_server::api::create_router;
use cartpilot_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long shutdown waits for running tasks to finish after stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("CARTPILOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        "Configuration loaded successfully"
    );
    info!("Database path: {:?}", config.database.path);

    // Create SQLite stores
    let run_store: Arc<dyn RunStore> = Arc::new(
        SqliteRunStore::new(&config.database.path).context("Failed to create run store")?,
    );
    let account_store: Arc<dyn AccountStore> = Arc::new(
        SqliteAccountStore::new(&config.database.path)
            .context("Failed to create account store")?,
    );
    info!("Stores initialized");

    let engine = config.engine.clone();
    let recorder = Arc::new(ResultRecorder::new(
        Arc::clone(&run_store),
        engine.persistence_retries,
        Duration::from_millis(engine.persistence_retry_delay_ms),
    ));

    // Create event pipeline
    let broadcaster = EventBroadcaster::new(engine.subscriber_buffer);
    let (emitter, dispatcher) =
        create_event_pipeline(Arc::clone(&recorder), broadcaster.clone(), engine.event_buffer);
    let dispatcher_handle = tokio::spawn(dispatcher.run());

    // Driver backends
    let mut backends = DriverBackends::new(config.workflow.clone());
    match &config.checkpoint {
        Some(checkpoint) => {
            info!(
                "Initializing account API client at {}",
                checkpoint.account_api_url
            );
            let api = HttpAccountApi::new(checkpoint.clone())
                .context("Failed to create account API client")?;
            backends = backends
                .with_account_api(Arc::new(api) as Arc<dyn AccountApi>)
                .with_checkpoint_delay(checkpoint.inter_account_delay());
        }
        None => info!("No checkpoint section configured, checkpoint batches are disabled"),
    }
    match &config.order {
        Some(order) => {
            info!("Initializing order site client at {}", order.base_url);
            let site = HttpOrderSite::new(order.clone())
                .context("Failed to create order site client")?;
            backends = backends.with_order_site(Arc::new(site) as Arc<dyn OrderSite>);
        }
        None => info!("No order section configured, order batches are disabled"),
    }

    let controller = Arc::new(BatchController::new(
        engine,
        recorder,
        account_store,
        emitter,
        backends,
    ));

    // Create app state
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&controller),
        broadcaster,
        run_store,
    ));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    let stopped = controller.stop_all().await;
    if stopped > 0 {
        info!(stopped, "Waiting for running tasks to finish");
    }
    for handle in controller.registry().running().await {
        let id = handle.id();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle.wait_finished())
            .await
            .is_err()
        {
            warn!(batch_id = %id, "Batch still running at shutdown");
        }
    }

    // The controller owns the last emitter; dropping it lets the dispatcher drain and exit.
    drop(controller);
    if tokio::time::timeout(Duration::from_secs(5), dispatcher_handle)
        .await
        .is_err()
    {
        warn!("Event dispatcher did not drain before shutdown");
    }
    info!("Event dispatcher stopped");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
