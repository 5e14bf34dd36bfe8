use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ehs_data_protection::artifact;
use ehs_data_protection::catalog::Catalog;
use ehs_data_protection::db::{create_store_pool, init_store_schema, store_options};
use ehs_data_protection::restore::{check_and_restore, RecoveryContext, RecoveryOutcome};
use ehs_data_protection::scheduler::BackupScheduler;
use ehs_data_protection::{create_router, AppState, Config, DataProtection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ehs_data_protection=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting EHS data protection service...");

    // Load configuration
    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        "Environment: {}, Server: {}",
        config.environment,
        config.server_address()
    );

    // Backup tree and catalog come first: recovery needs them
    artifact::ensure_layout(&config.backup_root)?;
    let removed = artifact::cleanup_partials(&config.backup_root)?;
    if removed > 0 {
        tracing::warn!("Removed {} unfinished artifact(s) from a previous run", removed);
    }
    let catalog = Catalog::open(&config.backup_root).await?;

    // Startup integrity check, before anything opens the store
    let recovery = check_and_restore(&RecoveryContext {
        database_path: &config.database_path,
        backup_root: &config.backup_root,
        core_export_dir: &config.core_export_dir,
        catalog: &catalog,
    })
    .await;
    match &recovery {
        RecoveryOutcome::Healthy | RecoveryOutcome::Fresh | RecoveryOutcome::Restored { .. } => {
            tracing::info!("Startup recovery check: {:?}", recovery)
        }
        RecoveryOutcome::Degraded { .. } | RecoveryOutcome::Failed { .. } => {
            tracing::error!("Running on a DEGRADED store: {:?}", recovery)
        }
    }

    // Open the store
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = create_store_pool(store_options(&config.database_path));
    init_store_schema(&store).await?;

    let protection = Arc::new(DataProtection::new(
        &config,
        store,
        catalog,
        recovery,
    ));

    if config.scheduler_enabled {
        BackupScheduler::new(protection.clone(), &config).spawn();
    } else {
        tracing::warn!("Backup scheduler disabled");
    }

    // Configure CORS
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(origin) => Some(origin),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", s);
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    // Build router
    let state = AppState::new(protection, config.clone());
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
