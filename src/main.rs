//! grillmaster server entry point

use anyhow::Result;
use grillmaster::api::{build_router, AppState};
use grillmaster::config::Config;
use grillmaster::db::{init_database, Store};
use grillmaster::pipeline::PipelineRunner;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting grillmaster");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::from_env()?);
    info!(
        "Pipeline mode: {}",
        match config.pipeline_mode {
            grillmaster::config::PipelineMode::Mock => "mock",
            grillmaster::config::PipelineMode::Live => "live",
        }
    );
    info!("Database: {}", config.sqlite_db_path.display());

    std::fs::create_dir_all(&config.projects_dir)?;

    let pool = init_database(&config.sqlite_db_path).await?;
    let store = Store::new(pool);

    // The runner sweeps interrupted tasks before accepting work.
    let runner = PipelineRunner::start(store.clone(), Arc::clone(&config)).await?;

    let state = AppState {
        store,
        runner,
        config: Arc::clone(&config),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
