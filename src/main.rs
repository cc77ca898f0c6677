use std::sync::Arc;
use std::time::Duration;

use taskboard_server::config::{generate_config_template, Config};
use taskboard_server::db;
use taskboard_server::routes::build_router;
use taskboard_server::state::AppState;
use taskboard_server::store::Store;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskboard_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        port = config.port,
        bind = %config.bind_address,
        data_dir = %config.data_dir,
        "Starting task board realtime server"
    );

    let pool = db::init_db(&config.data_dir)?;
    let store = Store::new(Arc::clone(&pool));
    store.seed_if_empty().await?;

    let state = AppState::new(store, Duration::from_secs(config.ring_timeout_secs));
    let app = build_router(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}
