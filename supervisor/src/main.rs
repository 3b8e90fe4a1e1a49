use anyhow::Result;
use dotenv::dotenv;
use supervisor::{logging, AppState, ShutdownMode};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    logging::init();

    tracing::info!(
        "Starting strategy supervisor {} ({}@{}, built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_BRANCH").unwrap_or("unknown"),
        option_env!("GIT_HASH").unwrap_or("unknown"),
        option_env!("BUILD_TIME").unwrap_or("unknown")
    );

    let app_state = AppState::new().await?;
    tracing::info!("AppState initialized");

    let supervisor = app_state.supervisor.clone();
    let report = supervisor.bootstrap().await?;
    if report.deferred {
        tracing::info!("Waiting for a broker session before recovering strategies");
    }

    let reaper = supervisor.spawn_reaper(app_state.config.reaper_interval);
    tracing::info!(
        "✅ Supervisor running, {} strategies configured",
        supervisor.strategies().len()
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    reaper.abort();
    supervisor
        .shutdown(ShutdownMode::from_config(&app_state.config))
        .await;
    Ok(())
}
