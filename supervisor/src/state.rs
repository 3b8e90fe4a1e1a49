use std::sync::Arc;

use anyhow::Context;
use shared::Config;

use crate::facade::Supervisor;
use crate::services::readiness::ManualReadiness;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Flipped by the login flow; see `Supervisor::on_session_ready`.
    pub readiness: Arc<ManualReadiness>,
    pub supervisor: Supervisor,
}

impl AppState {
    pub async fn new() -> Result<Self, anyhow::Error> {
        let config = Config::from_env()?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self, anyhow::Error> {
        let readiness = Arc::new(ManualReadiness::from_config(&config));
        let supervisor = Supervisor::new(config.clone(), readiness.clone())
            .context("Failed to initialize strategy supervisor")?;
        tracing::info!(
            "Strategies in {}, logs in {}",
            config.strategies_dir.display(),
            config.log_dir.display()
        );
        Ok(AppState {
            config,
            readiness,
            supervisor,
        })
    }
}
