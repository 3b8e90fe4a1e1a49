use std::path::PathBuf;
use std::time::Duration;

use dotenv::dotenv;

use crate::clock::SupervisorClock;

#[cfg(windows)]
const DEFAULT_INTERPRETER: &str = "python";
#[cfg(not(windows))]
const DEFAULT_INTERPRETER: &str = "python3";

#[derive(Debug, Clone)]
pub struct Config {
    pub strategies_dir: PathBuf,
    pub log_dir: PathBuf,
    pub keys_dir: PathBuf,
    pub timezone: String,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub reaper_interval: Duration,
    pub stop_on_shutdown: bool,
    pub active_broker: Option<String>,
    pub master_contract_ready: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenv().ok();

        let config = Config {
            strategies_dir: std::env::var("STRATEGIES_DIR")
                .unwrap_or_else(|_| "strategies".to_string())
                .into(),
            log_dir: std::env::var("STRATEGY_LOG_DIR")
                .unwrap_or_else(|_| "log/strategies".to_string())
                .into(),
            keys_dir: std::env::var("KEYS_DIR")
                .unwrap_or_else(|_| "keys".to_string())
                .into(),
            timezone: std::env::var("SUPERVISOR_TZ").unwrap_or_else(|_| "Asia/Kolkata".to_string()),
            interpreter: std::env::var("STRATEGY_INTERPRETER")
                .unwrap_or_else(|_| DEFAULT_INTERPRETER.to_string()),
            interpreter_args: std::env::var("STRATEGY_INTERPRETER_ARGS")
                .unwrap_or_else(|_| "-u".to_string())
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            reaper_interval: Duration::from_secs(
                std::env::var("REAPER_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            stop_on_shutdown: std::env::var("STOP_ON_SHUTDOWN")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            active_broker: std::env::var("ACTIVE_BROKER")
                .ok()
                .filter(|b| !b.trim().is_empty()),
            master_contract_ready: std::env::var("MASTER_CONTRACT_READY")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        };

        // Fail early on a bad timezone instead of at the first schedule.
        config.clock()?;
        Ok(config)
    }

    /// Layout rooted at `root`, used by tests and embedded callers.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Config {
            strategies_dir: root.join("strategies"),
            log_dir: root.join("log").join("strategies"),
            keys_dir: root.join("keys"),
            timezone: "Asia/Kolkata".to_string(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            interpreter_args: vec!["-u".to_string()],
            reaper_interval: Duration::from_secs(30),
            stop_on_shutdown: true,
            active_broker: None,
            master_contract_ready: false,
        }
    }

    pub fn clock(&self) -> Result<SupervisorClock, anyhow::Error> {
        Ok(SupervisorClock::from_name(&self.timezone)?)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.strategies_dir.join("scripts")
    }

    pub fn config_file(&self) -> PathBuf {
        self.strategies_dir.join("strategy_configs.json")
    }

    pub fn env_file(&self) -> PathBuf {
        self.strategies_dir.join("strategy_env.json")
    }

    pub fn secure_env_file(&self) -> PathBuf {
        self.strategies_dir.join(".secure_env")
    }

    pub fn key_file(&self) -> PathBuf {
        self.keys_dir.join(".encryption_key")
    }
}
