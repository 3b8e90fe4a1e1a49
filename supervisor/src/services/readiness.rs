//! Start precondition: the active broker's master contracts are downloaded.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use shared::Config;

/// Answers for the broker-session layer, which lives outside this crate.
pub trait ReadinessProvider: Send + Sync {
    /// Broker of the current session, if anyone is logged in.
    fn active_broker(&self) -> Option<String>;

    fn is_master_contract_ready(&self, broker: &str) -> bool;
}

#[derive(Default)]
struct ManualState {
    broker: Option<String>,
    ready: HashSet<String>,
}

/// Provider whose answers are set explicitly, seeded from `Config`.
#[derive(Default)]
pub struct ManualReadiness {
    state: RwLock<ManualState>,
}

impl ManualReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let provider = Self::new();
        provider.set_broker(config.active_broker.as_deref());
        if let Some(broker) = &config.active_broker {
            provider.set_ready(broker, config.master_contract_ready);
        }
        provider
    }

    /// Logged in to `broker` with contracts already downloaded.
    pub fn ready_for(broker: &str) -> Self {
        let provider = Self::new();
        provider.set_broker(Some(broker));
        provider.set_ready(broker, true);
        provider
    }

    pub fn set_broker(&self, broker: Option<&str>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.broker = broker.map(str::to_string);
    }

    pub fn set_ready(&self, broker: &str, ready: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if ready {
            state.ready.insert(broker.to_string());
        } else {
            state.ready.remove(broker);
        }
    }
}

impl ReadinessProvider for ManualReadiness {
    fn active_broker(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .broker
            .clone()
    }

    fn is_master_contract_ready(&self, broker: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
            .contains(broker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReadinessKind {
    Ready,
    NoBroker,
    NotReady { broker: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub reason: String,
    pub kind: ReadinessKind,
}

#[derive(Clone)]
pub struct ReadinessGate {
    provider: Arc<dyn ReadinessProvider>,
}

impl ReadinessGate {
    pub fn new(provider: Arc<dyn ReadinessProvider>) -> Self {
        Self { provider }
    }

    /// State of the dependency without any bootstrap allowance.
    pub fn check(&self) -> Readiness {
        let Some(broker) = self.provider.active_broker() else {
            return Readiness {
                ready: false,
                reason: "No broker session found".to_string(),
                kind: ReadinessKind::NoBroker,
            };
        };
        if self.provider.is_master_contract_ready(&broker) {
            Readiness {
                ready: true,
                reason: "Master contracts ready".to_string(),
                kind: ReadinessKind::Ready,
            }
        } else {
            Readiness {
                ready: false,
                reason: format!("Master contracts not ready for broker: {}", broker),
                kind: ReadinessKind::NotReady { broker },
            }
        }
    }

    /// Whether `strategy_id` may start now. With `skip_on_bootstrap`, a
    /// missing broker session lets the start through.
    pub fn is_ready(&self, strategy_id: &str, skip_on_bootstrap: bool) -> Readiness {
        let readiness = self.check();
        match readiness.kind {
            ReadinessKind::NoBroker if skip_on_bootstrap => {
                info!(
                    "No broker found during startup, skipping master contract check for {}",
                    strategy_id
                );
                Readiness {
                    ready: true,
                    reason: "Skipping check during startup".to_string(),
                    kind: ReadinessKind::NoBroker,
                }
            }
            ReadinessKind::Ready => readiness,
            _ => {
                warn!("Strategy {} blocked: {}", strategy_id, readiness.reason);
                readiness
            }
        }
    }
}
