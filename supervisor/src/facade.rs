//! The `Supervisor`: single entry point for every strategy state change.
//!
//! Manual commands and scheduler callbacks go through the same `start` /
//! `stop` paths, so both serialize on the one `ProcessRegistry`.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tracing::{error, info};

use shared::{
    Config, ConfigStore, EncryptedFileSecretStore, EnvStore, Result, SecretStore, StrategyConfig,
    SupervisorClock,
};

use crate::services::launcher::{self, ProcessLauncher};
use crate::services::logs::LogCatalog;
use crate::services::readiness::{ManualReadiness, ReadinessGate, ReadinessProvider};
use crate::services::recovery::{self, RecoveryReport};
use crate::services::registry::ProcessRegistry;
use crate::services::scheduler::{JobAction, JobKind, Scheduler};
use crate::services::terminator::{platform_terminator, TerminationTimeouts, Terminator};

pub(crate) struct Inner {
    pub config: Config,
    pub clock: SupervisorClock,
    pub configs: ConfigStore,
    pub env: EnvStore,
    pub secrets: Arc<dyn SecretStore>,
    pub registry: ProcessRegistry,
    pub launcher: ProcessLauncher,
    pub terminator: Box<dyn Terminator>,
    pub readiness: ReadinessGate,
    pub scheduler: Scheduler,
    pub logs: LogCatalog,
    /// Boot-time recovery found no broker session and still has to run.
    pub recovery_deferred: AtomicBool,
}

/// Cheap to clone; all clones share one registry and one set of stores.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) inner: Arc<Inner>,
}

pub struct SupervisorBuilder {
    config: Config,
    readiness: Option<Arc<dyn ReadinessProvider>>,
    secrets: Option<Arc<dyn SecretStore>>,
    terminator: Option<Box<dyn Terminator>>,
    timeouts: TerminationTimeouts,
}

impl SupervisorBuilder {
    pub fn readiness(mut self, provider: Arc<dyn ReadinessProvider>) -> Self {
        self.readiness = Some(provider);
        self
    }

    pub fn secrets(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    pub fn terminator(mut self, terminator: Box<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn termination_timeouts(mut self, timeouts: TerminationTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> Result<Supervisor> {
        let config = self.config;
        let clock = SupervisorClock::from_name(&config.timezone)?;

        let configs = ConfigStore::load(config.config_file())?;
        let env = EnvStore::new(config.env_file());
        let secrets: Arc<dyn SecretStore> = match self.secrets {
            Some(store) => store,
            None => Arc::new(EncryptedFileSecretStore::open(
                config.secure_env_file(),
                config.key_file(),
            )?),
        };
        let readiness = self
            .readiness
            .unwrap_or_else(|| Arc::new(ManualReadiness::from_config(&config)));
        let terminator = self
            .terminator
            .unwrap_or_else(|| platform_terminator(self.timeouts));

        let inner = Inner {
            clock,
            configs,
            env,
            secrets,
            registry: ProcessRegistry::new(),
            launcher: ProcessLauncher::new(&config, clock),
            terminator,
            readiness: ReadinessGate::new(readiness),
            scheduler: Scheduler::new(clock),
            logs: LogCatalog::new(config.log_dir.clone(), clock),
            recovery_deferred: AtomicBool::new(false),
            config,
        };
        Ok(Supervisor {
            inner: Arc::new(inner),
        })
    }
}

impl Supervisor {
    pub fn builder(config: Config) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            readiness: None,
            secrets: None,
            terminator: None,
            timeouts: TerminationTimeouts::default(),
        }
    }

    pub fn new(config: Config, readiness: Arc<dyn ReadinessProvider>) -> Result<Self> {
        Self::builder(config).readiness(readiness).build()
    }

    /// Prepare directories, re-register persisted schedules and reconcile
    /// persisted running state with the OS. Must run inside a tokio runtime.
    pub async fn bootstrap(&self) -> Result<RecoveryReport> {
        std::fs::create_dir_all(self.inner.config.scripts_dir())?;
        std::fs::create_dir_all(&self.inner.config.log_dir)?;

        let restored = self.restore_schedules();
        if restored > 0 {
            info!("Restored schedules for {} strategies", restored);
        }

        let report = recovery::recover(self).await;
        info!(
            "Strategy recovery complete: {} adopted, {} restarted, {} failed, {} waiting{}",
            report.adopted.len(),
            report.restarted.len(),
            report.failed.len(),
            report.waiting.len(),
            if report.deferred { " (deferred until login)" } else { "" }
        );
        Ok(report)
    }

    fn restore_schedules(&self) -> usize {
        let mut restored = 0;
        for config in self.inner.configs.all() {
            if let (true, Some(spec)) = (config.is_scheduled, config.schedule.as_ref()) {
                self.inner.scheduler.schedule(
                    &config.id,
                    spec,
                    self.job_action(JobKind::Start, config.id.clone()),
                    self.job_action(JobKind::Stop, config.id.clone()),
                );
                restored += 1;
            }
        }
        restored
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn clock(&self) -> SupervisorClock {
        self.inner.clock
    }

    pub fn strategy(&self, id: &str) -> Result<StrategyConfig> {
        self.inner.configs.require(id)
    }

    pub fn strategies(&self) -> Vec<StrategyConfig> {
        self.inner.configs.all()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Write the config snapshot; failures are logged, never propagated.
    pub(crate) fn persist(&self) {
        if let Err(e) = self.inner.configs.save() {
            error!("Failed to save strategy configs: {}", e);
        }
    }

    /// Environment for a child of `id`: plain vars overlaid with secrets.
    pub(crate) fn child_env(&self, id: &str) -> BTreeMap<String, String> {
        let regular = self.inner.env.regular(id);
        let secure = self.inner.secrets.load(id);
        launcher::child_environment(&regular, &secure)
    }

    /// Scheduler callback with `strategy_id` bound by value. Holds only a weak
    /// reference so pending jobs do not keep a dropped supervisor alive.
    pub(crate) fn job_action(&self, kind: JobKind, strategy_id: String) -> JobAction {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            let weak = weak.clone();
            let id = strategy_id.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let supervisor = Supervisor { inner };
                let result = match kind {
                    JobKind::Start => supervisor.start(&id).await,
                    JobKind::Stop => supervisor.stop(&id).await,
                };
                if let Err(e) = result {
                    error!("Scheduled {:?} of strategy {} failed: {}", kind, id, e);
                }
            }
            .boxed()
        })
    }
}
