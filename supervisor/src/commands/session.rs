use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{info, warn};

use shared::Config;

use crate::facade::Supervisor;
use crate::services::recovery::{self, RecoveryReport};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeReport {
    pub started: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub recovery: Option<RecoveryReport>,
    pub resumed: ResumeReport,
}

/// What happens to running strategies when the supervisor exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    StopAll,
    /// Leave the processes running for the next boot to adopt.
    Detach,
}

impl ShutdownMode {
    pub fn from_config(config: &Config) -> Self {
        if config.stop_on_shutdown {
            ShutdownMode::StopAll
        } else {
            ShutdownMode::Detach
        }
    }
}

impl Supervisor {
    /// Start the strategies that errored only because the readiness gate was
    /// closed, provided it is open now.
    pub async fn resume_pending(&self) -> ResumeReport {
        let mut report = ResumeReport::default();
        let readiness = self.inner.readiness.check();
        if !readiness.ready {
            info!("Not resuming waiting strategies: {}", readiness.reason);
            return report;
        }

        let pending: Vec<String> = self
            .inner
            .configs
            .all()
            .into_iter()
            .filter(|c| c.is_waiting_for_dependency() && !c.is_running)
            .map(|c| c.id)
            .collect();

        // A successful start clears the waiting error; a refused one keeps it.
        for id in pending {
            match self.start_inner(&id, false).await {
                Ok(()) => {
                    info!("✅ Resumed strategy {}", id);
                    report.started.push(id);
                }
                Err(e) => {
                    warn!("Could not resume strategy {}: {}", id, e);
                    report.failed.push(id);
                }
            }
        }

        if !report.started.is_empty() || !report.failed.is_empty() {
            self.persist();
            info!(
                "Resumed {} strategies, {} failed",
                report.started.len(),
                report.failed.len()
            );
        }
        report
    }

    /// Post-login hook: run a recovery deferred at boot, then resume the
    /// strategies waiting on the readiness gate.
    pub async fn on_session_ready(&self) -> SessionReport {
        let recovery = if self.inner.recovery_deferred.load(Ordering::SeqCst) {
            info!("Broker session available, running deferred recovery");
            Some(recovery::recover(self).await)
        } else {
            None
        };
        let resumed = self.resume_pending().await;
        SessionReport { recovery, resumed }
    }

    pub async fn shutdown(&self, mode: ShutdownMode) {
        self.inner.scheduler.shutdown();

        match mode {
            ShutdownMode::StopAll => {
                for info in self.inner.registry.snapshot() {
                    if let Err(e) = self.stop(&info.strategy_id).await {
                        warn!("Failed to stop strategy {} on shutdown: {}", info.strategy_id, e);
                    }
                }
            }
            ShutdownMode::Detach => {
                for mut handle in self.inner.registry.drain() {
                    handle.close_log();
                    info!(
                        "Leaving strategy {} (pid {}) running",
                        handle.strategy_id, handle.os_pid
                    );
                }
            }
        }

        self.persist();
        info!("🛑 Supervisor shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shared::DEPENDENCY_NOT_MET_PREFIX;

    use super::*;
    use crate::services::readiness::ManualReadiness;

    #[tokio::test]
    async fn test_refused_resume_keeps_strategy_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::builder(Config::rooted_at(dir.path()))
            .readiness(Arc::new(ManualReadiness::ready_for("zerodha")))
            .build()
            .unwrap();
        let id = supervisor.upload("Waiting", b"sleep 30\n").unwrap();
        let now = supervisor.clock().now_fixed();
        supervisor
            .inner
            .configs
            .update(&id, |c| {
                c.mark_error(format!("{}: broker offline", DEPENDENCY_NOT_MET_PREFIX), now)
            })
            .unwrap();

        // An in-flight start elsewhere makes this one InvalidState.
        let held = supervisor.registry().reserve(&id).unwrap();
        let report = supervisor.resume_pending().await;
        drop(held);

        assert!(report.started.is_empty());
        assert_eq!(report.failed, vec![id.clone()]);
        let config = supervisor.strategy(&id).unwrap();
        assert!(config.is_waiting_for_dependency());
        assert!(!config.is_running);
    }
}
