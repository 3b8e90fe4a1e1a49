//! Boot-time reconciliation of persisted running state with the OS.

use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{info, warn};

use shared::{StrategyConfig, SupervisorError, WAITING_FOR_DEPENDENCY_MESSAGE};

use crate::facade::Supervisor;
use crate::services::probe;
use crate::services::readiness::ReadinessKind;
use crate::services::registry::RunningHandle;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// No broker session yet; nothing was touched.
    pub deferred: bool,
    pub adopted: Vec<String>,
    pub restarted: Vec<String>,
    pub failed: Vec<String>,
    pub waiting: Vec<String>,
}

pub(crate) async fn recover(supervisor: &Supervisor) -> RecoveryReport {
    let inner = &supervisor.inner;
    let mut report = RecoveryReport::default();

    let candidates: Vec<StrategyConfig> = inner
        .configs
        .all()
        .into_iter()
        .filter(|c| c.is_running)
        .collect();
    if candidates.is_empty() {
        inner.recovery_deferred.store(false, Ordering::SeqCst);
        return report;
    }

    let readiness = inner.readiness.check();
    match readiness.kind {
        ReadinessKind::NoBroker => {
            info!(
                "No broker session yet, deferring recovery of {} strategies",
                candidates.len()
            );
            inner.recovery_deferred.store(true, Ordering::SeqCst);
            report.deferred = true;
            return report;
        }
        ReadinessKind::NotReady { broker } => {
            warn!(
                "Master contracts not ready for {}, marking {} strategies as waiting",
                broker,
                candidates.len()
            );
            let now = inner.clock.now_fixed();
            for config in &candidates {
                let _ = inner
                    .configs
                    .update(&config.id, |c| c.mark_error(WAITING_FOR_DEPENDENCY_MESSAGE, now));
                report.waiting.push(config.id.clone());
            }
            inner.recovery_deferred.store(false, Ordering::SeqCst);
            supervisor.persist();
            return report;
        }
        ReadinessKind::Ready => {}
    }

    for config in candidates {
        let id = config.id.clone();
        if inner.registry.is_busy(&id) {
            continue;
        }

        if let Some(pid) = config.pid {
            if probe::is_alive(pid) {
                if probe::runs_script(pid, &config.file_path) {
                    let started_at = config.last_started.unwrap_or_else(|| inner.clock.now_fixed());
                    let handle =
                        RunningHandle::adopted(id.clone(), pid, started_at, inner.logs.latest_path(&id));
                    if inner.registry.put(handle).is_ok() {
                        info!("✅ Adopted running strategy {} (pid {})", id, pid);
                        report.adopted.push(id);
                        continue;
                    }
                } else {
                    let mismatch = SupervisorError::RecoveryMismatch(format!(
                        "pid {} is alive but does not run {}",
                        pid,
                        config.file_path.display()
                    ));
                    warn!("Strategy {}: {}", id, mismatch);
                }
            }
        }

        let _ = inner.configs.update(&id, |c| c.mark_exited());
        match supervisor.start_inner(&id, true).await {
            Ok(()) => {
                info!("✅ Restarted strategy {} after supervisor restart", id);
                report.restarted.push(id);
            }
            Err(SupervisorError::DependencyNotReady(_)) => report.waiting.push(id),
            Err(e) => {
                let now = inner.clock.now_fixed();
                let _ = inner
                    .configs
                    .update(&id, |c| c.mark_error(format!("Failed to restart: {}", e), now));
                report.failed.push(id);
            }
        }
    }

    inner.recovery_deferred.store(false, Ordering::SeqCst);
    supervisor.persist();
    report
}
