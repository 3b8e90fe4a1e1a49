use tracing::{info, warn};

use shared::{Result, StrategyConfig, SupervisorError, DEPENDENCY_NOT_MET_PREFIX};

use crate::facade::Supervisor;
use crate::services::probe;
use crate::services::registry::{RunningHandle, StopClaim};

impl Supervisor {
    /// Start `id` now. Refused while it runs, and marked as errored when the
    /// readiness gate is closed or the launch fails.
    pub async fn start(&self, id: &str) -> Result<()> {
        let result = self.start_inner(id, false).await;
        if !matches!(result, Err(SupervisorError::NotFound(_))) {
            self.persist();
        }
        result
    }

    /// Start without persisting, so callers can batch the write.
    pub(crate) async fn start_inner(&self, id: &str, skip_on_bootstrap: bool) -> Result<()> {
        let inner = &self.inner;
        let config = inner.configs.require(id)?;
        let reservation = inner.registry.reserve(id)?;

        if let Some(pid) = config.pid.filter(|_| config.is_running) {
            if probe::is_alive(pid) && probe::runs_script(pid, &config.file_path) {
                return Err(SupervisorError::InvalidState(format!(
                    "Strategy {} is already running as unmanaged pid {}",
                    id, pid
                )));
            }
        }

        let readiness = inner.readiness.is_ready(id, skip_on_bootstrap);
        if !readiness.ready {
            self.record_error(id, format!("{}: {}", DEPENDENCY_NOT_MET_PREFIX, readiness.reason));
            return Err(SupervisorError::DependencyNotReady(readiness.reason));
        }

        let env = self.child_env(id);
        let handle = match inner.launcher.launch(id, &config.file_path, &env) {
            Ok(handle) => handle,
            Err(e) => {
                self.record_error(id, format!("Failed to start: {}", e));
                return Err(e);
            }
        };

        let pid = handle.os_pid;
        let started_at = handle.started_at;
        reservation.commit(handle);

        if let Err(e) = inner.configs.update(id, |c| c.mark_running(pid, started_at)) {
            warn!("Strategy {} started but its config vanished: {}", id, e);
        }
        Ok(())
    }

    /// Stop `id`. Stopping something that is not running is a no-op, and a
    /// termination that times out is logged and treated as done.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let inner = &self.inner;
        let config = inner.configs.require(id)?;

        let now = inner.clock.now_fixed();
        let was_running = match inner.registry.claim_for_stop(id) {
            StopClaim::Claimed(mut handle) => {
                let outcome = inner.terminator.terminate(&mut handle).await;
                if let Err(e) = outcome {
                    warn!("Stopping strategy {} was not clean: {}", id, e);
                }
                // Still holding the Stopping slot, so no new run can commit yet.
                let _ = inner.configs.update(id, |c| c.mark_stopped(now));
                inner.registry.finish_stop(id);
                true
            }
            StopClaim::AlreadyStopping => {
                info!("Strategy {} is already being stopped", id);
                return Ok(());
            }
            StopClaim::Starting => {
                return Err(SupervisorError::InvalidState(format!(
                    "Strategy {} is starting, try again shortly",
                    id
                )));
            }
            StopClaim::Absent => {
                let stopped_pid = config.pid.filter(|_| config.is_running);
                self.stop_unmanaged(&config).await;
                let _ = inner.configs.update(id, |c| match stopped_pid {
                    Some(pid) if c.pid == Some(pid) => c.mark_stopped(now),
                    Some(_) => {}
                    None if !c.is_running => c.mark_exited(),
                    None => {}
                });
                stopped_pid.is_some()
            }
        };

        self.persist();
        if was_running {
            info!("Strategy {} stopped", id);
        }
        Ok(())
    }

    /// A persisted pid with no handle: terminate it only if it still runs
    /// this strategy's script.
    async fn stop_unmanaged(&self, config: &StrategyConfig) {
        let Some(pid) = config.pid else {
            return;
        };
        if !probe::is_alive(pid) {
            return;
        }
        if !probe::runs_script(pid, &config.file_path) {
            warn!(
                "Pid {} recorded for {} no longer runs {}, leaving it alone",
                pid,
                config.id,
                config.file_path.display()
            );
            return;
        }
        // Hold the slot so no start races the kill.
        let Ok(_slot) = self.inner.registry.reserve(&config.id) else {
            return;
        };
        let mut handle = RunningHandle::adopted(
            config.id.clone(),
            pid,
            config.last_started.unwrap_or_else(|| self.inner.clock.now_fixed()),
            None,
        );
        if let Err(e) = self.inner.terminator.terminate(&mut handle).await {
            warn!("Stopping unmanaged pid {} for {} was not clean: {}", pid, config.id, e);
        }
    }

    pub(crate) fn record_error(&self, id: &str, message: String) {
        let now = self.inner.clock.now_fixed();
        warn!("Strategy {} error: {}", id, message);
        let _ = self.inner.configs.update(id, |c| c.mark_error(message, now));
    }

    /// Clear the error flag of a stopped strategy.
    pub fn clear_error(&self, id: &str) -> Result<()> {
        let config = self.inner.configs.require(id)?;
        if config.is_running || self.inner.registry.is_busy(id) {
            return Err(SupervisorError::InvalidState(
                "Cannot clear error state while strategy is running".to_string(),
            ));
        }
        if !config.is_error {
            return Err(SupervisorError::InvalidState(
                "Strategy is not in error state".to_string(),
            ));
        }
        self.inner.configs.update(id, |c| c.clear_error())?;
        self.inner.configs.save()?;
        info!("Cleared error state for strategy {}", id);
        Ok(())
    }
}
