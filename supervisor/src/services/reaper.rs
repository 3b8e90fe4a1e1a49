//! Health sweep: the only path that moves a strategy out of "running"
//! without a stop request.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::facade::Supervisor;

impl Supervisor {
    /// Drop handles whose process has exited and clear their running flag.
    /// Returns the affected strategy ids.
    pub fn reap_dead(&self) -> Vec<String> {
        let dead = self.inner.registry.reap_exited();
        if dead.is_empty() {
            return Vec::new();
        }

        let mut ids = Vec::with_capacity(dead.len());
        for mut handle in dead {
            handle.close_log();
            info!(
                "Strategy {} (pid {}) exited on its own",
                handle.strategy_id, handle.os_pid
            );
            // A newer run may already own the config.
            let pid = handle.os_pid;
            let _ = self.inner.configs.update(&handle.strategy_id, |c| {
                if c.pid == Some(pid) {
                    c.mark_exited();
                }
            });
            ids.push(handle.strategy_id);
        }
        self.persist();
        info!("Cleaned up {} dead processes", ids.len());
        ids
    }

    /// Run `reap_dead` every `interval` until the supervisor is dropped or
    /// the task is aborted.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Supervisor dropped, reaper exiting");
                    return;
                };
                Supervisor { inner }.reap_dead();
            }
        })
    }
}
