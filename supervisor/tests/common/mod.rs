#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shared::Config;
use supervisor::{ManualReadiness, Supervisor, TerminationTimeouts};
use tempfile::TempDir;

pub const BROKER: &str = "zerodha";

/// Keeps running until signalled.
pub const LONG_RUNNING: &str = "echo started\nwhile true; do sleep 1; done\n";

pub struct Sandbox {
    pub dir: TempDir,
    pub readiness: Arc<ManualReadiness>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            readiness: Arc::new(ManualReadiness::ready_for(BROKER)),
        }
    }

    pub fn config(&self) -> Config {
        let mut config = Config::rooted_at(self.dir.path());
        config.interpreter = "sh".to_string();
        config.interpreter_args = Vec::new();
        config
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::builder(self.config())
            .readiness(self.readiness.clone())
            .termination_timeouts(TerminationTimeouts {
                graceful: Duration::from_secs(2),
                forceful: Duration::from_secs(1),
                tree: Duration::from_secs(1),
            })
            .build()
            .unwrap()
    }
}

/// Poll `check` every 50ms for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Liveness as seen by the test: zombies count as dead.
pub fn pid_alive(pid: u32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        return stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(true);
    }
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// SIGKILL the process group led by `pid`.
pub fn kill_group(pid: u32) {
    let _ = std::process::Command::new("kill")
        .arg("-9")
        .arg("--")
        .arg(format!("-{}", pid))
        .status();
}
