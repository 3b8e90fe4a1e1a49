//! Graceful, then forceful, termination of a strategy and its subtree.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use shared::{Result, SupervisorError};

use super::registry::RunningHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct TerminationTimeouts {
    /// Wait after the polite signal.
    pub graceful: Duration,
    /// Wait after the forceful kill.
    pub forceful: Duration,
    /// Wait after signalling a process tree one pid at a time.
    pub tree: Duration,
}

impl Default for TerminationTimeouts {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(5),
            forceful: Duration::from_secs(2),
            tree: Duration::from_secs(3),
        }
    }
}

#[async_trait]
pub trait Terminator: Send + Sync {
    /// Stop the process behind `handle` and everything it spawned.
    ///
    /// `Ok(true)` means a running process was stopped, `Ok(false)` that it had
    /// already exited. The handle's log file is closed in every case.
    async fn terminate(&self, handle: &mut RunningHandle) -> Result<bool>;
}

/// Terminator for the platform this binary was built for.
#[cfg(unix)]
pub fn platform_terminator(timeouts: TerminationTimeouts) -> Box<dyn Terminator> {
    Box::new(UnixTerminator::new(timeouts))
}

#[cfg(windows)]
pub fn platform_terminator(timeouts: TerminationTimeouts) -> Box<dyn Terminator> {
    Box::new(WindowsTerminator::new(timeouts))
}

async fn wait_for_exit(handle: &mut RunningHandle, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if handle.has_exited() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
pub use unix::UnixTerminator;

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::services::probe;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    pub struct UnixTerminator {
        timeouts: TerminationTimeouts,
    }

    impl UnixTerminator {
        pub fn new(timeouts: TerminationTimeouts) -> Self {
            Self { timeouts }
        }

        /// Signal the whole group led by the strategy process.
        async fn stop_group(&self, handle: &mut RunningHandle) -> Result<bool> {
            let group = Pid::from_raw(handle.os_pid as i32);
            match killpg(group, Signal::SIGTERM) {
                Ok(()) => {}
                Err(e) => {
                    warn!("SIGTERM to process group {} failed: {}", handle.os_pid, e);
                    return self.stop_tree(handle).await;
                }
            }
            if wait_for_exit(handle, self.timeouts.graceful).await {
                return Ok(true);
            }

            warn!(
                "Strategy {} did not exit after SIGTERM, sending SIGKILL to group {}",
                handle.strategy_id, handle.os_pid
            );
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                if e != Errno::ESRCH {
                    warn!("SIGKILL to process group {} failed: {}", handle.os_pid, e);
                }
            }
            if wait_for_exit(handle, self.timeouts.forceful).await {
                return Ok(true);
            }
            Err(SupervisorError::TerminationTimeout(format!(
                "process group {} still alive after SIGKILL",
                handle.os_pid
            )))
        }

        /// Signal the process and each descendant individually.
        async fn stop_tree(&self, handle: &mut RunningHandle) -> Result<bool> {
            let children = probe::descendants(handle.os_pid);
            for pid in children.iter().copied().chain(std::iter::once(handle.os_pid)) {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }

            let deadline = Instant::now() + self.timeouts.tree;
            loop {
                let children_gone = children.iter().all(|pid| !probe::is_alive(*pid));
                if handle.has_exited() && children_gone {
                    return Ok(true);
                }
                if Instant::now() >= deadline {
                    break;
                }
                sleep(POLL_INTERVAL).await;
            }

            for pid in children.iter().copied().chain(std::iter::once(handle.os_pid)) {
                if probe::is_alive(pid) {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
            }
            if wait_for_exit(handle, self.timeouts.forceful).await {
                return Ok(true);
            }
            Err(SupervisorError::TerminationTimeout(format!(
                "pid {} still alive after SIGKILL",
                handle.os_pid
            )))
        }
    }

    fn leads_own_group(pid: u32) -> bool {
        getpgid(Some(Pid::from_raw(pid as i32)))
            .map(|group| group.as_raw() == pid as i32)
            .unwrap_or(false)
    }

    #[async_trait]
    impl Terminator for UnixTerminator {
        async fn terminate(&self, handle: &mut RunningHandle) -> Result<bool> {
            let result = if handle.has_exited() {
                Ok(false)
            } else if leads_own_group(handle.os_pid) {
                self.stop_group(handle).await
            } else {
                self.stop_tree(handle).await
            };
            handle.close_log();
            if let Ok(true) = result {
                info!("🛑 Stopped strategy {} (pid {})", handle.strategy_id, handle.os_pid);
            }
            result
        }
    }
}

#[cfg(windows)]
pub use windows::WindowsTerminator;

#[cfg(windows)]
mod windows {
    use super::*;

    pub struct WindowsTerminator {
        timeouts: TerminationTimeouts,
    }

    impl WindowsTerminator {
        pub fn new(timeouts: TerminationTimeouts) -> Self {
            Self { timeouts }
        }

        async fn taskkill(pid: u32, force: bool) {
            let pid = pid.to_string();
            let mut cmd = tokio::process::Command::new("taskkill");
            if force {
                cmd.arg("/F");
            }
            cmd.args(["/T", "/PID", pid.as_str()]);
            if let Err(e) = cmd.output().await {
                warn!("taskkill for pid {} failed: {}", pid, e);
            }
        }
    }

    #[async_trait]
    impl Terminator for WindowsTerminator {
        async fn terminate(&self, handle: &mut RunningHandle) -> Result<bool> {
            let result = if handle.has_exited() {
                Ok(false)
            } else {
                Self::taskkill(handle.os_pid, false).await;
                if wait_for_exit(handle, self.timeouts.graceful).await {
                    Ok(true)
                } else {
                    Self::taskkill(handle.os_pid, true).await;
                    if wait_for_exit(handle, self.timeouts.forceful).await {
                        Ok(true)
                    } else {
                        Err(SupervisorError::TerminationTimeout(format!(
                            "pid {} still alive after taskkill /F",
                            handle.os_pid
                        )))
                    }
                }
            };
            handle.close_log();
            if let Ok(true) = result {
                info!("🛑 Stopped strategy {} (pid {})", handle.strategy_id, handle.os_pid);
            }
            result
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn fast() -> TerminationTimeouts {
        TerminationTimeouts {
            graceful: Duration::from_secs(2),
            forceful: Duration::from_secs(1),
            tree: Duration::from_secs(1),
        }
    }

    fn ts() -> chrono::DateTime<FixedOffset> {
        FixedOffset::east_opt(19800)
            .unwrap()
            .with_ymd_and_hms(2025, 1, 6, 9, 16, 0)
            .unwrap()
    }

    fn spawn_sleeper(group: bool) -> tokio::process::Child {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "sleep 30"]).kill_on_drop(false);
        if group {
            cmd.process_group(0);
        }
        cmd.spawn().unwrap()
    }

    #[tokio::test]
    async fn test_terminates_process_group() {
        let child = spawn_sleeper(true);
        let pid = child.id().unwrap();
        let log = tempfile::tempfile().unwrap();
        let mut handle = RunningHandle::spawned("sleeper", child, pid, ts(), "x.log".into(), log);

        let terminator = UnixTerminator::new(fast());
        assert!(terminator.terminate(&mut handle).await.unwrap());
        assert!(handle.has_exited());
        assert!(handle.log_file.is_none());
    }

    #[tokio::test]
    async fn test_already_dead_is_success() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        let log = tempfile::tempfile().unwrap();
        let mut handle = RunningHandle::spawned("done", child, pid, ts(), "x.log".into(), log);

        let terminator = UnixTerminator::new(fast());
        assert!(!terminator.terminate(&mut handle).await.unwrap());
        assert!(!terminator.terminate(&mut handle).await.unwrap());
        assert!(handle.log_file.is_none());
    }

    #[tokio::test]
    async fn test_terminates_without_own_group() {
        let child = spawn_sleeper(false);
        let pid = child.id().unwrap();
        let log = tempfile::tempfile().unwrap();
        let mut handle = RunningHandle::spawned("plain", child, pid, ts(), "x.log".into(), log);

        let terminator = UnixTerminator::new(fast());
        assert!(terminator.terminate(&mut handle).await.unwrap());
        assert!(handle.has_exited());
    }
}
