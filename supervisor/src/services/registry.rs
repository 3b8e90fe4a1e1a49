//! In-memory table of strategies with a live child process.
//!
//! One mutex guards the whole table. It is only held around map mutation,
//! never across a spawn or a kill, so a slow strategy cannot block another.
//! A slot is claimed (`Starting` / `Stopping`) before the slow work begins,
//! which is what makes concurrent starts or stops of one id lose cleanly.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tokio::process::Child;

use shared::{Result, SupervisorError};

use super::probe;

/// How the supervisor holds on to the OS process.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Spawned by this supervisor; exit status is collected through the child.
    Spawned(Child),
    /// Found alive at boot and verified; tracked by pid only.
    Adopted,
}

#[derive(Debug)]
pub struct RunningHandle {
    pub strategy_id: String,
    pub os_pid: u32,
    pub process: ProcessHandle,
    pub started_at: DateTime<FixedOffset>,
    pub log_file_path: Option<PathBuf>,
    pub log_file: Option<File>,
}

impl RunningHandle {
    pub fn spawned(
        strategy_id: impl Into<String>,
        child: Child,
        os_pid: u32,
        started_at: DateTime<FixedOffset>,
        log_file_path: PathBuf,
        log_file: File,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            os_pid,
            process: ProcessHandle::Spawned(child),
            started_at,
            log_file_path: Some(log_file_path),
            log_file: Some(log_file),
        }
    }

    pub fn adopted(
        strategy_id: impl Into<String>,
        os_pid: u32,
        started_at: DateTime<FixedOffset>,
        log_file_path: Option<PathBuf>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            os_pid,
            process: ProcessHandle::Adopted,
            started_at,
            log_file_path,
            log_file: None,
        }
    }

    pub fn is_adopted(&self) -> bool {
        matches!(self.process, ProcessHandle::Adopted)
    }

    /// Non-blocking exit check. Collects the exit status of spawned children
    /// so they do not linger as zombies.
    pub fn has_exited(&mut self) -> bool {
        match &mut self.process {
            ProcessHandle::Spawned(child) => match child.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(_) => !probe::is_alive(self.os_pid),
            },
            ProcessHandle::Adopted => !probe::is_alive(self.os_pid),
        }
    }

    pub fn close_log(&mut self) {
        if let Some(file) = self.log_file.take() {
            let _ = file.sync_all();
        }
    }

    pub fn info(&self) -> HandleInfo {
        HandleInfo {
            strategy_id: self.strategy_id.clone(),
            os_pid: self.os_pid,
            started_at: self.started_at,
            log_file_path: self.log_file_path.clone(),
            adopted: self.is_adopted(),
        }
    }
}

/// Copy of a handle's metadata, safe to use without the registry lock.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub strategy_id: String,
    pub os_pid: u32,
    pub started_at: DateTime<FixedOffset>,
    pub log_file_path: Option<PathBuf>,
    pub adopted: bool,
}

enum Slot {
    Starting,
    Running(RunningHandle),
    Stopping,
}

/// Outcome of trying to claim a slot for a stop.
pub enum StopClaim {
    Claimed(RunningHandle),
    AlreadyStopping,
    Starting,
    Absent,
}

#[derive(Default)]
pub struct ProcessRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id` for a start. Dropping the reservation without committing
    /// releases the slot again.
    pub fn reserve(&self, id: &str) -> Result<Reservation<'_>> {
        let mut slots = self.lock();
        match slots.get(id) {
            Some(Slot::Running(_)) | Some(Slot::Starting) => Err(SupervisorError::InvalidState(format!(
                "Strategy {} is already running",
                id
            ))),
            Some(Slot::Stopping) => Err(SupervisorError::InvalidState(format!(
                "Strategy {} is being stopped",
                id
            ))),
            None => {
                slots.insert(id.to_string(), Slot::Starting);
                Ok(Reservation {
                    registry: self,
                    id: id.to_string(),
                    committed: false,
                })
            }
        }
    }

    /// Register a handle that did not come from `reserve` (adoption at boot).
    pub fn put(&self, handle: RunningHandle) -> Result<()> {
        let mut slots = self.lock();
        if slots.contains_key(&handle.strategy_id) {
            return Err(SupervisorError::InvalidState(format!(
                "Strategy {} already has a registered process",
                handle.strategy_id
            )));
        }
        slots.insert(handle.strategy_id.clone(), Slot::Running(handle));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<HandleInfo> {
        match self.lock().get(id) {
            Some(Slot::Running(handle)) => Some(handle.info()),
            _ => None,
        }
    }

    /// True while the id is starting, running or stopping.
    pub fn is_busy(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Move the handle out for termination, leaving a `Stopping` marker.
    pub fn claim_for_stop(&self, id: &str) -> StopClaim {
        let mut slots = self.lock();
        match slots.remove(id) {
            Some(Slot::Running(handle)) => {
                slots.insert(id.to_string(), Slot::Stopping);
                StopClaim::Claimed(handle)
            }
            Some(Slot::Stopping) => {
                slots.insert(id.to_string(), Slot::Stopping);
                StopClaim::AlreadyStopping
            }
            Some(Slot::Starting) => {
                slots.insert(id.to_string(), Slot::Starting);
                StopClaim::Starting
            }
            None => StopClaim::Absent,
        }
    }

    pub fn finish_stop(&self, id: &str) {
        let mut slots = self.lock();
        if matches!(slots.get(id), Some(Slot::Stopping)) {
            slots.remove(id);
        }
    }

    /// Remove a running handle without terminating it.
    pub fn remove(&self, id: &str) -> Option<RunningHandle> {
        let mut slots = self.lock();
        match slots.remove(id) {
            Some(Slot::Running(handle)) => Some(handle),
            Some(other) => {
                slots.insert(id.to_string(), other);
                None
            }
            None => None,
        }
    }

    pub fn snapshot(&self) -> Vec<HandleInfo> {
        let mut infos: Vec<HandleInfo> = self
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(handle) => Some(handle.info()),
                _ => None,
            })
            .collect();
        infos.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        infos
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count()
    }

    /// Remove and return every running handle whose process has exited.
    pub fn reap_exited(&self) -> Vec<RunningHandle> {
        let mut slots = self.lock();
        let dead: Vec<String> = slots
            .iter_mut()
            .filter_map(|(id, slot)| match slot {
                Slot::Running(handle) => handle.has_exited().then(|| id.clone()),
                _ => None,
            })
            .collect();

        dead.into_iter()
            .filter_map(|id| match slots.remove(&id) {
                Some(Slot::Running(handle)) => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// Remove every running handle, leaving in-flight starts and stops alone.
    pub fn drain(&self) -> Vec<RunningHandle> {
        let mut slots = self.lock();
        let ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| match slots.remove(&id) {
                Some(Slot::Running(handle)) => Some(handle),
                _ => None,
            })
            .collect()
    }
}

/// A claimed `Starting` slot.
pub struct Reservation<'a> {
    registry: &'a ProcessRegistry,
    id: String,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self, handle: RunningHandle) {
        let mut slots = self.registry.lock();
        slots.insert(self.id.clone(), Slot::Running(handle));
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = self.registry.lock();
        if matches!(slots.get(&self.id), Some(Slot::Starting)) {
            slots.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(19800)
            .unwrap()
            .with_ymd_and_hms(2025, 1, 6, 9, 16, 0)
            .unwrap()
    }

    fn adopted(id: &str) -> RunningHandle {
        RunningHandle::adopted(id, std::process::id(), ts(), None)
    }

    #[test]
    fn test_second_reservation_is_rejected() {
        let registry = ProcessRegistry::new();
        let first = registry.reserve("alpha").unwrap();
        let second = registry.reserve("alpha");
        assert!(matches!(second, Err(SupervisorError::InvalidState(_))));

        first.commit(adopted("alpha"));
        assert!(registry.reserve("alpha").is_err());
        assert_eq!(registry.running_count(), 1);
    }

    #[test]
    fn test_dropped_reservation_frees_slot() {
        let registry = ProcessRegistry::new();
        {
            let _reservation = registry.reserve("alpha").unwrap();
            assert!(registry.is_busy("alpha"));
        }
        assert!(!registry.is_busy("alpha"));
        assert!(registry.reserve("alpha").is_ok());
    }

    #[test]
    fn test_stop_claim_lifecycle() {
        let registry = ProcessRegistry::new();
        registry.put(adopted("alpha")).unwrap();

        let claim = registry.claim_for_stop("alpha");
        assert!(matches!(claim, StopClaim::Claimed(_)));
        assert!(matches!(registry.claim_for_stop("alpha"), StopClaim::AlreadyStopping));
        assert!(registry.reserve("alpha").is_err());
        assert!(registry.get("alpha").is_none());

        registry.finish_stop("alpha");
        assert!(matches!(registry.claim_for_stop("alpha"), StopClaim::Absent));
    }

    #[test]
    fn test_put_rejects_duplicate() {
        let registry = ProcessRegistry::new();
        registry.put(adopted("alpha")).unwrap();
        assert!(registry.put(adopted("alpha")).is_err());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_reap_removes_dead_adopted_handle() {
        let registry = ProcessRegistry::new();
        registry.put(adopted("alive")).unwrap();
        // Pid far above any default pid_max.
        registry
            .put(RunningHandle::adopted("dead", 2_000_000_000, ts(), None))
            .unwrap();

        let reaped = registry.reap_exited();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].strategy_id, "dead");
        assert!(registry.get("alive").is_some());
    }
}
