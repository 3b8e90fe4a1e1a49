use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use shared::{ScheduleSpec, StrategyConfig};

use crate::facade::Supervisor;
use crate::services::registry::HandleInfo;

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessSummary {
    pub ready: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategySummary {
    pub id: String,
    pub name: String,
    pub file_name: String,
    pub is_running: bool,
    pub is_scheduled: bool,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub error_time: Option<String>,
    pub schedule: Option<ScheduleSpec>,
    pub created_at: DateTime<FixedOffset>,
    pub last_started: Option<DateTime<FixedOffset>>,
    pub last_stopped: Option<DateTime<FixedOffset>>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running_count: usize,
    pub total_count: usize,
    pub scheduler_running: bool,
    pub current_time: String,
    pub platform: &'static str,
    pub readiness: ReadinessSummary,
    pub strategies: Vec<StrategySummary>,
}

impl Supervisor {
    /// Snapshot of every strategy. Dead processes are reaped first.
    pub fn status(&self) -> StatusReport {
        self.reap_dead();

        let inner = &self.inner;
        let readiness = inner.readiness.check();
        let handles = inner.registry.snapshot();
        let strategies: Vec<StrategySummary> = inner
            .configs
            .all()
            .into_iter()
            .map(|config| {
                let handle = handles.iter().find(|h| h.strategy_id == config.id);
                self.summarize(config, handle)
            })
            .collect();

        StatusReport {
            running_count: handles.len(),
            total_count: strategies.len(),
            scheduler_running: inner.scheduler.is_running(),
            current_time: inner.clock.format_time(&inner.clock.now()),
            platform: std::env::consts::OS,
            readiness: ReadinessSummary {
                ready: readiness.ready,
                message: readiness.reason,
            },
            strategies,
        }
    }

    fn summarize(&self, config: StrategyConfig, handle: Option<&HandleInfo>) -> StrategySummary {
        let clock = self.inner.clock;
        StrategySummary {
            file_name: config.file_name(),
            error_time: config.error_time.map(|t| clock.format(&t)),
            started_at: handle.map(|h| h.started_at),
            log_file: handle
                .and_then(|h| h.log_file_path.as_ref())
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            id: config.id,
            name: config.name,
            is_running: config.is_running,
            is_scheduled: config.is_scheduled,
            is_error: config.is_error,
            error_message: config.error_message,
            schedule: config.schedule,
            created_at: config.created_at,
            last_started: config.last_started,
            last_stopped: config.last_stopped,
            pid: config.pid,
        }
    }
}
