use tracing::info;

use shared::{Result, ScheduleSpec, SupervisorError};

use crate::facade::Supervisor;
use crate::services::scheduler::JobKind;

impl Supervisor {
    fn ensure_schedule_editable(&self, id: &str) -> Result<()> {
        let config = self.inner.configs.require(id)?;
        if config.is_running || self.inner.registry.is_busy(id) {
            return Err(SupervisorError::InvalidState(format!(
                "Stop strategy {} before changing its schedule",
                id
            )));
        }
        Ok(())
    }

    /// Run `id` daily per `spec`, replacing any previous schedule.
    pub fn schedule(&self, id: &str, spec: ScheduleSpec) -> Result<()> {
        spec.validate()?;
        self.ensure_schedule_editable(id)?;

        self.inner.scheduler.schedule(
            id,
            &spec,
            self.job_action(JobKind::Start, id.to_string()),
            self.job_action(JobKind::Stop, id.to_string()),
        );
        self.inner.configs.update(id, |c| {
            c.is_scheduled = true;
            c.schedule = Some(spec);
        })?;
        self.inner.configs.save()?;
        Ok(())
    }

    pub fn unschedule(&self, id: &str) -> Result<()> {
        self.ensure_schedule_editable(id)?;
        self.inner.scheduler.unschedule(id);
        self.inner.configs.update(id, |c| {
            c.is_scheduled = false;
            c.schedule = None;
        })?;
        self.inner.configs.save()?;
        info!("Schedule removed for strategy {}", id);
        Ok(())
    }
}
