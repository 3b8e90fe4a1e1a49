use shared::Result;

use crate::facade::Supervisor;
use crate::services::logs::{ClearedLogs, LatestLog, LogFileInfo};

impl Supervisor {
    pub fn list_logs(&self, id: &str) -> Result<Vec<LogFileInfo>> {
        self.inner.configs.require(id)?;
        Ok(self.inner.logs.list(id))
    }

    pub fn read_latest_log(&self, id: &str) -> Result<LatestLog> {
        self.inner.configs.require(id)?;
        self.inner.logs.read_latest(id)
    }

    /// Delete old logs; the log of a live run is truncated instead.
    pub fn clear_logs(&self, id: &str) -> Result<ClearedLogs> {
        self.inner.configs.require(id)?;
        let active = self
            .inner
            .registry
            .get(id)
            .and_then(|handle| handle.log_file_path);
        self.inner.logs.clear(id, active.as_deref())
    }
}
