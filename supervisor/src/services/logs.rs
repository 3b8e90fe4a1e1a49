//! Per-run log files of a strategy: `<id>_<YYYYmmdd_HHMMSS>.log`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{error, info};

use shared::{Result, SupervisorClock, SupervisorError};

#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub name: String,
    pub size_bytes: u64,
    pub modified: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestLog {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearedLogs {
    pub cleared_count: usize,
    pub total_bytes: u64,
}

pub struct LogCatalog {
    dir: PathBuf,
    clock: SupervisorClock,
}

impl LogCatalog {
    pub fn new(dir: impl Into<PathBuf>, clock: SupervisorClock) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    fn pattern(strategy_id: &str) -> Option<Regex> {
        Regex::new(&format!(r"^{}_\d{{8}}_\d{{6}}\.log$", regex::escape(strategy_id))).ok()
    }

    /// Log files of `strategy_id`, newest first.
    pub fn list(&self, strategy_id: &str) -> Vec<LogFileInfo> {
        self.entries(strategy_id).into_iter().map(|(_, info)| info).collect()
    }

    fn entries(&self, strategy_id: &str) -> Vec<(PathBuf, LogFileInfo)> {
        let Some(pattern) = Self::pattern(strategy_id) else {
            return Vec::new();
        };
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut entries: Vec<(PathBuf, LogFileInfo, SystemTime)> = dir
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !pattern.is_match(&name) {
                    return None;
                }
                let meta = entry.metadata().ok()?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let info = LogFileInfo {
                    name,
                    size_bytes: meta.len(),
                    modified: self.clock.localize(&DateTime::<Utc>::from(modified)).fixed_offset(),
                };
                Some((entry.path(), info, modified))
            })
            .collect();

        // Names embed the start time, so they break ties within one mtime tick.
        entries.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| b.1.name.cmp(&a.1.name)));
        entries.into_iter().map(|(path, info, _)| (path, info)).collect()
    }

    pub fn latest_path(&self, strategy_id: &str) -> Option<PathBuf> {
        self.entries(strategy_id).into_iter().next().map(|(path, _)| path)
    }

    pub fn read_latest(&self, strategy_id: &str) -> Result<LatestLog> {
        let (path, info) = self
            .entries(strategy_id)
            .into_iter()
            .next()
            .ok_or_else(|| SupervisorError::NotFound(format!("No log files found for {}", strategy_id)))?;
        let raw = fs::read(&path)?;
        Ok(LatestLog {
            name: info.name,
            content: String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    /// Delete the logs of `strategy_id`. `active` is truncated with a banner
    /// instead, since a running child still writes to it.
    pub fn clear(&self, strategy_id: &str, active: Option<&Path>) -> Result<ClearedLogs> {
        let entries = self.entries(strategy_id);
        if entries.is_empty() {
            return Err(SupervisorError::NotFound(format!(
                "No log files found to clear for {}",
                strategy_id
            )));
        }

        let total_bytes: u64 = entries.iter().map(|(_, info)| info.size_bytes).sum();
        let mut cleared_count = 0;
        for (path, info) in entries {
            let is_active = active
                .and_then(|a| a.file_name())
                .map(|name| name.to_string_lossy() == info.name)
                .unwrap_or(false);

            let result = if is_active {
                self.truncate_with_banner(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => cleared_count += 1,
                Err(e) => error!("Error clearing log file {}: {}", info.name, e),
            }
        }

        info!(
            "Cleared {} log files for strategy {} ({:.2} MB)",
            cleared_count,
            strategy_id,
            total_bytes as f64 / (1024.0 * 1024.0)
        );
        Ok(ClearedLogs {
            cleared_count,
            total_bytes,
        })
    }

    fn truncate_with_banner(&self, path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
        writeln!(file, "=== Log cleared at {} ===", self.clock.format(&self.clock.now()))
    }
}
