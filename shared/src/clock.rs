//! Supervisor clock pinned to a single timezone.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SupervisorError};

/// Every timestamp the supervisor produces or interprets goes through this
/// clock, so schedules and persisted times agree on one timezone.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorClock {
    tz: Tz,
}

impl SupervisorClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Parse an IANA name such as `Asia/Kolkata`.
    pub fn from_name(name: &str) -> Result<Self> {
        let tz: Tz = name
            .parse()
            .map_err(|e| SupervisorError::Config(format!("Invalid timezone '{}': {}", name, e)))?;
        Ok(Self { tz })
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// Current time in the persisted representation.
    pub fn now_fixed(&self) -> DateTime<FixedOffset> {
        self.now().fixed_offset()
    }

    pub fn localize<T: TimeZone>(&self, dt: &DateTime<T>) -> DateTime<Tz> {
        dt.with_timezone(&self.tz)
    }

    /// `2025-01-06 09:16:00 IST`
    pub fn format<T: TimeZone>(&self, dt: &DateTime<T>) -> String {
        self.localize(dt).format("%Y-%m-%d %H:%M:%S %Z").to_string()
    }

    /// `09:16:00 IST`
    pub fn format_time<T: TimeZone>(&self, dt: &DateTime<T>) -> String {
        self.localize(dt).format("%H:%M:%S %Z").to_string()
    }
}

impl Default for SupervisorClock {
    fn default() -> Self {
        Self::new(chrono_tz::Asia::Kolkata)
    }
}
