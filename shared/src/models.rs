use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// Prefix of the error message written when a start is refused by the readiness gate.
pub const DEPENDENCY_NOT_MET_PREFIX: &str = "Master contract dependency not met";
/// Error message written by recovery when the broker is known but not ready.
pub const WAITING_FOR_DEPENDENCY_MESSAGE: &str = "Waiting for master contracts to be downloaded";

/// Persisted state of one uploaded strategy.
///
/// `pid` is only set while `is_running`, and `is_error` never coexists with
/// `is_running`. Use the `mark_*` helpers instead of touching the flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub name: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub is_scheduled: bool,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    pub created_at: DateTime<FixedOffset>,
    #[serde(default)]
    pub last_started: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub last_stopped: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_time: Option<DateTime<FixedOffset>>,
}

impl StrategyConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
        created_at: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            file_path: file_path.into(),
            is_running: false,
            is_scheduled: false,
            schedule: None,
            created_at,
            last_started: None,
            last_stopped: None,
            last_modified: None,
            pid: None,
            is_error: false,
            error_message: None,
            error_time: None,
        }
    }

    pub fn mark_running(&mut self, pid: u32, at: DateTime<FixedOffset>) {
        self.is_running = true;
        self.pid = Some(pid);
        self.last_started = Some(at);
        self.clear_error();
    }

    pub fn mark_stopped(&mut self, at: DateTime<FixedOffset>) {
        self.is_running = false;
        self.pid = None;
        self.last_stopped = Some(at);
    }

    /// Process vanished without a Stop call.
    pub fn mark_exited(&mut self) {
        self.is_running = false;
        self.pid = None;
    }

    pub fn mark_error(&mut self, message: impl Into<String>, at: DateTime<FixedOffset>) {
        self.is_running = false;
        self.pid = None;
        self.is_error = true;
        self.error_message = Some(message.into());
        self.error_time = Some(at);
    }

    pub fn clear_error(&mut self) {
        self.is_error = false;
        self.error_message = None;
        self.error_time = None;
    }

    /// Errored only because the readiness gate was closed at the time.
    pub fn is_waiting_for_dependency(&self) -> bool {
        self.is_error
            && self
                .error_message
                .as_deref()
                .map(|m| {
                    m.starts_with(DEPENDENCY_NOT_MET_PREFIX) || m.starts_with(WAITING_FOR_DEPENDENCY_MESSAGE)
                })
                .unwrap_or(false)
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Weekday codes accepted in a schedule (`mon` .. `sun`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayCode {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayCode {
    pub const BUSINESS_DAYS: [DayCode; 5] = [DayCode::Mon, DayCode::Tue, DayCode::Wed, DayCode::Thu, DayCode::Fri];

    pub fn weekday(self) -> Weekday {
        match self {
            DayCode::Mon => Weekday::Mon,
            DayCode::Tue => Weekday::Tue,
            DayCode::Wed => Weekday::Wed,
            DayCode::Thu => Weekday::Thu,
            DayCode::Fri => Weekday::Fri,
            DayCode::Sat => Weekday::Sat,
            DayCode::Sun => Weekday::Sun,
        }
    }

    pub fn from_weekday(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayCode::Mon,
            Weekday::Tue => DayCode::Tue,
            Weekday::Wed => DayCode::Wed,
            Weekday::Thu => DayCode::Thu,
            Weekday::Fri => DayCode::Fri,
            Weekday::Sat => DayCode::Sat,
            Weekday::Sun => DayCode::Sun,
        }
    }

    pub fn parse(code: &str) -> Result<Self> {
        match code.trim().to_lowercase().as_str() {
            "mon" => Ok(DayCode::Mon),
            "tue" => Ok(DayCode::Tue),
            "wed" => Ok(DayCode::Wed),
            "thu" => Ok(DayCode::Thu),
            "fri" => Ok(DayCode::Fri),
            "sat" => Ok(DayCode::Sat),
            "sun" => Ok(DayCode::Sun),
            other => Err(SupervisorError::InvalidState(format!("Unknown weekday code: {}", other))),
        }
    }
}

/// Daily trigger window in the supervisor timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(default, with = "hhmm_opt")]
    pub stop_time: Option<NaiveTime>,
    #[serde(default = "default_days")]
    pub days: Vec<DayCode>,
}

fn default_days() -> Vec<DayCode> {
    DayCode::BUSINESS_DAYS.to_vec()
}

impl ScheduleSpec {
    /// Build from the textual form used by callers: `"09:16"`, `Some("15:14")`, `["mon", ...]`.
    /// An empty day list falls back to business days.
    pub fn parse(start: &str, stop: Option<&str>, days: &[&str]) -> Result<Self> {
        let start_time = parse_hhmm(start)?;
        let stop_time = match stop {
            Some(s) if !s.trim().is_empty() => Some(parse_hhmm(s)?),
            _ => None,
        };
        let days = if days.is_empty() {
            default_days()
        } else {
            days.iter().map(|d| DayCode::parse(d)).collect::<Result<Vec<_>>>()?
        };
        let spec = Self {
            start_time,
            stop_time,
            days,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.days.is_empty() {
            return Err(SupervisorError::InvalidState(
                "Schedule needs at least one weekday".to_string(),
            ));
        }
        if self.stop_time == Some(self.start_time) {
            return Err(SupervisorError::InvalidState(
                "Schedule start and stop time must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn runs_on(&self, day: Weekday) -> bool {
        self.days.iter().any(|d| d.weekday() == day)
    }
}

pub fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| SupervisorError::InvalidState(format!("Invalid time '{}', expected HH:MM", value)))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }
}

mod hhmm_opt {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => s.serialize_some(&t.format("%H:%M").to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        match raw {
            Some(r) if !r.trim().is_empty() => super::parse_hhmm(&r).map(Some).map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Environment variables of one strategy as shown to callers.
/// Secure values never leave the secret store, only their key names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSet {
    pub regular: BTreeMap<String, String>,
    pub secure_keys: Vec<String>,
    /// True while the strategy runs; writes are rejected in that state.
    pub read_only: bool,
}
