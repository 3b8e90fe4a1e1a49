//! Strategy process supervisor: runs user scripts as isolated child
//! processes, on demand or on a daily schedule, and reconciles their state
//! across supervisor restarts.

pub mod commands;
mod facade;
pub mod logging;
pub mod services;
pub mod state;

pub use commands::{
    ExportedScript, ReadinessSummary, ResumeReport, SessionReport, ShutdownMode, StatusReport,
    StrategySummary,
};
pub use facade::{Supervisor, SupervisorBuilder};
pub use services::logs::{ClearedLogs, LatestLog, LogFileInfo};
pub use services::readiness::{ManualReadiness, Readiness, ReadinessKind, ReadinessProvider};
pub use services::recovery::RecoveryReport;
pub use services::terminator::TerminationTimeouts;
pub use state::AppState;
