pub mod env;
pub mod lifecycle;
pub mod logs;
pub mod manage;
pub mod schedule;
pub mod session;
pub mod status;

pub use manage::ExportedScript;
pub use session::{ResumeReport, SessionReport, ShutdownMode};
pub use status::{ReadinessSummary, StatusReport, StrategySummary};
