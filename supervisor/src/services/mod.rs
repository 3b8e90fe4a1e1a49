pub mod launcher;
pub mod logs;
pub mod probe;
pub mod readiness;
pub mod reaper;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod terminator;
