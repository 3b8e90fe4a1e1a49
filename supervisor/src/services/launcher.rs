//! Spawns one strategy script as an isolated child process.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use shared::{Config, Result, SpawnFailureKind, SupervisorClock, SupervisorError};

use super::registry::RunningHandle;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct ProcessLauncher {
    interpreter: String,
    interpreter_args: Vec<String>,
    log_dir: PathBuf,
    clock: SupervisorClock,
}

impl ProcessLauncher {
    pub fn new(config: &Config, clock: SupervisorClock) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            log_dir: config.log_dir.clone(),
            clock,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Spawn `file_path` under the configured interpreter with `env` layered
    /// on top of the supervisor's own environment. The caller registers the
    /// returned handle.
    pub fn launch(
        &self,
        strategy_id: &str,
        file_path: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<RunningHandle> {
        let script = check_script(file_path)?;

        fs::create_dir_all(&self.log_dir).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => SupervisorError::PermissionDenied(format!(
                "Cannot create log directory {}: {}",
                self.log_dir.display(),
                e
            )),
            _ => SupervisorError::Io(e),
        })?;

        let started_at = self.clock.now();
        let log_file_path = self.log_dir.join(format!(
            "{}_{}.log",
            strategy_id,
            started_at.format("%Y%m%d_%H%M%S")
        ));
        let mut log_file = open_log(&log_file_path)?;
        let _ = writeln!(log_file, "=== Strategy Started at {} ===", self.clock.format(&started_at));
        let _ = writeln!(log_file, "=== Platform: {} ===", std::env::consts::OS);
        let _ = writeln!(log_file);
        let _ = log_file.flush();

        let stdout = log_file.try_clone()?;
        let stderr = log_file.try_clone()?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args)
            .arg(&script)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = classify_spawn_error(&e);
                let _ = writeln!(log_file, "=== Failed to start: {} ===", e);
                // log_file is dropped (closed) here
                return Err(err);
            }
        };

        let Some(os_pid) = child.id() else {
            return Err(SupervisorError::spawn(
                SpawnFailureKind::Other,
                "process exited before its pid could be read",
            ));
        };

        info!(
            "✅ Started strategy {} (pid {}), logging to {}",
            strategy_id,
            os_pid,
            log_file_path.display()
        );

        Ok(RunningHandle::spawned(
            strategy_id,
            child,
            os_pid,
            started_at.fixed_offset(),
            log_file_path,
            log_file,
        ))
    }
}

/// Existing, readable, and (on Unix) executable. Returns the absolute path.
fn check_script(file_path: &Path) -> Result<PathBuf> {
    if !file_path.exists() {
        return Err(SupervisorError::NotFound(format!(
            "Strategy file not found: {}",
            file_path.display()
        )));
    }
    if let Err(e) = File::open(file_path) {
        return Err(match e.kind() {
            io::ErrorKind::PermissionDenied => SupervisorError::PermissionDenied(format!(
                "Strategy file {} is not readable",
                file_path.display()
            )),
            _ => SupervisorError::Io(e),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(file_path)?.permissions().mode();
        if mode & 0o111 == 0 {
            warn!(
                "Strategy file {} is not executable, setting execute permission",
                file_path.display()
            );
            if let Err(e) = fs::set_permissions(file_path, fs::Permissions::from_mode(mode | 0o755)) {
                warn!("Could not set execute permission on {}: {}", file_path.display(), e);
            }
        }
    }

    Ok(fs::canonicalize(file_path).unwrap_or_else(|_| file_path.to_path_buf()))
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                SupervisorError::PermissionDenied(format!("Cannot open log file {}: {}", path.display(), e))
            }
            _ => SupervisorError::Io(e),
        })
}

/// Map a spawn error onto the error taxonomy. Failures while placing the
/// child in its own group are reported separately so callers can retry.
pub fn classify_spawn_error(err: &io::Error) -> SupervisorError {
    let message = err.to_string();
    if err.kind() == io::ErrorKind::PermissionDenied {
        return SupervisorError::PermissionDenied(message);
    }
    let lowered = message.to_lowercase();
    if ["pre_exec", "preexec", "setpgid", "setsid", "process group"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return SupervisorError::spawn(SpawnFailureKind::ProcessGroupSetup, message);
    }
    if err.raw_os_error().is_some() {
        return SupervisorError::spawn(SpawnFailureKind::Os, message);
    }
    SupervisorError::spawn(SpawnFailureKind::Other, message)
}

/// Regular variables overlaid with secure ones; secure wins on collision.
pub fn child_environment(
    regular: &BTreeMap<String, String>,
    secure: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = regular.clone();
    for (key, value) in secure {
        env.insert(key.clone(), value.clone());
    }
    env
}
