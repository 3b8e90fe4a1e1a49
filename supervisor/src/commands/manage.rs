use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

use shared::{fs_util, Result, StrategyConfig, SupervisorError};

use crate::facade::Supervisor;

#[derive(Debug, Clone, Serialize)]
pub struct ExportedScript {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// `"Chartink Long!"` -> `"chartink_long"`.
pub fn slugify(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let slug = match Regex::new(r"[^a-z0-9]+") {
        Ok(re) => re.replace_all(&lowered, "_").into_owned(),
        Err(_) => lowered,
    };
    let slug = slug.trim_matches('_').to_string();
    if slug.is_empty() {
        "strategy".to_string()
    } else {
        slug
    }
}

fn backup_path(script: &Path) -> PathBuf {
    script.with_extension("bak")
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o755)) {
        warn!("Could not set execute permission on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

impl Supervisor {
    fn ensure_not_running(&self, config: &StrategyConfig, action: &str) -> Result<()> {
        if config.is_running || self.inner.registry.is_busy(&config.id) {
            return Err(SupervisorError::InvalidState(format!(
                "Cannot {} while strategy is running. Stop it first",
                action
            )));
        }
        Ok(())
    }

    /// Store a new script and register it. Returns the new strategy id.
    pub fn upload(&self, name: &str, content: &[u8]) -> Result<String> {
        if name.trim().is_empty() {
            return Err(SupervisorError::InvalidState("Strategy name is required".to_string()));
        }
        if content.is_empty() {
            return Err(SupervisorError::InvalidState("Strategy file is empty".to_string()));
        }

        let now = self.inner.clock.now();
        let base = format!("{}_{}", slugify(name), now.format("%Y%m%d%H%M%S"));
        let scripts_dir = self.inner.config.scripts_dir();
        fs::create_dir_all(&scripts_dir)?;

        let reserved = self.inner.configs.insert_unique(&base, |id| {
            StrategyConfig::new(
                id,
                name.trim(),
                scripts_dir.join(format!("{}.py", id)),
                now.fixed_offset(),
            )
        });
        let id = reserved.id;

        if let Err(e) = fs::write(&reserved.file_path, content) {
            self.inner.configs.remove(&id);
            return Err(e.into());
        }
        make_executable(&reserved.file_path);
        if let Ok(path) = fs::canonicalize(&reserved.file_path) {
            let _ = self.inner.configs.update(&id, |c| c.file_path = path);
        }
        self.inner.configs.save()?;
        info!("Uploaded strategy {} ({})", id, name.trim());
        Ok(id)
    }

    /// Replace the script of a stopped strategy, keeping the old one as `<id>.bak`.
    pub fn edit(&self, id: &str, content: &[u8]) -> Result<()> {
        let config = self.inner.configs.require(id)?;
        self.ensure_not_running(&config, "edit")?;
        if content.is_empty() {
            return Err(SupervisorError::InvalidState("Strategy file is empty".to_string()));
        }

        if config.file_path.exists() {
            fs::copy(&config.file_path, backup_path(&config.file_path))?;
        }
        fs_util::write_atomic(&config.file_path, content)?;
        make_executable(&config.file_path);

        let now = self.inner.clock.now_fixed();
        self.inner.configs.update(id, |c| c.last_modified = Some(now))?;
        self.inner.configs.save()?;
        info!("Strategy {} updated", id);
        Ok(())
    }

    pub fn export(&self, id: &str) -> Result<ExportedScript> {
        let config = self.inner.configs.require(id)?;
        let content = fs::read(&config.file_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SupervisorError::NotFound(format!(
                "Strategy file not found: {}",
                config.file_path.display()
            )),
            _ => SupervisorError::Io(e),
        })?;
        Ok(ExportedScript {
            file_name: config.file_name(),
            content,
        })
    }

    /// Stop, unschedule and forget `id`, including its script and env vars.
    /// Run logs are kept.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let config = self.inner.configs.require(id)?;

        self.stop(id).await?;
        self.inner.scheduler.unschedule(id);

        for path in [config.file_path.clone(), backup_path(&config.file_path)] {
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    error!("Failed to delete file {}: {}", path.display(), e);
                }
            }
        }

        self.inner.configs.remove(id);
        self.inner.configs.save()?;
        if let Err(e) = self.inner.env.remove(id) {
            error!("Failed to remove env variables of {}: {}", id, e);
        }
        if let Err(e) = self.inner.secrets.remove(id) {
            error!("Failed to remove secure env variables of {}: {}", id, e);
        }
        info!("Strategy {} deleted", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Chartink Long"), "chartink_long");
        assert_eq!(slugify("  EMA-crossover v2!! "), "ema_crossover_v2");
        assert_eq!(slugify("***"), "strategy");
    }

    #[test]
    fn test_concurrent_uploads_keep_every_strategy() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::builder(shared::Config::rooted_at(dir.path()))
            .build()
            .unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let supervisor = supervisor.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let content = format!("echo {}\n", i);
                    (supervisor.upload("Dup", content.as_bytes()).unwrap(), content)
                })
            })
            .collect();
        let uploads: Vec<(String, String)> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        let mut ids: Vec<&String> = uploads.iter().map(|(id, _)| id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(supervisor.strategies().len(), 8);
        for (id, content) in &uploads {
            assert_eq!(supervisor.export(id).unwrap().content, content.as_bytes());
        }
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/s/scripts/alpha_20250106091600.py")),
            PathBuf::from("/s/scripts/alpha_20250106091600.bak")
        );
    }
}
